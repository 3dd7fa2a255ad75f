// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Built-in typing rules for the standard device tree properties.

use std::sync::LazyLock;

use log::error;
use regex::Regex;

use super::{PatternContext, SchemaResolver};
use crate::codec::PropertyType;

const EXACT: &[(&str, PropertyType)] = &[
    ("compatible", PropertyType::String),
    ("status", PropertyType::String),
    ("device_type", PropertyType::String),
    ("model", PropertyType::String),
    ("label", PropertyType::String),
    ("phandle", PropertyType::UInt32),
    ("linux,phandle", PropertyType::UInt32),
    ("reg", PropertyType::UInt32),
    ("ranges", PropertyType::UInt32),
    ("dma-ranges", PropertyType::UInt32),
    ("#address-cells", PropertyType::UInt32),
    ("#size-cells", PropertyType::UInt32),
    ("interrupts", PropertyType::UInt32),
    ("interrupt-parent", PropertyType::UInt32),
    ("#interrupt-cells", PropertyType::UInt32),
    ("interrupt-map", PropertyType::UInt32),
    ("interrupt-map-mask", PropertyType::UInt32),
    ("interrupt-map-pass-thru", PropertyType::UInt32),
    ("clocks", PropertyType::UInt32),
    ("clock-frequency", PropertyType::UInt32),
    ("clock-output-names", PropertyType::MultiString),
    ("memory-region", PropertyType::UInt32),
    ("iommus", PropertyType::UInt32),
    ("no-map", PropertyType::Empty),
    ("read-only", PropertyType::Empty),
    ("disabled", PropertyType::Empty),
    ("okay", PropertyType::Empty),
    ("fail", PropertyType::Empty),
    ("fail-sss", PropertyType::Empty),
];

const SUFFIXES: &[(&str, PropertyType)] = &[
    ("-names", PropertyType::MultiString),
    ("-cells", PropertyType::UInt32),
    ("-gpio", PropertyType::UInt32),
    ("-gpios", PropertyType::UInt32),
    ("-supply", PropertyType::UInt32),
    ("-phy", PropertyType::UInt32),
    ("-phys", PropertyType::UInt32),
    ("-map", PropertyType::UInt32),
    ("-mask", PropertyType::UInt32),
    ("-ranges", PropertyType::UInt32),
];

/// `(prefix, suffix, type)`: both must match.
const PREFIXES: &[(&str, &str, PropertyType)] = &[("#", "-cells", PropertyType::UInt32)];

static VENDOR_PREFIXED: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new("^.*,.*").ok());

/// Types the property `name` from its spelling alone.
///
/// Exact names are checked first, then suffixes, then prefix rules, and
/// finally vendor-prefixed names (`vendor,thing`), which are taken to be
/// strings.
#[must_use]
pub fn heuristic_type(name: &str) -> PropertyType {
    if let Some((_, ptype)) = EXACT.iter().find(|(exact, _)| *exact == name) {
        return *ptype;
    }
    if let Some((_, ptype)) = SUFFIXES.iter().find(|(suffix, _)| name.ends_with(suffix)) {
        return *ptype;
    }
    if let Some((_, _, ptype)) = PREFIXES
        .iter()
        .find(|(prefix, suffix, _)| name.starts_with(prefix) && name.ends_with(suffix))
    {
        return *ptype;
    }
    if VENDOR_PREFIXED
        .as_ref()
        .is_some_and(|regex| regex.is_match(name))
    {
        return PropertyType::String;
    }
    PropertyType::Unknown
}

impl SchemaResolver {
    /// Creates a resolver seeded with the standard structural properties and
    /// the synthetic annotation properties.
    #[must_use]
    pub fn builtin() -> Self {
        let mut schema = Self::new();
        for (name, ptype) in [
            ("#address-cells", PropertyType::UInt32),
            ("#size-cells", PropertyType::UInt32),
            ("#interrupt-cells", PropertyType::UInt32),
            ("#clock-cells", PropertyType::UInt32),
            ("phandle", PropertyType::UInt32),
            ("linux,phandle", PropertyType::UInt32),
            ("reg", PropertyType::UInt32),
            ("ranges", PropertyType::UInt32),
            ("interrupt-parent", PropertyType::UInt32),
            ("model", PropertyType::String),
            ("status", PropertyType::String),
            ("device_type", PropertyType::String),
            ("bootargs", PropertyType::String),
            ("stdout-path", PropertyType::String),
            ("sdt-preamble", PropertyType::String),
        ] {
            schema.set_global_type(name, ptype);
        }

        for (pattern, ptype) in [
            (r"sdt-comment-\d+", PropertyType::String),
            (r"sdt-label-\d+", PropertyType::String),
            (r"reg-\d+", PropertyType::UInt32),
            (r"interrupts-\d+", PropertyType::UInt32),
            (r"clock-names-\d+", PropertyType::String),
            (r".*-map-mask$", PropertyType::UInt32),
        ] {
            if let Err(e) = schema.add_pattern(pattern, ptype, PatternContext::Any) {
                error!("built-in schema pattern {pattern} rejected: {e}");
            }
        }

        for (glob, name, ptype) in [
            ("cpu@*", "device_type", PropertyType::String),
            ("cpu@*", "enable-method", PropertyType::String),
            ("memory@*", "device_type", PropertyType::String),
        ] {
            if let Err(e) = schema.set_node_pattern_type(glob, name, ptype) {
                error!("built-in node pattern {glob} rejected: {e}");
            }
        }
        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristics_order() {
        assert_eq!(heuristic_type("compatible"), PropertyType::String);
        assert_eq!(heuristic_type("reset-names"), PropertyType::MultiString);
        assert_eq!(heuristic_type("#gpio-cells"), PropertyType::UInt32);
        assert_eq!(heuristic_type("vdd-supply"), PropertyType::UInt32);
        assert_eq!(heuristic_type("no-map"), PropertyType::Empty);
        assert_eq!(heuristic_type("xlnx,ip-name"), PropertyType::String);
        // Suffixes win over the vendor prefix.
        assert_eq!(heuristic_type("xlnx,clock-names"), PropertyType::MultiString);
        assert_eq!(heuristic_type("bank-width"), PropertyType::Unknown);
    }

    #[test]
    fn builtin_patterns() {
        let schema = SchemaResolver::builtin();
        assert_eq!(schema.resolve("sdt-comment-3", None, &[]), PropertyType::String);
        assert_eq!(
            schema.resolve("enable-method", Some("/cpus/cpu@0"), &[]),
            PropertyType::String
        );
        assert_eq!(schema.resolve("#clock-cells", None, &[]), PropertyType::UInt32);
    }
}
