// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Property typing rules.
//!
//! A [`SchemaResolver`] answers "what type is property `name` of the node at
//! `path`?" from layered rule tables, consulted in priority order:
//!
//! 1. exact path entries,
//! 2. entries for one of the node's `compatible` strings,
//! 3. node-name glob entries (`cpu@*`),
//! 4. global entries,
//! 5. property-name regular expressions, optionally restricted to a context,
//! 6. the built-in name heuristics.
//!
//! Anything left over is [`PropertyType::Unknown`], and the codec falls back
//! to guessing from the byte shape.

mod builtin;
mod scan;

use log::debug;
use regex::Regex;

pub use self::builtin::heuristic_type;
pub use self::scan::{Field, RecordShape, SchemaScanner};
use crate::codec::PropertyType;
use crate::error::Result;
use crate::{OrderedMap, ordered_map};

/// Where a property-name pattern applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternContext {
    /// Everywhere.
    Any,
    /// Only on the node at this exact path.
    Path(String),
    /// Only on nodes with this `compatible` string.
    Compatible(String),
    /// Only on nodes whose path matches this node glob.
    NodePattern(String),
}

#[derive(Debug, Clone)]
struct NodePattern {
    glob: String,
    regex: Regex,
    properties: OrderedMap<PropertyType>,
}

#[derive(Debug, Clone)]
struct PropertyPattern {
    regex: Regex,
    ptype: PropertyType,
    context: PatternContext,
}

/// Layered, priority-ordered property typing rules.
#[derive(Debug, Clone)]
pub struct SchemaResolver {
    paths: OrderedMap<OrderedMap<PropertyType>>,
    compatibles: OrderedMap<OrderedMap<PropertyType>>,
    node_patterns: Vec<NodePattern>,
    globals: OrderedMap<PropertyType>,
    patterns: Vec<PropertyPattern>,
}

impl Default for SchemaResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaResolver {
    /// Creates a resolver with no tables. Only the name heuristics apply.
    #[must_use]
    pub fn new() -> Self {
        Self {
            paths: ordered_map(0),
            compatibles: ordered_map(0),
            node_patterns: Vec::new(),
            globals: ordered_map(0),
            patterns: Vec::new(),
        }
    }

    /// Returns the type of property `name` on a node at `path` with the given
    /// `compatible` strings.
    ///
    /// ```
    /// use sdt::codec::PropertyType;
    /// use sdt::schema::SchemaResolver;
    ///
    /// let schema = SchemaResolver::builtin();
    /// assert_eq!(schema.resolve("clock-names", None, &[]), PropertyType::MultiString);
    /// assert_eq!(schema.resolve("xlnx,name", None, &[]), PropertyType::String);
    /// assert_eq!(schema.resolve("mystery", None, &[]), PropertyType::Unknown);
    /// ```
    #[must_use]
    pub fn resolve(&self, name: &str, path: Option<&str>, compatible: &[String]) -> PropertyType {
        if let Some(ptype) = path
            .and_then(|path| self.paths.get(path))
            .and_then(|properties| properties.get(name))
        {
            return *ptype;
        }

        if let Some(ptype) = compatible
            .iter()
            .filter_map(|compatible| self.compatibles.get(compatible))
            .find_map(|properties| properties.get(name))
        {
            return *ptype;
        }

        if let Some(path) = path {
            if let Some(ptype) = self
                .node_patterns
                .iter()
                .filter(|pattern| pattern.regex.is_match(path))
                .find_map(|pattern| pattern.properties.get(name))
            {
                return *ptype;
            }
        }

        if let Some(ptype) = self.globals.get(name) {
            return *ptype;
        }

        for pattern in &self.patterns {
            if !pattern.regex.is_match(name) {
                continue;
            }
            let applies = match &pattern.context {
                PatternContext::Any => true,
                PatternContext::Compatible(wanted) if !compatible.is_empty() => {
                    compatible.iter().any(|compatible| compatible == wanted)
                }
                PatternContext::Path(wanted) if path.is_some() => path == Some(wanted.as_str()),
                PatternContext::NodePattern(glob) if path.is_some() => {
                    path.is_some_and(|path| matches_node_glob(path, glob))
                }
                _ => path.is_none() && compatible.is_empty(),
            };
            if applies {
                return pattern.ptype;
            }
        }

        heuristic_type(name)
    }

    /// Sets the type of `name` on the node at `path`.
    pub fn set_path_type(&mut self, path: &str, name: &str, ptype: PropertyType) {
        self.paths
            .entry(path.to_owned())
            .or_insert_with(|| ordered_map(1))
            .insert(name.to_owned(), ptype);
    }

    /// Sets the type of `name` on nodes with the `compatible` string.
    pub fn set_compatible_type(&mut self, compatible: &str, name: &str, ptype: PropertyType) {
        self.compatibles
            .entry(compatible.to_owned())
            .or_insert_with(|| ordered_map(1))
            .insert(name.to_owned(), ptype);
    }

    /// Sets the type of `name` on nodes whose path matches `glob`, where `*`
    /// matches one path component fragment (`cpu@*`, `domain@*`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pattern`](crate::Error::Pattern) if the glob does not
    /// translate to a valid regular expression.
    pub fn set_node_pattern_type(
        &mut self,
        glob: &str,
        name: &str,
        ptype: PropertyType,
    ) -> Result<()> {
        if let Some(pattern) = self.node_patterns.iter_mut().find(|p| p.glob == glob) {
            pattern.properties.insert(name.to_owned(), ptype);
            return Ok(());
        }
        let mut properties = ordered_map(1);
        properties.insert(name.to_owned(), ptype);
        self.node_patterns.push(NodePattern {
            glob: glob.to_owned(),
            regex: node_glob_regex(glob)?,
            properties,
        });
        Ok(())
    }

    /// Sets the type of `name` everywhere.
    pub fn set_global_type(&mut self, name: &str, ptype: PropertyType) {
        self.globals.insert(name.to_owned(), ptype);
    }

    /// Adds a property-name pattern. Patterns are tried in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pattern`](crate::Error::Pattern) if `pattern` is not a
    /// valid regular expression.
    pub fn add_pattern(
        &mut self,
        pattern: &str,
        ptype: PropertyType,
        context: PatternContext,
    ) -> Result<()> {
        self.patterns.push(PropertyPattern {
            regex: Regex::new(&format!("^(?:{pattern})"))?,
            ptype,
            context,
        });
        Ok(())
    }

    /// Returns the global type of `name`, if one is set.
    #[must_use]
    pub fn global_type(&self, name: &str) -> Option<PropertyType> {
        self.globals.get(name).copied()
    }

    /// Adds every entry of `other` that is not already present. Existing
    /// entries are never overwritten.
    pub fn merge(&mut self, other: &SchemaResolver) {
        let mut added = 0usize;
        for (path, properties) in &other.paths {
            let entry = self
                .paths
                .entry(path.clone())
                .or_insert_with(|| ordered_map(properties.len()));
            for (name, ptype) in properties {
                if !entry.contains_key(name) {
                    entry.insert(name.clone(), *ptype);
                    added += 1;
                }
            }
        }
        for (compatible, properties) in &other.compatibles {
            let entry = self
                .compatibles
                .entry(compatible.clone())
                .or_insert_with(|| ordered_map(properties.len()));
            for (name, ptype) in properties {
                if !entry.contains_key(name) {
                    entry.insert(name.clone(), *ptype);
                    added += 1;
                }
            }
        }
        for pattern in &other.node_patterns {
            match self.node_patterns.iter_mut().find(|p| p.glob == pattern.glob) {
                Some(existing) => {
                    for (name, ptype) in &pattern.properties {
                        if !existing.properties.contains_key(name) {
                            existing.properties.insert(name.clone(), *ptype);
                            added += 1;
                        }
                    }
                }
                None => {
                    added += pattern.properties.len();
                    self.node_patterns.push(pattern.clone());
                }
            }
        }
        for (name, ptype) in &other.globals {
            if !self.globals.contains_key(name) {
                self.globals.insert(name.clone(), *ptype);
                added += 1;
            }
        }
        for pattern in &other.patterns {
            let known = self.patterns.iter().any(|p| {
                p.regex.as_str() == pattern.regex.as_str() && p.context == pattern.context
            });
            if !known {
                self.patterns.push(pattern.clone());
                added += 1;
            }
        }
        debug!("schema merge added {added} entries");
    }
}

/// Returns `true` if the last components of `path` match the node glob.
#[must_use]
pub fn matches_node_glob(path: &str, glob: &str) -> bool {
    node_glob_regex(glob).is_ok_and(|regex| regex.is_match(path))
}

fn node_glob_regex(glob: &str) -> Result<Regex> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^/]+");
    Ok(Regex::new(&format!("^.*/{body}$"))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order() {
        let mut schema = SchemaResolver::new();
        schema.set_global_type("xlnx,id", PropertyType::UInt32);
        assert_eq!(schema.resolve("xlnx,id", None, &[]), PropertyType::UInt32);

        schema
            .set_node_pattern_type("serial@*", "xlnx,id", PropertyType::UInt8)
            .unwrap();
        assert_eq!(
            schema.resolve("xlnx,id", Some("/amba/serial@ff00"), &[]),
            PropertyType::UInt8
        );
        assert_eq!(
            schema.resolve("xlnx,id", Some("/amba/serial"), &[]),
            PropertyType::UInt32
        );

        let compatible = vec!["xlnx,uart".to_owned()];
        schema.set_compatible_type("xlnx,uart", "xlnx,id", PropertyType::UInt16);
        assert_eq!(
            schema.resolve("xlnx,id", Some("/amba/serial@ff00"), &compatible),
            PropertyType::UInt16
        );

        schema.set_path_type("/amba/serial@ff00", "xlnx,id", PropertyType::String);
        assert_eq!(
            schema.resolve("xlnx,id", Some("/amba/serial@ff00"), &compatible),
            PropertyType::String
        );
    }

    #[test]
    fn pattern_context() {
        let mut schema = SchemaResolver::new();
        schema
            .add_pattern(
                r"xlnx,reg-\d+",
                PropertyType::UInt64,
                PatternContext::Compatible("xlnx,ddr".to_owned()),
            )
            .unwrap();
        let ddr = vec!["xlnx,ddr".to_owned()];
        assert_eq!(
            schema.resolve("xlnx,reg-0", Some("/ddr"), &ddr),
            PropertyType::UInt64
        );
        // Falls through to the vendor-prefix heuristic.
        assert_eq!(
            schema.resolve("xlnx,reg-0", Some("/other"), &["x".to_owned()]),
            PropertyType::String
        );
        assert_eq!(
            schema.resolve("xlnx,reg-0", None, &[]),
            PropertyType::UInt64
        );
    }

    #[test]
    fn merge_never_overwrites() {
        let mut base = SchemaResolver::new();
        base.set_global_type("foo", PropertyType::String);
        let mut learned = SchemaResolver::new();
        learned.set_global_type("foo", PropertyType::UInt32);
        learned.set_global_type("bar", PropertyType::UInt8);
        learned.set_path_type("/a", "foo", PropertyType::UInt16);

        base.merge(&learned);
        assert_eq!(base.global_type("foo"), Some(PropertyType::String));
        assert_eq!(base.global_type("bar"), Some(PropertyType::UInt8));
        assert_eq!(base.resolve("foo", Some("/a"), &[]), PropertyType::UInt16);
    }

    #[test]
    fn node_globs() {
        assert!(matches_node_glob("/cpus/cpu@0", "cpu@*"));
        assert!(!matches_node_glob("/cpus/cpu@0/x", "cpu@*"));
        assert!(!matches_node_glob("/cpus/xcpu@0", "cpu@*"));
        assert!(matches_node_glob("/a.b/c", "c"));
    }
}
