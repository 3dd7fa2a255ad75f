// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Locating cross-references (phandles) inside property values.
//!
//! A property such as `clocks = <&clk 3>, <&osc>` is stored as plain cells.
//! Where the references sit is described by a *field-spec*: a
//! space-separated list of tokens, one per field of a record.
//!
//! | token            | meaning                                                       |
//! |------------------|---------------------------------------------------------------|
//! | `#prop`          | `prop` on the node itself holds a count of opaque cells       |
//! | `phandle`        | one reference cell                                            |
//! | `phandle:#prop`  | one reference cell, then `prop` of the *target* many cells    |
//! | `^:#prop`        | `prop` on the *parent* node holds a count of opaque cells     |
//! | anything else    | one opaque cell                                               |
//!
//! Counts that cannot be looked up default to one cell.

use std::fmt;

use log::{debug, trace};

use crate::codec::Value;
use crate::{OrderedMap, ordered_map};

/// Field-specs known without any learning.
pub const DEFAULT_FIELD_SPECS: &[(&str, &str)] = &[
    (
        "address-map",
        "#ranges-address-cells phandle #ranges-address-cells #ranges-size-cells",
    ),
    ("interrupt-parent", "phandle"),
    ("iommus", "phandle field"),
    ("interrupt-map", "#interrupt-cells phandle #interrupt-cells"),
    ("access", "phandle"),
    ("cpus", "phandle mask mode"),
    ("clocks", "phandle:#clock-cells"),
];

/// One token of a [`FieldSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldToken {
    /// Opaque cells, counted by a property of the node itself.
    Count(String),
    /// A reference cell.
    Phandle,
    /// A reference cell followed by cells counted by a property of the
    /// target, adjusted by a constant.
    PhandleCount {
        /// The count property on the target.
        property: String,
        /// Added to the looked-up count.
        adjust: i64,
    },
    /// Opaque cells, counted by a property of the parent node.
    ParentCount(String),
    /// A single opaque cell.
    Opaque(String),
}

/// A parsed field-spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    source: String,
    tokens: Vec<FieldToken>,
}

impl FieldSpec {
    /// Parses a space-separated field-spec.
    ///
    /// ```
    /// use sdt::phandle::{FieldSpec, FieldToken};
    ///
    /// let spec = FieldSpec::parse("phandle:#clock-cells");
    /// assert_eq!(
    ///     spec.tokens(),
    ///     [FieldToken::PhandleCount { property: "#clock-cells".into(), adjust: 0 }]
    /// );
    /// ```
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        let tokens = spec
            .split_whitespace()
            .map(|token| {
                if let Some(rest) = token.strip_prefix("phandle") {
                    let mut parts = rest.split(':').skip(1);
                    match parts.next() {
                        Some(property) if !property.is_empty() => FieldToken::PhandleCount {
                            property: property.to_owned(),
                            adjust: parts.next().and_then(parse_adjust).unwrap_or(0),
                        },
                        _ => FieldToken::Phandle,
                    }
                } else if let Some(property) = token.strip_prefix("^:") {
                    FieldToken::ParentCount(property.to_owned())
                } else if token.starts_with('#') {
                    FieldToken::Count(token.to_owned())
                } else {
                    FieldToken::Opaque(token.to_owned())
                }
            })
            .collect();
        Self {
            source: spec.to_owned(),
            tokens,
        }
    }

    /// Returns the spec as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns the parsed tokens.
    #[must_use]
    pub fn tokens(&self) -> &[FieldToken] {
        &self.tokens
    }

    /// Returns `true` if the spec has at least one reference field.
    #[must_use]
    pub fn has_phandle(&self) -> bool {
        self.tokens
            .iter()
            .any(|token| matches!(token, FieldToken::Phandle | FieldToken::PhandleCount { .. }))
    }
}

impl fmt::Display for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_adjust(text: &str) -> Option<i64> {
    text.strip_prefix('+').unwrap_or(text).parse().ok()
}

/// Supplies the cell counts a field-spec refers to.
pub trait CellContext {
    /// The first value of `property` on the node holding the reference.
    fn own_count(&self, property: &str) -> Option<u64>;
    /// The first value of `property` on the parent of that node.
    fn parent_count(&self, property: &str) -> Option<u64>;
    /// The first value of `property` on the node with this phandle.
    fn target_count(&self, phandle: u64, property: &str) -> Option<u64>;
}

/// A context with no properties: every count is the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContext;

impl CellContext for NoContext {
    fn own_count(&self, _: &str) -> Option<u64> {
        None
    }

    fn parent_count(&self, _: &str) -> Option<u64> {
        None
    }

    fn target_count(&self, _: u64, _: &str) -> Option<u64> {
        None
    }
}

/// Where the first reference of a record sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    /// 1-based position of the reference within the record.
    pub index: usize,
    /// Cells per record.
    pub stride: usize,
}

/// One record of a reference-bearing value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Index of the first cell of the record.
    pub start: usize,
    /// Number of cells in the record.
    pub len: usize,
    /// Indices of the reference cells, relative to the whole value.
    pub phandles: Vec<usize>,
}

impl Record {
    /// Returns the index range of the record's cells.
    #[must_use]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.len
    }
}

/// Returns the 0-based positions of reference cells for a fixed layout.
///
/// ```
/// assert_eq!(sdt::phandle::positions(1, 3, 6), [0, 3]);
/// ```
#[must_use]
pub fn positions(index: usize, stride: usize, len: usize) -> Vec<usize> {
    if index == 0 || stride == 0 {
        return Vec::new();
    }
    (index - 1..len).step_by(stride).collect()
}

/// Property names that carry references, and where.
#[derive(Debug, Clone)]
pub struct PhandleRegistry {
    specs: OrderedMap<FieldSpec>,
}

impl Default for PhandleRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PhandleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            specs: ordered_map(0),
        }
    }

    /// Creates a registry holding [`DEFAULT_FIELD_SPECS`].
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (name, spec) in DEFAULT_FIELD_SPECS {
            registry.insert(name, FieldSpec::parse(spec));
        }
        registry
    }

    /// Sets the field-spec of `name`, replacing any previous one.
    pub fn insert(&mut self, name: &str, spec: FieldSpec) {
        self.specs.insert(name.to_owned(), spec);
    }

    /// Sets the field-spec of `name` unless it already has one. Returns
    /// `true` if the spec was added.
    pub fn merge(&mut self, name: &str, spec: FieldSpec) -> bool {
        if self.specs.contains_key(name) {
            return false;
        }
        self.specs.insert(name.to_owned(), spec);
        true
    }

    /// Returns the field-spec of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.specs.get(name)
    }

    /// Returns `true` if `name` may carry references.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Returns the registered property names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    /// Splits `values` of property `name` into records and locates the
    /// reference cells of each.
    ///
    /// Returns `None` if `name` has no field-spec, or the spec has no
    /// reference field. A trailing partial record is dropped, so its cells
    /// are never read as references.
    #[must_use]
    pub fn records(
        &self,
        name: &str,
        values: &[Value],
        ctx: &dyn CellContext,
    ) -> Option<Vec<Record>> {
        let spec = self.get(name).filter(|spec| spec.has_phandle())?;
        let cell = |index: usize| values.get(index).and_then(Value::as_u64);
        let count = |found: Option<u64>| {
            found
                .and_then(|count| usize::try_from(count).ok())
                .unwrap_or(1)
        };

        let mut records = Vec::new();
        let mut position = 0;
        while position < values.len() {
            let start = position;
            let mut phandles = Vec::new();
            for token in spec.tokens() {
                match token {
                    FieldToken::Count(property) => position += count(ctx.own_count(property)),
                    FieldToken::ParentCount(property) => {
                        position += count(ctx.parent_count(property));
                    }
                    FieldToken::Phandle => {
                        if position < values.len() {
                            phandles.push(position);
                        }
                        position += 1;
                    }
                    FieldToken::PhandleCount { property, adjust } => {
                        let Some(phandle) = cell(position) else {
                            position += 1;
                            continue;
                        };
                        phandles.push(position);
                        let cells = count(ctx.target_count(phandle, property));
                        let cells = i64::try_from(cells)
                            .ok()
                            .and_then(|cells| cells.checked_add(*adjust))
                            .and_then(|cells| usize::try_from(cells).ok())
                            .unwrap_or(0);
                        position += 1 + cells;
                    }
                    FieldToken::Opaque(_) => position += 1,
                }
            }
            if position == start {
                break;
            }
            if position > values.len() {
                debug!(
                    "{name}: ignoring {} cells after the last whole record",
                    values.len() - start
                );
                break;
            }
            let len = position - start;
            trace!("{name}: record at {start} of {len} cells, references {phandles:?}");
            records.push(Record {
                start,
                len,
                phandles,
            });
        }
        Some(records)
    }

    /// Returns the layout of the first record of `values`.
    ///
    /// ```
    /// use sdt::codec::Value;
    /// use sdt::phandle::{NoContext, PhandleRegistry, RecordLayout, positions};
    ///
    /// let registry = PhandleRegistry::with_defaults();
    /// let values: Vec<Value> = (1..=6).map(Value::Int).collect();
    /// let layout = registry.layout("cpus", &values, &NoContext).unwrap();
    /// assert_eq!(layout, RecordLayout { index: 1, stride: 3 });
    /// assert_eq!(positions(layout.index, layout.stride, values.len()), [0, 3]);
    /// ```
    #[must_use]
    pub fn layout(&self, name: &str, values: &[Value], ctx: &dyn CellContext) -> Option<RecordLayout> {
        let records = self.records(name, values, ctx)?;
        let first = records.first()?;
        let reference = first.phandles.first()?;
        Some(RecordLayout {
            index: reference - first.start + 1,
            stride: first.len,
        })
    }

    /// Returns the indices of every reference cell in `values`, following
    /// each record's own size.
    #[must_use]
    pub fn phandle_positions(
        &self,
        name: &str,
        values: &[Value],
        ctx: &dyn CellContext,
    ) -> Vec<usize> {
        self.records(name, values, ctx)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|record| record.phandles)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counts;

    impl CellContext for Counts {
        fn own_count(&self, property: &str) -> Option<u64> {
            (property == "#interrupt-cells").then_some(2)
        }

        fn parent_count(&self, property: &str) -> Option<u64> {
            (property == "#address-cells").then_some(0)
        }

        fn target_count(&self, phandle: u64, property: &str) -> Option<u64> {
            match (phandle, property) {
                (1, "#clock-cells") => Some(0),
                (2, "#clock-cells") => Some(2),
                _ => None,
            }
        }
    }

    fn ints(values: &[u64]) -> Vec<Value> {
        values.iter().copied().map(Value::Int).collect()
    }

    #[test]
    fn parse_tokens() {
        let spec = FieldSpec::parse("#a phandle ^:#b phandle:#c:-1 mask");
        assert_eq!(
            spec.tokens(),
            [
                FieldToken::Count("#a".to_owned()),
                FieldToken::Phandle,
                FieldToken::ParentCount("#b".to_owned()),
                FieldToken::PhandleCount {
                    property: "#c".to_owned(),
                    adjust: -1
                },
                FieldToken::Opaque("mask".to_owned()),
            ]
        );
        assert!(!FieldSpec::parse("mask mode").has_phandle());
    }

    #[test]
    fn fixed_records() {
        let registry = PhandleRegistry::with_defaults();
        let values = ints(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(registry.phandle_positions("cpus", &values, &NoContext), [0, 3]);
        assert_eq!(positions(1, 3, 6), [0, 3]);
        assert_eq!(positions(2, 2, 5), [1, 3]);
        assert!(positions(0, 3, 6).is_empty());
    }

    #[test]
    fn variable_records_follow_target_counts() {
        let registry = PhandleRegistry::with_defaults();
        // <&clk1>, <&clk2 7 8>, <&clk1>
        let values = ints(&[1, 2, 7, 8, 1]);
        let records = registry.records("clocks", &values, &Counts).unwrap();
        assert_eq!(
            records.iter().map(Record::range).collect::<Vec<_>>(),
            [0..1, 1..4, 4..5]
        );
        assert_eq!(registry.phandle_positions("clocks", &values, &Counts), [0, 1, 4]);
    }

    #[test]
    fn own_and_parent_counts() {
        let registry = PhandleRegistry::with_defaults();
        // interrupt-map: 2 child cells, phandle, 2 parent cells.
        let values = ints(&[0, 1, 9, 5, 6, 0, 2, 9, 7, 8]);
        assert_eq!(
            registry.layout("interrupt-map", &values, &Counts),
            Some(RecordLayout { index: 3, stride: 5 })
        );
        assert_eq!(
            registry.phandle_positions("interrupt-map", &values, &Counts),
            [2, 7]
        );

        let mut registry = PhandleRegistry::new();
        registry.insert("x", FieldSpec::parse("^:#address-cells phandle"));
        assert_eq!(registry.phandle_positions("x", &ints(&[4, 5]), &Counts), [0, 1]);
    }

    #[test]
    fn partial_records_are_dropped() {
        let registry = PhandleRegistry::with_defaults();
        // <&clk2 7 8>, then a clk2 record missing its last cell.
        let values = ints(&[2, 7, 8, 2, 7]);
        let records = registry.records("clocks", &values, &Counts).unwrap();
        assert_eq!(
            records.iter().map(Record::range).collect::<Vec<_>>(),
            [0..3]
        );
        assert_eq!(registry.phandle_positions("clocks", &values, &Counts), [0]);
    }

    #[test]
    fn merge_keeps_existing() {
        let mut registry = PhandleRegistry::with_defaults();
        assert!(!registry.merge("clocks", FieldSpec::parse("phandle field")));
        assert!(registry.merge("dmas", FieldSpec::parse("phandle field")));
        assert_eq!(registry.get("clocks").unwrap().as_str(), "phandle:#clock-cells");
        assert!(registry.records("unknown", &ints(&[1]), &NoContext).is_none());
    }
}
