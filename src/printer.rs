// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Device tree source output.
//!
//! The [`Printer`] walks a [`Tree`] and writes source text with labels,
//! comments and symbolic `&label` references restored from the synthetic
//! properties that [`annotate`](crate::annotate::annotate) produces.

use std::collections::HashMap;
use std::fmt::Write;

use log::debug;

use crate::codec::{PropertyType, Value};
use crate::error::{Error, Result};
use crate::tree::{NodeKey, PREAMBLE, Property, PropertyClass, ResolvedRecord, Tree};

/// Spaces per nesting level.
pub const DEFAULT_INDENT: usize = 8;

/// Decides which source comments are kept.
///
/// A comment is kept only inside an open block, and only until the first
/// child of that block opens. The annotator applies this while rewriting
/// comments; the printer writes a node's properties before its children, so
/// every comment property it meets is already in place.
#[derive(Debug, Clone, Default)]
pub struct CommentFilter {
    /// One entry per open block: whether a child has opened inside it.
    blocks: Vec<bool>,
}

impl CommentFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a node block has opened.
    pub fn open(&mut self) {
        if let Some(child_opened) = self.blocks.last_mut() {
            *child_opened = true;
        }
        self.blocks.push(false);
    }

    /// Records that the innermost block has closed.
    pub fn close(&mut self) {
        self.blocks.pop();
    }

    /// Returns `true` if a comment at the current position is kept.
    #[must_use]
    pub fn keeps(&self) -> bool {
        self.blocks.last().is_some_and(|child_opened| !child_opened)
    }

    /// Number of blocks currently open.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.blocks.len()
    }
}

/// Writes a [`Tree`] as device tree source.
#[derive(Debug, Clone)]
pub struct Printer {
    indent: usize,
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}

enum Step {
    Open(NodeKey, usize),
    Close(usize),
}

impl Printer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            indent: DEFAULT_INDENT,
        }
    }

    /// Uses `indent` spaces per nesting level.
    #[must_use]
    pub fn with_indent(mut self, indent: usize) -> Self {
        self.indent = indent;
        self
    }

    /// Renders the tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateLabel`] if two nodes carry the same label,
    /// or [`Error::InvalidReference`] for a dangling reference when
    /// [`Config::strict_phandles`](crate::Config) is set.
    pub fn print(&self, tree: &Tree<'_>) -> Result<String> {
        let mut out = String::new();
        self.write(tree, &mut out)?;
        Ok(out)
    }

    /// Like [`Printer::print`], writing to `out`.
    ///
    /// The output is the preamble, the version tag, the memory reservations
    /// and the root block, in that order.
    ///
    /// # Errors
    ///
    /// As for [`Printer::print`], or [`Error::Format`] if `out` fails.
    pub fn write(&self, tree: &Tree<'_>, out: &mut impl Write) -> Result<()> {
        let mut labels = Labels::collect(tree)?;
        let mut references: HashMap<(NodeKey, String), Vec<ResolvedRecord>> = HashMap::new();
        for node in tree.nodes() {
            for property in node.properties() {
                if property.class() != PropertyClass::Value || property.ptype() != PropertyType::UInt32 {
                    continue;
                }
                let Some(records) = tree.reference_records(node.key(), property.name())? else {
                    continue;
                };
                for record in records.iter().filter(|record| !record.dangling) {
                    for target in record.targets.iter().filter_map(|(_, target)| *target) {
                        labels.ensure(tree, target);
                    }
                }
                references.insert((node.key(), property.name().to_owned()), records);
            }
        }

        if let Some(preamble) = tree.get_property(tree.root(), PREAMBLE) {
            for line in preamble {
                writeln!(out, "{line}")?;
            }
        }
        writeln!(out, "/dts-v1/;")?;
        writeln!(out)?;
        let reservations = tree.memory_reservations();
        for reservation in &reservations {
            writeln!(out, "{reservation}")?;
        }
        if !reservations.is_empty() {
            writeln!(out)?;
        }

        let mut stack = vec![Step::Open(tree.root(), 0)];
        while let Some(step) = stack.pop() {
            let (key, depth) = match step {
                Step::Close(depth) => {
                    writeln!(out, "{:pad$}}};", "", pad = depth * self.indent)?;
                    continue;
                }
                Step::Open(key, depth) => (key, depth),
            };
            let Some(node) = tree.node(key) else {
                continue;
            };
            let pad = depth * self.indent;
            if node.parent().is_none() {
                writeln!(out, "/ {{")?;
            } else {
                writeln!(out)?;
                match labels.of(key) {
                    Some(label) => writeln!(out, "{:pad$}{label}: {} {{", "", node.name())?,
                    None => writeln!(out, "{:pad$}{} {{", "", node.name())?,
                }
            }
            let pad = pad + self.indent;
            for property in node.properties() {
                match property.class() {
                    PropertyClass::Label | PropertyClass::Preamble => {}
                    PropertyClass::Comment => {
                        for text in property.values() {
                            writeln!(out, "{:pad$}{text}", "")?;
                        }
                    }
                    PropertyClass::Value => {
                        match references.get(&(key, property.name().to_owned())) {
                            Some(records) => {
                                write_references(out, tree, &labels, property, records, pad)?;
                            }
                            None => writeln!(out, "{:pad$}{}", "", property.to_dts())?,
                        }
                    }
                }
            }

            stack.push(Step::Close(depth));
            stack.extend(
                node.children()
                    .iter()
                    .rev()
                    .map(|&child| Step::Open(child, depth + 1)),
            );
        }
        Ok(())
    }
}

/// Prints a reference-bearing property as one `<...>` group per record.
/// Records naming a missing node are left out; if none is left the cells are
/// printed as numbers. Cells after the last whole record form a final group
/// of numbers.
fn write_references(
    out: &mut impl Write,
    tree: &Tree<'_>,
    labels: &Labels,
    property: &Property,
    records: &[ResolvedRecord],
    pad: usize,
) -> Result<()> {
    let values = property.values();
    let mut groups: Vec<String> = records
        .iter()
        .filter(|record| !record.dangling)
        .map(|record| {
            let cells: Vec<String> = record
                .record
                .range()
                .filter_map(|index| values.get(index).map(|value| (index, value)))
                .map(|(index, value)| {
                    match record.targets.iter().find(|(cell, _)| *cell == index) {
                        Some((_, Some(target))) => labels.reference(tree, *target),
                        _ => format_cell(value),
                    }
                })
                .collect();
            format!("<{}>", cells.join(" "))
        })
        .collect();
    let covered = records.last().map_or(0, |record| record.record.range().end);
    if !groups.is_empty() && covered < values.len() {
        let tail: Vec<String> = values[covered..].iter().map(format_cell).collect();
        groups.push(format!("<{}>", tail.join(" ")));
    }

    if groups.is_empty() {
        writeln!(out, "{:pad$}{}", "", property.to_dts())?;
        return Ok(());
    }
    let continuation = format!(",\n{:width$}", "", width = pad + property.name().len() + 3);
    writeln!(
        out,
        "{:pad$}{} = {};",
        "",
        property.name(),
        groups.join(&continuation)
    )?;
    Ok(())
}

/// Node labels, explicit and synthetic.
#[derive(Debug, Default)]
struct Labels {
    by_node: HashMap<NodeKey, String>,
    owners: HashMap<String, NodeKey>,
}

impl Labels {
    fn collect(tree: &Tree<'_>) -> Result<Self> {
        let mut labels = Self::default();
        for node in tree.nodes() {
            let Some(label) = node.label() else {
                continue;
            };
            if let Some(&first) = labels.owners.get(label) {
                if first != node.key() {
                    let first = tree.node(first).map(|n| n.path().to_owned()).unwrap_or_default();
                    return Err(Error::DuplicateLabel {
                        label: label.to_owned(),
                        first,
                        second: node.path().to_owned(),
                    });
                }
            }
            labels.owners.insert(label.to_owned(), node.key());
            labels.by_node.insert(node.key(), label.to_owned());
        }
        Ok(labels)
    }

    /// Gives `key` a label derived from its name unless it has one. The root
    /// is referenced by path instead.
    fn ensure(&mut self, tree: &Tree<'_>, key: NodeKey) {
        if self.by_node.contains_key(&key) || key == tree.root() {
            return;
        }
        let Some(node) = tree.node(key) else {
            return;
        };
        let base = sanitize_label(node.name());
        let mut label = base.clone();
        let mut suffix = 1;
        while self.owners.contains_key(&label) {
            label = format!("{base}_{suffix}");
            suffix += 1;
        }
        debug!("labelling {} as {label}", node.path());
        self.owners.insert(label.clone(), key);
        self.by_node.insert(key, label);
    }

    fn of(&self, key: NodeKey) -> Option<&str> {
        self.by_node.get(&key).map(String::as_str)
    }

    fn reference(&self, tree: &Tree<'_>, key: NodeKey) -> String {
        match self.of(key) {
            Some(label) if key != tree.root() => format!("&{label}"),
            _ => format!(
                "&{{{}}}",
                tree.node(key).map_or("/", |node| node.path())
            ),
        }
    }
}

/// Turns a node name into a label: `@` is dropped and any other character
/// that cannot appear in a label becomes `_`.
#[must_use]
pub fn sanitize_label(name: &str) -> String {
    let mut label: String = name
        .chars()
        .filter(|&c| c != '@')
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if !label.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        label.insert(0, '_');
    }
    label
}

/// Renders a property as a source statement, such as `reg = <0x1000 0x100>;`.
pub(crate) fn format_property(name: &str, values: &[Value], ptype: PropertyType) -> String {
    let body = format_values(values, ptype);
    if body.is_empty() {
        format!("{name};")
    } else {
        format!("{name} = {body};")
    }
}

/// Renders a value in source syntax, or `""` for an empty value.
///
/// Integers are printed in hex. A 64-bit value, or a cell too large for 32
/// bits, is printed as two cells.
///
/// ```
/// use sdt::codec::{PropertyType, Value};
/// use sdt::printer::format_values;
///
/// let values = [Value::Int(0x1_0000_0000), Value::Int(0x100)];
/// assert_eq!(format_values(&values, PropertyType::UInt64), "<0x1 0x0 0x0 0x100>");
/// assert_eq!(format_values(&["a".into(), "b".into()], PropertyType::MultiString), "\"a\", \"b\"");
/// ```
#[must_use]
pub fn format_values(values: &[Value], ptype: PropertyType) -> String {
    if values.is_empty() || ptype == PropertyType::Empty {
        return String::new();
    }
    if values.iter().any(|value| matches!(value, Value::Str(_))) {
        return values
            .iter()
            .map(|value| quote(&value.to_string()))
            .collect::<Vec<_>>()
            .join(", ");
    }

    let ints = values.iter().filter_map(Value::as_u64);
    match ptype {
        PropertyType::UInt8 => {
            let bytes: Vec<String> = ints.map(|byte| format!("{byte:02x}")).collect();
            format!("[{}]", bytes.join(" "))
        }
        PropertyType::UInt16 => {
            let cells: Vec<String> = ints.map(|value| format!("{value:#x}")).collect();
            format!("/bits/ 16 <{}>", cells.join(" "))
        }
        PropertyType::UInt64 => {
            let cells: Vec<String> = ints
                .map(|value| format!("{:#x} {:#x}", value >> 32, value & 0xffff_ffff))
                .collect();
            format!("<{}>", cells.join(" "))
        }
        _ => {
            let cells: Vec<String> = values.iter().map(format_cell).collect();
            format!("<{}>", cells.join(" "))
        }
    }
}

fn format_cell(value: &Value) -> String {
    match value {
        Value::Int(value) if *value > u64::from(u32::MAX) => {
            format!("{:#x} {:#x}", value >> 32, value & 0xffff_ffff)
        }
        Value::Int(value) => format!("{value:#x}"),
        Value::Str(text) => quote(text),
    }
}

pub(crate) fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            '\r' => quoted.push_str("\\r"),
            c if c.is_ascii_control() => {
                let _ = write!(quoted, "\\x{:02x}", u32::from(c));
            }
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}
