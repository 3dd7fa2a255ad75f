// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Learning typing rules from device tree source text.

use std::sync::LazyLock;

use log::{debug, trace};
use regex::Regex;

use super::SchemaResolver;
use crate::codec::PropertyType;
use crate::{OrderedMap, ordered_map};

/// One field of a cross-reference record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// A `&label` reference.
    Phandle,
    /// A plain cell.
    Field,
    /// A quoted string.
    String,
}

/// The layout of the first record of a property value, as written in source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordShape {
    /// Fields of one record, in order.
    pub fields: Vec<Field>,
    /// Whether the value holds more than one record of this shape.
    pub repeat: bool,
}

impl RecordShape {
    /// Returns `true` if the record holds a reference.
    #[must_use]
    pub fn has_phandle(&self) -> bool {
        self.fields.contains(&Field::Phandle)
    }

    /// Returns the cross-reference field-spec for this shape, or `None` for
    /// shapes without a reference.
    ///
    /// ```
    /// use sdt::schema::{Field, RecordShape};
    ///
    /// let shape = RecordShape { fields: vec![Field::Phandle, Field::Field], repeat: true };
    /// assert_eq!(shape.field_spec().as_deref(), Some("phandle field"));
    /// ```
    #[must_use]
    pub fn field_spec(&self) -> Option<String> {
        if !self.has_phandle() {
            return None;
        }
        let tokens: Vec<&str> = self
            .fields
            .iter()
            .map(|field| match field {
                Field::Phandle => "phandle",
                Field::Field | Field::String => "field",
            })
            .collect();
        Some(tokens.join(" "))
    }
}

#[derive(Debug, Clone)]
struct Occurrence {
    path: String,
    compatible: Option<String>,
    ptype: PropertyType,
}

#[derive(Debug)]
struct Frame {
    path: String,
    compatible: Option<String>,
}

macro_rules! pattern {
    ($name:ident, $re:literal) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($re).unwrap_or_else(|e| panic!("{}: {e}", $re)));
    };
}

pattern!(
    PREPROCESSOR,
    r"^#\s*(?:\d|include|define|undef|if|ifdef|ifndef|elif|else|endif|line|pragma|error|warning)\b"
);
pattern!(ROOT, r"^/\s*\{");
pattern!(REF_LABEL, r"^&([\w-]+)\s*\{");
pattern!(REF_PATH, r"^&\{(/[^}]*)\}\s*\{");
pattern!(
    NODE,
    r"^((?:[\w-]+:\s*)*)([\w,.+-]+(?:@[\w,.+-]*)?)\s*\{"
);
pattern!(CLOSE, r"^\}\s*;");
pattern!(PROPERTY, r"^([#\w,.+?-]+)\s*(?:(=)\s*(.*?)|;)\s*$");
pattern!(BITS, r"^/bits/\s*(\d+)\s+(.*)$");
pattern!(LABEL, r"([\w-]+):");

/// Scans device tree source and learns how its properties are written.
///
/// For every property name the scanner records the type implied by its
/// source syntax and, for values with `&label` references, the shape of a
/// record. Properties written with different types in different places also
/// get per-path and per-compatible entries.
///
/// ```
/// use sdt::codec::PropertyType;
/// use sdt::schema::SchemaScanner;
///
/// let mut scanner = SchemaScanner::new();
/// scanner.scan(r#"
/// / {
///     dma: dma@0 {
///         #dma-cells = <1>;
///     };
///     uart@1 {
///         dmas = <&dma 1>, <&dma 2>;
///         xlnx,speed = "fast";
///     };
/// };
/// "#);
/// let shape = scanner.shape("dmas").unwrap();
/// assert!(shape.repeat);
/// assert_eq!(shape.field_spec().as_deref(), Some("phandle field"));
/// assert_eq!(scanner.schema().global_type("xlnx,speed"), Some(PropertyType::String));
/// ```
#[derive(Debug)]
pub struct SchemaScanner {
    occurrences: OrderedMap<Vec<Occurrence>>,
    shapes: OrderedMap<RecordShape>,
    labels: OrderedMap<String>,
}

impl Default for SchemaScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaScanner {
    /// Creates a scanner that has learned nothing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            occurrences: ordered_map(0),
            shapes: ordered_map(0),
            labels: ordered_map(0),
        }
    }

    /// Scans one source text. May be called repeatedly; what is learned
    /// accumulates.
    pub fn scan(&mut self, source: &str) {
        let mut stack: Vec<Frame> = Vec::new();
        let mut in_block_comment = false;
        let mut lines = source.lines();

        while let Some(raw) = lines.next() {
            let line = strip_comments(raw, &mut in_block_comment);
            let line = line.trim();
            if line.is_empty() || PREPROCESSOR.is_match(line) {
                continue;
            }

            if ROOT.is_match(line) {
                stack.push(Frame {
                    path: "/".to_owned(),
                    compatible: None,
                });
                continue;
            }
            if let Some(captures) = REF_PATH.captures(line) {
                stack.push(Frame {
                    path: captures[1].to_owned(),
                    compatible: None,
                });
                continue;
            }
            if let Some(captures) = REF_LABEL.captures(line) {
                let label = &captures[1];
                let path = self
                    .labels
                    .get(label)
                    .cloned()
                    .unwrap_or_else(|| format!("/{label}"));
                stack.push(Frame {
                    path,
                    compatible: None,
                });
                continue;
            }
            if let Some(captures) = NODE.captures(line) {
                let parent = stack.last().map_or("", |frame| frame.path.as_str());
                let path = join_path(parent, &captures[2]);
                for label in LABEL.captures_iter(&captures[1]) {
                    self.labels.insert(label[1].to_owned(), path.clone());
                }
                stack.push(Frame {
                    path,
                    compatible: None,
                });
                if line.ends_with("};") {
                    stack.pop();
                }
                continue;
            }
            if CLOSE.is_match(line) {
                stack.pop();
                continue;
            }
            if line.starts_with('/') {
                // Directives: /dts-v1/, /memreserve/, /delete-node/ and friends.
                continue;
            }

            let Some(captures) = PROPERTY.captures(line) else {
                continue;
            };
            let name = captures[1].to_owned();
            let mut value = captures.get(3).map_or("", |m| m.as_str()).to_owned();
            let assigned = captures.get(2).is_some();
            if assigned && !value.ends_with(';') {
                for next in lines.by_ref() {
                    let next = strip_comments(next, &mut in_block_comment);
                    let next = next.trim();
                    if next.is_empty() {
                        continue;
                    }
                    value.push(' ');
                    value.push_str(next);
                    if next.ends_with(';') {
                        break;
                    }
                }
            }
            let value = value.trim_end_matches(';').trim();

            let Some(frame) = stack.last_mut() else {
                continue;
            };
            if name == "compatible" {
                frame.compatible = first_quoted(value);
            }
            self.record(&name, value, frame);
        }
    }

    fn record(&mut self, name: &str, value: &str, frame: &Frame) {
        let ptype = source_type(value);
        trace!("{}: {name} written as {ptype}", frame.path);
        if ptype != PropertyType::Unknown {
            self.occurrences
                .entry(name.to_owned())
                .or_default()
                .push(Occurrence {
                    path: frame.path.clone(),
                    compatible: frame.compatible.clone(),
                    ptype,
                });
        }

        if let Some(shape) = record_shape(value) {
            match self.shapes.get(name) {
                Some(known) if known.has_phandle() || !shape.has_phandle() => {}
                _ => {
                    debug!("learned record shape {shape:?} for {name}");
                    self.shapes.insert(name.to_owned(), shape);
                }
            }
        }
    }

    /// Returns the learned record shape of `name`.
    #[must_use]
    pub fn shape(&self, name: &str) -> Option<&RecordShape> {
        self.shapes.get(name)
    }

    /// Returns all learned record shapes.
    pub fn shapes(&self) -> impl Iterator<Item = (&str, &RecordShape)> {
        self.shapes.iter().map(|(name, shape)| (name.as_str(), shape))
    }

    /// Returns a cross-reference field-spec for every learned shape that
    /// holds a reference.
    pub fn phandle_specs(&self) -> impl Iterator<Item = (&str, String)> {
        self.shapes()
            .filter_map(|(name, shape)| shape.field_spec().map(|spec| (name, spec)))
    }

    /// Returns the labels seen so far and the paths they name.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels
            .iter()
            .map(|(label, path)| (label.as_str(), path.as_str()))
    }

    /// Builds typing rules from what was scanned.
    ///
    /// Every property gets a global entry with its most common type. A
    /// property written with more than one type also gets an entry per path,
    /// and an entry per `compatible` string under which it was written
    /// consistently.
    #[must_use]
    pub fn schema(&self) -> SchemaResolver {
        let mut schema = SchemaResolver::new();
        for (name, occurrences) in &self.occurrences {
            let mut counts: Vec<(PropertyType, usize)> = Vec::new();
            for occurrence in occurrences {
                match counts.iter_mut().find(|(ptype, _)| *ptype == occurrence.ptype) {
                    Some((_, count)) => *count += 1,
                    None => counts.push((occurrence.ptype, 1)),
                }
            }
            let Some(&(common, _)) = counts
                .iter()
                .rev()
                .max_by_key(|(_, count)| *count)
            else {
                continue;
            };
            schema.set_global_type(name, common);
            if counts.len() == 1 {
                continue;
            }

            let mut by_compatible: OrderedMap<Option<PropertyType>> = ordered_map(0);
            for occurrence in occurrences {
                schema.set_path_type(&occurrence.path, name, occurrence.ptype);
                if let Some(compatible) = &occurrence.compatible {
                    let entry = by_compatible
                        .entry(compatible.clone())
                        .or_insert(Some(occurrence.ptype));
                    if *entry != Some(occurrence.ptype) {
                        *entry = None;
                    }
                }
            }
            for (compatible, ptype) in by_compatible {
                if let Some(ptype) = ptype {
                    schema.set_compatible_type(&compatible, name, ptype);
                }
            }
        }
        schema
    }
}

fn join_path(parent: &str, name: &str) -> String {
    match parent {
        "" | "/" => format!("/{name}"),
        parent => format!("{parent}/{name}"),
    }
}

/// Removes `//` and `/* */` comments outside of string literals.
fn strip_comments(line: &str, in_block: &mut bool) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if *in_block {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                *in_block = false;
            }
            continue;
        }
        match c {
            '\\' if in_string => {
                out.push(c);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            '/' if !in_string && chars.peek() == Some(&'/') => break,
            '/' if !in_string && chars.peek() == Some(&'*') => {
                chars.next();
                *in_block = true;
            }
            c => out.push(c),
        }
    }
    out
}

fn first_quoted(value: &str) -> Option<String> {
    let start = value.find('"')? + 1;
    let end = value[start..].find('"')? + start;
    Some(value[start..end].to_owned())
}

/// The type a value's source syntax implies.
fn source_type(value: &str) -> PropertyType {
    if let Some(captures) = BITS.captures(value) {
        return match &captures[1] {
            "8" => PropertyType::UInt8,
            "16" => PropertyType::UInt16,
            "64" => PropertyType::UInt64,
            _ => PropertyType::UInt32,
        };
    }
    let items = split_items(value);
    match items.as_slice() {
        [] => PropertyType::Empty,
        [Item::Bytes] => PropertyType::UInt8,
        [Item::Str] => PropertyType::String,
        items if items.iter().all(|item| matches!(item, Item::Str)) => PropertyType::MultiString,
        items if items.iter().all(|item| matches!(item, Item::Cells(_))) => PropertyType::UInt32,
        _ => PropertyType::Unknown,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Item {
    Cells(Vec<String>),
    Str,
    Bytes,
    Other,
}

/// Splits a value into its comma-separated top-level items.
fn split_items(value: &str) -> Vec<Item> {
    let mut items = Vec::new();
    let mut rest = value.trim();
    while !rest.is_empty() {
        let (item, remainder) = match rest.as_bytes()[0] {
            b'<' => match rest.find('>') {
                Some(end) => (
                    Item::Cells(rest[1..end].split_whitespace().map(str::to_owned).collect()),
                    &rest[end + 1..],
                ),
                None => (Item::Other, ""),
            },
            b'[' => match rest.find(']') {
                Some(end) => (Item::Bytes, &rest[end + 1..]),
                None => (Item::Other, ""),
            },
            b'"' => match closing_quote(rest) {
                Some(end) => (Item::Str, &rest[end + 1..]),
                None => (Item::Other, ""),
            },
            _ => match rest.find(',') {
                Some(end) => (Item::Other, &rest[end..]),
                None => (Item::Other, ""),
            },
        };
        items.push(item);
        rest = remainder.trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }
    items
}

fn closing_quote(text: &str) -> Option<usize> {
    let mut escaped = false;
    for (index, c) in text.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(index),
            _ => {}
        }
    }
    None
}

fn record_shape(value: &str) -> Option<RecordShape> {
    let value = BITS
        .captures(value)
        .map_or(value, |captures| captures.get(2).map_or(value, |m| m.as_str()));
    let mut records: Vec<Vec<Field>> = Vec::new();
    for item in split_items(value) {
        match item {
            Item::Cells(cells) => {
                let fields: Vec<Field> = cells
                    .iter()
                    .map(|cell| {
                        if cell.starts_with('&') {
                            Field::Phandle
                        } else {
                            Field::Field
                        }
                    })
                    .collect();
                let references = fields.iter().filter(|f| **f == Field::Phandle).count();
                if references > 1 && fields.first() == Some(&Field::Phandle) {
                    let mut record = Vec::new();
                    for field in fields {
                        if field == Field::Phandle && !record.is_empty() {
                            records.push(std::mem::take(&mut record));
                        }
                        record.push(field);
                    }
                    records.push(record);
                } else if !fields.is_empty() {
                    records.push(fields);
                }
            }
            Item::Str => records.push(vec![Field::String]),
            Item::Bytes | Item::Other => {}
        }
    }

    if !records.iter().flatten().any(|field| *field == Field::Phandle) {
        return None;
    }
    let first = records.first()?.clone();
    let repeat = records.len() > 1 && records.iter().all(|record| *record == first);
    Some(RecordShape {
        fields: first,
        repeat,
    })
}
