// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Conversion between raw property bytes and typed values.
//!
//! A flattened device tree stores every property as an untyped byte string.
//! [`guess_type`] infers a [`PropertyType`] from the byte shape alone,
//! [`decode`] and [`encode`] convert between bytes and [`Value`] sequences,
//! and [`parse_literal`] reads the value syntax used in source text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

/// The semantic type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PropertyType {
    /// No value: a boolean flag.
    Empty,
    /// A single NUL-terminated string.
    String,
    /// A list of NUL-terminated strings.
    MultiString,
    /// Opaque bytes.
    UInt8,
    /// Big-endian 16-bit integers.
    UInt16,
    /// Big-endian 32-bit cells.
    UInt32,
    /// Big-endian 64-bit integers.
    UInt64,
    /// Not known yet.
    #[default]
    Unknown,
}

impl PropertyType {
    /// Returns the element width in bytes for integer types.
    #[must_use]
    pub fn width(self) -> Option<usize> {
        match self {
            PropertyType::UInt8 => Some(1),
            PropertyType::UInt16 => Some(2),
            PropertyType::UInt32 => Some(4),
            PropertyType::UInt64 => Some(8),
            _ => None,
        }
    }

    /// Returns `true` for the string types.
    #[must_use]
    pub fn is_string(self) -> bool {
        matches!(self, PropertyType::String | PropertyType::MultiString)
    }

    /// Returns `true` for the integer types.
    #[must_use]
    pub fn is_integer(self) -> bool {
        self.width().is_some()
    }

    /// Returns the name used in generic-tree metadata and schema tables.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PropertyType::Empty => "empty",
            PropertyType::String => "string",
            PropertyType::MultiString => "multi-string",
            PropertyType::UInt8 => "uint8",
            PropertyType::UInt16 => "uint16",
            PropertyType::UInt32 => "uint32",
            PropertyType::UInt64 => "uint64",
            PropertyType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "empty" => PropertyType::Empty,
            "string" => PropertyType::String,
            "multi-string" => PropertyType::MultiString,
            "uint8" => PropertyType::UInt8,
            "uint16" => PropertyType::UInt16,
            "uint32" => PropertyType::UInt32,
            "uint64" => PropertyType::UInt64,
            "unknown" => PropertyType::Unknown,
            other => return Err(CodecError::UnknownType(other.to_owned())),
        })
    }
}

impl Serialize for PropertyType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PropertyType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(de::Error::custom)
    }
}

/// A single primitive of a property value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// An integer cell of any width.
    Int(u64),
    /// A string.
    Str(String),
}

impl Value {
    /// Returns the integer, if this is one.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Str(_) => None,
        }
    }

    /// Returns the string, if this is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Int(_) => None,
            Value::Str(value) => Some(value),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            Value::Str(value) => f.write_str(value),
        }
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value.into())
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

/// An error converting a property value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// An integer token is malformed.
    #[error("invalid integer token `{0}`")]
    BadInteger(String),
    /// A `<`, `[` or `"` literal is not closed.
    #[error("unterminated literal `{0}`")]
    Unterminated(String),
    /// A byte-string literal has an odd number of hex digits or a non-hex
    /// character.
    #[error("invalid byte string `{0}`")]
    BadBytes(String),
    /// A type name is not one of the [`PropertyType`] names.
    #[error("unknown property type `{0}`")]
    UnknownType(String),
}

/// Property names whose type does not depend on the byte shape.
const NAME_OVERRIDES: &[(&str, PropertyType)] = &[
    ("compatible", PropertyType::String),
    ("model", PropertyType::String),
    ("status", PropertyType::String),
    ("device_type", PropertyType::String),
    ("bootargs", PropertyType::String),
    ("stdout-path", PropertyType::String),
    ("phandle", PropertyType::UInt32),
    ("linux,phandle", PropertyType::UInt32),
];

/// Returns the fixed type for `name`, if it has one.
#[must_use]
pub fn name_override(name: &str) -> Option<PropertyType> {
    NAME_OVERRIDES
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, ptype)| *ptype)
}

/// Guesses the type of a raw property value from its shape.
///
/// The guess cannot tell 64-bit values from pairs of 32-bit cells, so any
/// length that is a multiple of four is reported as [`PropertyType::UInt32`].
///
/// ```
/// use sdt::codec::{PropertyType, guess_type};
///
/// assert_eq!(guess_type(b"\x00\x00\x00\x05"), PropertyType::UInt32);
/// assert_eq!(guess_type(b"hello\x00"), PropertyType::String);
/// assert_eq!(guess_type(b""), PropertyType::Empty);
/// assert_eq!(guess_type(b"\x01\x02\x03"), PropertyType::UInt8);
/// ```
#[must_use]
pub fn guess_type(bytes: &[u8]) -> PropertyType {
    let (Some(&first), Some(&last)) = (bytes.first(), bytes.last()) else {
        return PropertyType::Empty;
    };

    if first != 0 && bytes.len() > 1 && last == 0 {
        if let Some(strings) = split_strings(bytes) {
            if string_test(bytes, true) {
                return if strings.len() > 1 {
                    PropertyType::MultiString
                } else {
                    PropertyType::String
                };
            }
        }
    }

    if bytes.len().is_multiple_of(4) {
        PropertyType::UInt32
    } else {
        PropertyType::UInt8
    }
}

/// Like [`guess_type`], but a fixed type for `name` takes precedence.
#[must_use]
pub fn guess_type_named(name: &str, bytes: &[u8]) -> PropertyType {
    if bytes.is_empty() {
        return PropertyType::Empty;
    }
    match name_override(name) {
        Some(ptype) if fits(bytes, ptype) => ptype,
        _ => guess_type(bytes),
    }
}

/// Returns `true` if `bytes` looks like one or more printable strings.
///
/// Every string must be non-empty and made of printable ASCII. CR and LF are
/// accepted only when `allow_multiline` is set. The UTF-8 typographic quotes
/// U+201C and U+201D are also accepted.
#[must_use]
pub fn string_test(bytes: &[u8], allow_multiline: bool) -> bool {
    if bytes.last() != Some(&0) {
        return false;
    }

    let mut position = 0;
    while position < bytes.len() {
        let start = position;
        while position < bytes.len() && is_printable(bytes[position]) {
            position += 1;
        }
        match bytes[position] {
            b'\r' | b'\n' if allow_multiline => {
                position += 1;
                continue;
            }
            0 if position != start => {}
            _ => {
                let quote = bytes.get(position..position + 3);
                if position + 3 < bytes.len()
                    && matches!(quote, Some(b"\xe2\x80\x9c" | b"\xe2\x80\x9d"))
                {
                    position += 3;
                    continue;
                }
                return false;
            }
        }
        position += 1;
    }
    true
}

fn is_printable(byte: u8) -> bool {
    matches!(byte, 0x20..=0x7e | b'\t' | 0x0b | 0x0c)
}

/// A single empty string, or non-empty strings with no control characters
/// other than whitespace.
fn is_text(bytes: &[u8]) -> bool {
    if bytes == [0] {
        return true;
    }
    split_strings(bytes).is_some_and(|strings| {
        strings.iter().all(|string| {
            !string.is_empty()
                && string
                    .chars()
                    .all(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        })
    })
}

fn split_strings(bytes: &[u8]) -> Option<Vec<String>> {
    let body = bytes.strip_suffix(&[0])?;
    let text = std::str::from_utf8(body).ok()?;
    Some(text.split('\0').map(str::to_owned).collect())
}

/// Returns `true` if `bytes` can be decoded as `ptype` without loss.
#[must_use]
pub fn fits(bytes: &[u8], ptype: PropertyType) -> bool {
    match ptype {
        PropertyType::Empty => bytes.is_empty(),
        PropertyType::String | PropertyType::MultiString => is_text(bytes),
        PropertyType::Unknown => true,
        integer => integer
            .width()
            .is_some_and(|width| !bytes.is_empty() && bytes.len().is_multiple_of(width)),
    }
}

/// Decodes `bytes` as `hint`, falling back to the guessed type when the bytes
/// do not fit the hint.
#[must_use]
pub fn decode(bytes: &[u8], hint: PropertyType) -> Vec<Value> {
    decode_typed(bytes, hint).1
}

/// Like [`decode`], but also returns the type that was actually used.
#[must_use]
pub fn decode_typed(bytes: &[u8], hint: PropertyType) -> (PropertyType, Vec<Value>) {
    if bytes.is_empty() {
        return (PropertyType::Empty, Vec::new());
    }
    let ptype = if hint != PropertyType::Unknown && fits(bytes, hint) {
        hint
    } else {
        guess_type(bytes)
    };

    let values = match ptype {
        PropertyType::String | PropertyType::MultiString => split_strings(bytes)
            .unwrap_or_default()
            .into_iter()
            .map(Value::Str)
            .collect(),
        integer => {
            let width = integer.width().unwrap_or(1);
            bytes
                .chunks_exact(width)
                .map(|chunk| {
                    Value::Int(
                        chunk
                            .iter()
                            .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte)),
                    )
                })
                .collect()
        }
    };
    (ptype, values)
}

/// Encodes `values` as raw bytes.
///
/// Integers are written big-endian at the width of `ptype` (four bytes for
/// non-integer types). An integer too large for that width is written as
/// four bytes if it fits in 32 bits, or eight bytes otherwise. Strings are
/// joined with NUL separators: a list writes a NUL after every element, a
/// single string is written bare. A list mixing integers and strings is
/// encoded as strings.
#[must_use]
pub fn encode(values: &[Value], ptype: PropertyType) -> Vec<u8> {
    if values.iter().any(|value| matches!(value, Value::Str(_))) {
        let strings: Vec<String> = values.iter().map(ToString::to_string).collect();
        return match strings.as_slice() {
            [single] => single.as_bytes().to_vec(),
            many => many
                .iter()
                .flat_map(|string| string.bytes().chain(std::iter::once(0)))
                .collect(),
        };
    }

    let width = ptype.width().unwrap_or(4);
    let mut bytes = Vec::with_capacity(values.len() * width);
    for value in values.iter().filter_map(Value::as_u64) {
        let width = if width < 8 && value >> (width * 8) != 0 {
            if u32::try_from(value).is_ok() { 4 } else { 8 }
        } else {
            width
        };
        bytes.extend_from_slice(&value.to_be_bytes()[8 - width..]);
    }
    bytes
}

/// Encodes `values` the way they are stored in a property: like [`encode`],
/// but string values are always NUL-terminated.
#[must_use]
pub fn encode_property(values: &[Value], ptype: PropertyType) -> Vec<u8> {
    let mut bytes = encode(values, ptype);
    if values.len() == 1 && matches!(values[0], Value::Str(_)) {
        bytes.push(0);
    }
    bytes
}

/// Parses a value written in source syntax.
///
/// Accepts one or more `<...>` cell groups, one or more quoted strings, a
/// `[...]` byte string, or a single bare integer. Anything else is returned
/// as a single string.
///
/// # Errors
///
/// Returns [`CodecError::BadInteger`] for a malformed token inside `<...>`,
/// and [`CodecError::Unterminated`] for an unclosed literal.
///
/// ```
/// use sdt::codec::{Value, parse_literal};
///
/// assert_eq!(
///     parse_literal("<0x1 2>").unwrap(),
///     vec![Value::Int(1), Value::Int(2)],
/// );
/// assert!(parse_literal("<0x1 zz>").is_err());
/// ```
pub fn parse_literal(text: &str) -> Result<Vec<Value>, CodecError> {
    let text = text.trim().trim_end_matches(';').trim_end();
    let Some(first) = text.chars().next() else {
        return Ok(Vec::new());
    };

    match first {
        '<' | '"' | '[' => {
            let mut values = Vec::new();
            let mut rest = text;
            loop {
                rest = rest.trim_start();
                let (mut parsed, remainder) = parse_group(rest)?;
                values.append(&mut parsed);
                rest = remainder.trim_start();
                match rest.strip_prefix(',') {
                    Some(next) => rest = next,
                    None if rest.is_empty() => return Ok(values),
                    None => return Err(CodecError::Unterminated(text.to_owned())),
                }
            }
        }
        _ => Ok(vec![match parse_int(text) {
            Some(value) => Value::Int(value),
            None => Value::Str(text.to_owned()),
        }]),
    }
}

/// Parses one `<...>`, `"..."` or `[...]` group and returns the rest of the
/// input.
fn parse_group(text: &str) -> Result<(Vec<Value>, &str), CodecError> {
    let unterminated = || CodecError::Unterminated(text.to_owned());
    if let Some(body) = text.strip_prefix('<') {
        let end = body.find('>').ok_or_else(unterminated)?;
        let values = body[..end]
            .split_whitespace()
            .map(|token| {
                parse_int(token)
                    .map(Value::Int)
                    .ok_or_else(|| CodecError::BadInteger(token.to_owned()))
            })
            .collect::<Result<_, _>>()?;
        Ok((values, &body[end + 1..]))
    } else if let Some(body) = text.strip_prefix('[') {
        let end = body.find(']').ok_or_else(unterminated)?;
        let digits: String = body[..end].split_whitespace().collect();
        if digits.len() % 2 != 0 {
            return Err(CodecError::BadBytes(body[..end].to_owned()));
        }
        let values = (0..digits.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&digits[i..i + 2], 16)
                    .map(|byte| Value::Int(byte.into()))
                    .map_err(|_| CodecError::BadBytes(body[..end].to_owned()))
            })
            .collect::<Result<_, _>>()?;
        Ok((values, &body[end + 1..]))
    } else if let Some(body) = text.strip_prefix('"') {
        let mut string = String::new();
        let mut chars = body.char_indices();
        while let Some((index, c)) = chars.next() {
            match c {
                '"' => return Ok((vec![Value::Str(string)], &body[index + 1..])),
                '\\' => match chars.next() {
                    Some((_, 'n')) => string.push('\n'),
                    Some((_, 't')) => string.push('\t'),
                    Some((_, 'r')) => string.push('\r'),
                    Some((_, other)) => string.push(other),
                    None => return Err(unterminated()),
                },
                c => string.push(c),
            }
        }
        Err(unterminated())
    } else {
        Err(unterminated())
    }
}

/// Parses a decimal or `0x` hexadecimal integer, ignoring C-style `U`/`L`
/// suffixes.
#[must_use]
pub fn parse_int(token: &str) -> Option<u64> {
    let token = token.trim_end_matches(['U', 'L', 'u', 'l']);
    if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
        token.parse().ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_type_by_shape() {
        assert_eq!(guess_type(b"\x00\x00\x00\x05"), PropertyType::UInt32);
        assert_eq!(guess_type(b"hello\x00"), PropertyType::String);
        assert_eq!(guess_type(b""), PropertyType::Empty);
        assert_eq!(guess_type(b"\x01\x02\x03"), PropertyType::UInt8);
        assert_eq!(guess_type(b"a\0bc\0"), PropertyType::MultiString);
        // Not printable, but cell-sized.
        assert_eq!(guess_type(b"\x01\x02\x03\x00"), PropertyType::UInt32);
        // An empty string in the middle is not a string list.
        assert_eq!(guess_type(b"ab\0\0cd\0\0"), PropertyType::UInt32);
    }

    /// A 64-bit value and a pair of 32-bit cells have the same shape. The
    /// guess picks the narrower width; this is a heuristic, not a guarantee.
    #[test]
    fn guess_type_prefers_u32_for_eight_bytes() {
        let bytes = 0x1122_3344_5566_7788u64.to_be_bytes();
        assert_eq!(guess_type(&bytes), PropertyType::UInt32);
        assert_eq!(
            decode(&bytes, PropertyType::Unknown),
            vec![Value::Int(0x1122_3344), Value::Int(0x5566_7788)]
        );
        assert_eq!(
            decode(&bytes, PropertyType::UInt64),
            vec![Value::Int(0x1122_3344_5566_7788)]
        );
    }

    #[test]
    fn name_override_wins_when_bytes_fit() {
        assert_eq!(guess_type_named("compatible", b"ab\0"), PropertyType::String);
        assert_eq!(
            guess_type_named("compatible", b"\0\0\0\x01"),
            PropertyType::UInt32
        );
        assert_eq!(guess_type_named("phandle", b"\x00\x00\x00\x01"), PropertyType::UInt32);
    }

    #[test]
    fn string_test_rules() {
        assert!(string_test(b"line one\nline two\0", true));
        assert!(!string_test(b"line one\nline two\0", false));
        assert!(string_test(b"say \xe2\x80\x9chi\xe2\x80\x9d ok\0", true));
        assert!(!string_test(b"\0", true));
        assert!(!string_test(b"abc", true));
        assert!(!string_test(b"a\x01b\0", true));
    }

    #[test]
    fn decode_falls_back_instead_of_truncating() {
        assert_eq!(
            decode(b"\x01\x02\x03", PropertyType::UInt32),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
        assert_eq!(
            decode(b"\x00\x01\x00\x02", PropertyType::UInt16),
            vec![Value::Int(1), Value::Int(2)]
        );
        assert_eq!(
            decode(b"a\0b\0", PropertyType::String),
            vec![Value::from("a"), Value::from("b")]
        );
        assert_eq!(decode(b"", PropertyType::UInt32), Vec::<Value>::new());
    }

    #[test]
    fn string_hints_need_text() {
        assert!(!fits(&[0, 0, 0, 0], PropertyType::String));
        assert!(!fits(&[0, 0, 0, 1], PropertyType::String));
        assert!(!fits(&[0, 0, 1, 0], PropertyType::MultiString));
        assert!(fits(b"\0", PropertyType::String));
        assert!(fits("caf\u{e9}\0".as_bytes(), PropertyType::String));
        assert!(fits(b"a\0b\0", PropertyType::MultiString));
        assert_eq!(decode(&[0, 0, 0, 0], PropertyType::String), [Value::Int(0)]);
    }

    #[test]
    fn encode_widths_and_strings() {
        assert_eq!(
            encode(&[Value::Int(1), Value::Int(2)], PropertyType::UInt32),
            [0, 0, 0, 1, 0, 0, 0, 2]
        );
        assert_eq!(
            encode(&[Value::Int(0x1_0000_0000)], PropertyType::UInt32),
            [0, 0, 0, 1, 0, 0, 0, 0]
        );
        assert_eq!(encode(&[Value::Int(0x1ff)], PropertyType::UInt8), [0, 0, 1, 0xff]);
        assert_eq!(encode(&[Value::from("ok")], PropertyType::String), b"ok");
        assert_eq!(
            encode(&[Value::from("a"), Value::from("b")], PropertyType::MultiString),
            b"a\0b\0"
        );
        assert_eq!(
            encode(&[Value::from("a"), Value::Int(7)], PropertyType::Unknown),
            b"a\x007\0"
        );
        assert_eq!(encode_property(&[Value::from("ok")], PropertyType::String), b"ok\0");
        assert!(encode(&[], PropertyType::Empty).is_empty());
    }

    #[test]
    fn parse_literal_forms() {
        assert_eq!(
            parse_literal("<0x10 20>").unwrap(),
            vec![Value::Int(16), Value::Int(20)]
        );
        assert_eq!(
            parse_literal("<1>, <2>;").unwrap(),
            vec![Value::Int(1), Value::Int(2)]
        );
        assert_eq!(
            parse_literal(r#""a", "b\"c""#).unwrap(),
            vec![Value::from("a"), Value::from("b\"c")]
        );
        assert_eq!(parse_literal("0x20").unwrap(), vec![Value::Int(32)]);
        assert_eq!(parse_literal("okay").unwrap(), vec![Value::from("okay")]);
        assert_eq!(
            parse_literal("[0a 0B]").unwrap(),
            vec![Value::Int(10), Value::Int(11)]
        );
        assert_eq!(
            parse_literal("<1 0xzz>").unwrap_err(),
            CodecError::BadInteger("0xzz".to_owned())
        );
        assert!(matches!(
            parse_literal("<1 2").unwrap_err(),
            CodecError::Unterminated(_)
        ));
        assert!(matches!(
            parse_literal("[abc]").unwrap_err(),
            CodecError::BadBytes(_)
        ));
    }

    #[test]
    fn type_names_round_trip() {
        for ptype in [
            PropertyType::Empty,
            PropertyType::String,
            PropertyType::MultiString,
            PropertyType::UInt8,
            PropertyType::UInt16,
            PropertyType::UInt32,
            PropertyType::UInt64,
            PropertyType::Unknown,
        ] {
            assert_eq!(ptype.as_str().parse::<PropertyType>().unwrap(), ptype);
        }
    }
}
