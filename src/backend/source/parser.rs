// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Recursive descent parser for the common device tree source subset.
//!
//! Parsing happens in two passes. The first builds draft nodes whose values
//! may still hold unresolved `&label` references. The second assigns
//! phandles to referenced nodes the way dtc does and flattens every value to
//! bytes.

use std::collections::BTreeSet;

use log::debug;
use sdt_device_tree::MemoryReservation;

use super::SourceNode;
use super::lexer::{Lexer, is_label};
use crate::backend::join_path;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Label(String),
    Path(String),
}

#[derive(Debug, Clone)]
struct Reference {
    target: Target,
    line: usize,
}

#[derive(Debug, Clone)]
enum Chunk {
    Bytes(Vec<u8>),
    /// Four bytes holding the target's phandle.
    Phandle(Reference),
    /// The target's full path, NUL terminated.
    Path(Reference),
}

#[derive(Debug, Default)]
struct Draft {
    name: String,
    parent: Option<usize>,
    children: Vec<usize>,
    properties: Vec<(String, Vec<Chunk>)>,
    labels: Vec<String>,
    alive: bool,
}

/// A parsed source file, flattened to bytes.
#[derive(Debug)]
pub(super) struct Parsed {
    pub(super) nodes: Vec<SourceNode>,
    pub(super) reservations: Vec<MemoryReservation>,
    pub(super) boot_cpuid_phys: u32,
}

struct Parser<'s> {
    lexer: Lexer<'s>,
    nodes: Vec<Draft>,
    reservations: Vec<MemoryReservation>,
    boot_cpuid_phys: u32,
}

pub(super) fn parse(source: &str) -> Result<Parsed> {
    let mut parser = Parser {
        lexer: Lexer::new(source),
        nodes: vec![Draft {
            alive: true,
            ..Draft::default()
        }],
        reservations: Vec::new(),
        boot_cpuid_phys: 0,
    };
    parser.document()?;
    parser.finish()
}

impl<'s> Parser<'s> {
    fn document(&mut self) -> Result<()> {
        while !self.lexer.at_end() {
            if self.lexer.eat("/dts-v1/") || self.lexer.eat("/plugin/") {
                self.lexer.expect(";")?;
            } else if self.lexer.eat("/memreserve/") {
                let address = self.lexer.integer()?;
                let size = self.lexer.integer()?;
                self.lexer.expect(";")?;
                self.reservations.push(MemoryReservation::new(address, size));
            } else if self.lexer.looking_at("/include/") {
                return Err(self.lexer.error("/include/ is not supported; preprocess the source first"));
            } else if self.lexer.eat("/delete-node/") {
                let reference = self.reference()?;
                let node = self.target(&reference)?;
                if node == 0 {
                    return Err(self.lexer.error("cannot delete the root node"));
                }
                self.delete(node);
                self.lexer.expect(";")?;
            } else if self.lexer.eat("/omit-if-no-ref/") {
                continue;
            } else {
                self.top_level_block()?;
            }
        }
        Ok(())
    }

    /// `/ { ... };`, `label: &ref { ... };` or `&{/path} { ... };`.
    fn top_level_block(&mut self) -> Result<()> {
        let labels = self.labels();
        let node = if self.lexer.eat("/") {
            0
        } else if self.lexer.looking_at("&") {
            let reference = self.reference()?;
            self.target(&reference)?
        } else {
            return Err(self.unexpected());
        };
        self.add_labels(node, labels);
        self.lexer.expect("{")?;
        self.body(node)?;
        self.lexer.expect(";")
    }

    fn body(&mut self, node: usize) -> Result<()> {
        loop {
            if self.lexer.eat("}") {
                return Ok(());
            }
            if self.lexer.at_end() {
                return Err(self.lexer.error("unexpected end of input inside a node"));
            }
            if self.lexer.eat("/delete-node/") {
                let name = self.name()?;
                if let Some(child) = self.child(node, name) {
                    self.delete(child);
                }
                self.lexer.expect(";")?;
                continue;
            }
            if self.lexer.eat("/delete-property/") {
                let name = self.name()?;
                self.nodes[node].properties.retain(|(existing, _)| existing != name);
                self.lexer.expect(";")?;
                continue;
            }
            if self.lexer.eat("/omit-if-no-ref/") {
                continue;
            }
            if self.lexer.looking_at("/include/") {
                return Err(self.lexer.error("/include/ is not supported; preprocess the source first"));
            }

            let labels = self.labels();
            let name = self.name()?;
            if name.starts_with("#include") || name == "#define" || name.starts_with("#if") {
                return Err(self.lexer.error("preprocessor directive; preprocess the source first"));
            }
            if self.lexer.eat("{") {
                let child = match self.child(node, name) {
                    Some(existing) => existing,
                    None => self.new_child(node, name),
                };
                self.add_labels(child, labels);
                self.body(child)?;
                self.lexer.expect(";")?;
            } else {
                let value = if self.lexer.eat("=") {
                    self.value()?
                } else {
                    Vec::new()
                };
                self.lexer.expect(";")?;
                let properties = &mut self.nodes[node].properties;
                match properties.iter_mut().find(|(existing, _)| existing == name) {
                    Some((_, existing)) => *existing = value,
                    None => properties.push((name.to_owned(), value)),
                }
            }
        }
    }

    /// Reads any `label:` prefixes.
    fn labels(&mut self) -> Vec<String> {
        let mut labels = Vec::new();
        loop {
            let saved = self.lexer.clone();
            match self.lexer.name() {
                Some(name) if is_label(name) && self.lexer.eat(":") => labels.push(name.to_owned()),
                _ => {
                    self.lexer = saved;
                    return labels;
                }
            }
        }
    }

    fn name(&mut self) -> Result<&'s str> {
        match self.lexer.name() {
            Some(name) => Ok(name),
            None => Err(self.unexpected()),
        }
    }

    fn unexpected(&mut self) -> Error {
        match self.lexer.peek() {
            Some(c) => self.lexer.error(format!("unexpected `{c}`")),
            None => self.lexer.error("unexpected end of input"),
        }
    }

    /// `&label` or `&{/path}`.
    fn reference(&mut self) -> Result<Reference> {
        self.lexer.expect("&")?;
        let line = self.lexer.line();
        let target = if self.lexer.eat("{") {
            Target::Path(self.lexer.path()?.to_owned())
        } else {
            Target::Label(self.name()?.to_owned())
        };
        Ok(Reference { target, line })
    }

    /// A comma separated list of strings, cell arrays, byte strings and
    /// path references.
    fn value(&mut self) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        loop {
            if self.lexer.eat("\"") {
                let mut bytes = self.lexer.string()?;
                bytes.push(0);
                chunks.push(Chunk::Bytes(bytes));
            } else if self.lexer.eat("/bits/") {
                let bits = self.lexer.integer()?;
                self.cells(bits, &mut chunks)?;
            } else if self.lexer.looking_at("<") {
                self.cells(32, &mut chunks)?;
            } else if self.lexer.eat("[") {
                let mut bytes = Vec::new();
                while !self.lexer.eat("]") {
                    bytes.push(self.lexer.hex_byte()?);
                }
                chunks.push(Chunk::Bytes(bytes));
            } else if self.lexer.looking_at("&") {
                chunks.push(Chunk::Path(self.reference()?));
            } else {
                return Err(self.unexpected());
            }
            // Labels may follow any value chunk; they carry no bytes.
            self.labels();
            if !self.lexer.eat(",") {
                return Ok(chunks);
            }
        }
    }

    fn cells(&mut self, bits: u64, chunks: &mut Vec<Chunk>) -> Result<()> {
        let width = match bits {
            8 => 1,
            16 => 2,
            32 => 4,
            64 => 8,
            _ => return Err(self.lexer.error(format!("/bits/ {bits} is not 8, 16, 32 or 64"))),
        };
        self.lexer.expect("<")?;
        let mut bytes = Vec::new();
        loop {
            self.labels();
            if self.lexer.eat(">") {
                break;
            }
            if self.lexer.looking_at("&") {
                if width != 4 {
                    return Err(self.lexer.error("references are only allowed in 32-bit cells"));
                }
                chunks.push(Chunk::Bytes(std::mem::take(&mut bytes)));
                chunks.push(Chunk::Phandle(self.reference()?));
                continue;
            }
            let value = self.cell()?;
            if width < 8 && value >> (8 * width) != 0 && !fits_signed(value, width) {
                return Err(self.lexer.error(format!("{value:#x} does not fit in {bits} bits")));
            }
            bytes.extend_from_slice(&value.to_be_bytes()[8 - width..]);
        }
        chunks.push(Chunk::Bytes(bytes));
        Ok(())
    }

    fn cell(&mut self) -> Result<u64> {
        if self.lexer.eat("(") {
            let value = self.expression()?;
            self.lexer.expect(")")?;
            Ok(value)
        } else if self.lexer.eat("'") {
            self.lexer.char_literal()
        } else {
            self.lexer.integer()
        }
    }

    fn expression(&mut self) -> Result<u64> {
        let condition = self.binary(0)?;
        if self.lexer.eat("?") {
            let then = self.expression()?;
            self.lexer.expect(":")?;
            let otherwise = self.expression()?;
            Ok(if condition != 0 { then } else { otherwise })
        } else {
            Ok(condition)
        }
    }

    /// Precedence climbing over the C binary operators.
    fn binary(&mut self, min_precedence: u8) -> Result<u64> {
        let mut left = self.unary()?;
        while let Some((operator, precedence)) = self.peek_operator() {
            if precedence < min_precedence {
                break;
            }
            self.lexer.eat(operator);
            let right = self.binary(precedence + 1)?;
            left = self.apply(operator, left, right)?;
        }
        Ok(left)
    }

    fn peek_operator(&mut self) -> Option<(&'static str, u8)> {
        const OPERATORS: &[(&str, u8)] = &[
            ("||", 0),
            ("&&", 1),
            ("<<", 7),
            (">>", 7),
            ("<=", 6),
            (">=", 6),
            ("==", 5),
            ("!=", 5),
            ("|", 2),
            ("^", 3),
            ("&", 4),
            ("<", 6),
            (">", 6),
            ("+", 8),
            ("-", 8),
            ("*", 9),
            ("/", 9),
            ("%", 9),
        ];
        OPERATORS
            .iter()
            .copied()
            .find(|(operator, _)| self.lexer.looking_at(operator))
    }

    fn apply(&self, operator: &str, left: u64, right: u64) -> Result<u64> {
        let truth = |condition: bool| u64::from(condition);
        Ok(match operator {
            "||" => truth(left != 0 || right != 0),
            "&&" => truth(left != 0 && right != 0),
            "|" => left | right,
            "^" => left ^ right,
            "&" => left & right,
            "==" => truth(left == right),
            "!=" => truth(left != right),
            "<" => truth(left < right),
            ">" => truth(left > right),
            "<=" => truth(left <= right),
            ">=" => truth(left >= right),
            "<<" => left.wrapping_shl(u32::try_from(right).unwrap_or(u32::MAX)),
            ">>" => left.wrapping_shr(u32::try_from(right).unwrap_or(u32::MAX)),
            "+" => left.wrapping_add(right),
            "-" => left.wrapping_sub(right),
            "*" => left.wrapping_mul(right),
            "/" | "%" if right == 0 => return Err(self.lexer.error("division by zero")),
            "/" => left / right,
            "%" => left % right,
            _ => return Err(self.lexer.error(format!("unknown operator `{operator}`"))),
        })
    }

    fn unary(&mut self) -> Result<u64> {
        if self.lexer.eat("-") {
            Ok(self.unary()?.wrapping_neg())
        } else if self.lexer.eat("~") {
            Ok(!self.unary()?)
        } else if self.lexer.eat("!") {
            Ok(u64::from(self.unary()? == 0))
        } else {
            self.cell()
        }
    }

    fn child(&self, parent: usize, name: &str) -> Option<usize> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[child].name == name)
    }

    fn new_child(&mut self, parent: usize, name: &str) -> usize {
        let key = self.nodes.len();
        self.nodes.push(Draft {
            name: name.to_owned(),
            parent: Some(parent),
            alive: true,
            ..Draft::default()
        });
        self.nodes[parent].children.push(key);
        key
    }

    fn add_labels(&mut self, node: usize, labels: Vec<String>) {
        for label in labels {
            if !self.nodes[node].labels.contains(&label) {
                self.nodes[node].labels.push(label);
            }
        }
    }

    fn delete(&mut self, node: usize) {
        if let Some(parent) = self.nodes[node].parent {
            self.nodes[parent].children.retain(|&child| child != node);
        }
        let mut stack = vec![node];
        while let Some(key) = stack.pop() {
            self.nodes[key].alive = false;
            stack.extend(self.nodes[key].children.iter().copied());
        }
    }

    fn find_path(&self, path: &str) -> Option<usize> {
        path.split('/')
            .filter(|component| !component.is_empty())
            .try_fold(0, |node, name| self.child(node, name))
    }

    fn find_label(&self, label: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.alive && node.labels.iter().any(|l| l == label))
    }

    fn target(&self, reference: &Reference) -> Result<usize> {
        let found = match &reference.target {
            Target::Label(label) => self.find_label(label),
            Target::Path(path) => self.find_path(path),
        };
        found.ok_or_else(|| Error::Parse {
            line: reference.line,
            message: match &reference.target {
                Target::Label(label) => format!("reference to unknown label `{label}`"),
                Target::Path(path) => format!("reference to unknown path `{path}`"),
            },
        })
    }

    /// Depth-first order of the live nodes.
    fn order(&self) -> Vec<usize> {
        let mut order = Vec::new();
        let mut stack = vec![0];
        while let Some(key) = stack.pop() {
            order.push(key);
            stack.extend(self.nodes[key].children.iter().rev().copied());
        }
        order
    }

    fn explicit_phandle(&self, node: usize) -> Option<u32> {
        self.nodes[node]
            .properties
            .iter()
            .filter(|(name, _)| name == "phandle" || name == "linux,phandle")
            .find_map(|(_, chunks)| match chunks.as_slice() {
                [Chunk::Bytes(bytes)] => <[u8; 4]>::try_from(bytes.as_slice())
                    .ok()
                    .map(u32::from_be_bytes),
                _ => None,
            })
    }

    fn finish(self) -> Result<Parsed> {
        let order = self.order();

        for &key in &order {
            for label in &self.nodes[key].labels {
                if let Some(other) = self.find_label(label).filter(|&other| other != key) {
                    return Err(Error::Parse {
                        line: 0,
                        message: format!(
                            "duplicate label `{label}` on {} and {}",
                            self.path_of(other),
                            self.path_of(key)
                        ),
                    });
                }
            }
        }

        let mut phandles: Vec<Option<u32>> = vec![None; self.nodes.len()];
        let mut used = BTreeSet::new();
        for &key in &order {
            phandles[key] = self.explicit_phandle(key);
            used.extend(phandles[key]);
        }

        // Allocate phandles in reference order, skipping the explicit ones.
        let mut next = 1;
        let mut allocated = Vec::new();
        for &key in &order {
            for (_, chunks) in &self.nodes[key].properties {
                for chunk in chunks {
                    let Chunk::Phandle(reference) = chunk else {
                        continue;
                    };
                    let target = self.target(reference)?;
                    if phandles[target].is_none() {
                        while used.contains(&next) {
                            next += 1;
                        }
                        phandles[target] = Some(next);
                        used.insert(next);
                        allocated.push(target);
                    }
                }
            }
        }
        if !allocated.is_empty() {
            debug!("allocated {} phandles", allocated.len());
        }

        let mut nodes: Vec<SourceNode> = Vec::with_capacity(self.nodes.len());
        for (key, draft) in self.nodes.iter().enumerate() {
            let mut properties = Vec::with_capacity(draft.properties.len() + 1);
            if draft.alive {
                for (name, chunks) in &draft.properties {
                    properties.push((name.clone(), self.flatten(chunks, &phandles)?));
                }
                if allocated.contains(&key) {
                    if let Some(phandle) = phandles[key] {
                        properties.push(("phandle".to_owned(), phandle.to_be_bytes().to_vec()));
                    }
                }
            }
            nodes.push(SourceNode {
                name: draft.name.clone(),
                parent: draft.parent,
                children: draft.children.clone(),
                properties,
                labels: draft.labels.clone(),
                alive: draft.alive,
            });
        }

        Ok(Parsed {
            nodes,
            reservations: self.reservations,
            boot_cpuid_phys: self.boot_cpuid_phys,
        })
    }

    fn flatten(&self, chunks: &[Chunk], phandles: &[Option<u32>]) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for chunk in chunks {
            match chunk {
                Chunk::Bytes(data) => bytes.extend_from_slice(data),
                Chunk::Phandle(reference) => {
                    let target = self.target(reference)?;
                    let phandle = phandles[target].unwrap_or_default();
                    bytes.extend_from_slice(&phandle.to_be_bytes());
                }
                Chunk::Path(reference) => {
                    let target = self.target(reference)?;
                    bytes.extend_from_slice(self.path_of(target).as_bytes());
                    bytes.push(0);
                }
            }
        }
        Ok(bytes)
    }

    fn path_of(&self, node: usize) -> String {
        let mut names = Vec::new();
        let mut current = node;
        while let Some(parent) = self.nodes[current].parent {
            names.push(self.nodes[current].name.as_str());
            current = parent;
        }
        names
            .iter()
            .rev()
            .fold("/".to_owned(), |path, name| join_path(&path, name))
    }
}

/// Accepts negative values written into narrow cells, like `<(-1)>` in a
/// `/bits/ 8` array.
fn fits_signed(value: u64, width: usize) -> bool {
    let shift = 8 * width - 1;
    value >> shift == u64::MAX >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property<'p>(parsed: &'p Parsed, node: &str, name: &str) -> Option<&'p [u8]> {
        let key = parsed.nodes.iter().position(|n| n.alive && n.name == node)?;
        parsed.nodes[key]
            .properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value.as_slice())
    }

    #[test]
    fn values() {
        let parsed = parse(
            r#"/dts-v1/;
            / {
                node {
                    str = "a", "bc";
                    cells = <1 0x20 (2 + 3 * 4) 'A'>;
                    bytes = [01 02ab];
                    wide = /bits/ 16 <0x1234 (-1)>;
                    empty;
                };
            };"#,
        )
        .unwrap();
        assert_eq!(property(&parsed, "node", "str").unwrap(), b"a\0bc\0");
        assert_eq!(
            property(&parsed, "node", "cells").unwrap(),
            [0, 0, 0, 1, 0, 0, 0, 0x20, 0, 0, 0, 14, 0, 0, 0, 0x41]
        );
        assert_eq!(property(&parsed, "node", "bytes").unwrap(), [1, 2, 0xab]);
        assert_eq!(property(&parsed, "node", "wide").unwrap(), [0x12, 0x34, 0xff, 0xff]);
        assert_eq!(property(&parsed, "node", "empty").unwrap(), b"");
    }

    #[test]
    fn references_allocate_phandles_like_dtc() {
        let parsed = parse(
            r#"/dts-v1/;
            / {
                fixed: a { phandle = <1>; };
                b: b { };
                c { clocks = <&b &fixed>; path = &b; target = &{/a}; };
            };"#,
        )
        .unwrap();
        assert_eq!(property(&parsed, "b", "phandle").unwrap(), [0, 0, 0, 2]);
        assert_eq!(property(&parsed, "c", "clocks").unwrap(), [0, 0, 0, 2, 0, 0, 0, 1]);
        assert_eq!(property(&parsed, "c", "path").unwrap(), b"/b\0");
        assert_eq!(property(&parsed, "c", "target").unwrap(), b"/a\0");
    }

    #[test]
    fn amend_and_delete() {
        let parsed = parse(
            r#"/dts-v1/;
            / {
                soc { u: uart { status = "disabled"; old; }; gone { }; };
            };
            &u { status = "okay"; /delete-property/ old; };
            &{/soc} { /delete-node/ gone; };
            / { extra { }; };
            "#,
        )
        .unwrap();
        assert_eq!(property(&parsed, "uart", "status").unwrap(), b"okay\0");
        assert!(property(&parsed, "uart", "old").is_none());
        assert!(parsed.nodes.iter().any(|n| n.name == "gone" && !n.alive));
        assert_eq!(parsed.nodes[0].children.len(), 2);
    }

    #[test]
    fn memreserve() {
        let parsed = parse("/dts-v1/;\n/memreserve/ 0x1000 0x200;\n/ { };").unwrap();
        assert_eq!(parsed.reservations, [MemoryReservation::new(0x1000, 0x200)]);
    }

    #[test]
    fn errors() {
        let unknown = parse("/dts-v1/;\n/ {\n  a { x = <&nope>; };\n};").unwrap_err();
        assert!(matches!(unknown, Error::Parse { line: 3, .. }));
        assert!(matches!(
            parse("/include/ \"x.dtsi\"").unwrap_err(),
            Error::Parse { .. }
        ));
        assert!(matches!(
            parse("/ { a: x { }; a: y { }; };").unwrap_err(),
            Error::Parse { .. }
        ));
        assert!(parse("/ { x = <1>; ").is_err());
    }
}
