// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Character cursor over device tree source text.
//!
//! The source grammar is context sensitive (`-` is part of a node name but an
//! operator inside an expression), so the parser pulls lexemes on demand
//! instead of consuming a token stream.

use crate::error::Error;

#[derive(Clone)]
pub(super) struct Lexer<'s> {
    source: &'s str,
    position: usize,
    line: usize,
    at_line_start: bool,
}

/// Characters allowed in node names, property names and labels.
pub(super) fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ',' | '.' | '_' | '+' | '*' | '#' | '?' | '@' | '-')
}

pub(super) fn is_label(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl<'s> Lexer<'s> {
    pub(super) fn new(source: &'s str) -> Self {
        Self {
            source,
            position: 0,
            line: 1,
            at_line_start: true,
        }
    }

    pub(super) fn line(&self) -> usize {
        self.line
    }

    pub(super) fn error(&self, message: impl Into<String>) -> Error {
        Error::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn rest(&self) -> &'s str {
        &self.source[self.position..]
    }

    pub(super) fn peek_raw(&self) -> Option<char> {
        self.rest().chars().next()
    }

    pub(super) fn bump(&mut self) -> Option<char> {
        let c = self.peek_raw()?;
        self.position += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.at_line_start = true;
        } else if !c.is_whitespace() {
            self.at_line_start = false;
        }
        Some(c)
    }

    pub(super) fn at_end(&mut self) -> bool {
        self.skip_trivia();
        self.position >= self.source.len()
    }

    /// Skips whitespace, comments and cpp line markers (`# 12 "file"`).
    pub(super) fn skip_trivia(&mut self) {
        loop {
            let rest = self.rest();
            if rest.starts_with("//") {
                self.skip_line();
            } else if rest.starts_with("/*") {
                self.position += 2;
                while !self.rest().is_empty() && !self.rest().starts_with("*/") {
                    self.bump();
                }
                self.position = (self.position + 2).min(self.source.len());
                self.at_line_start = false;
            } else if self.at_line_start && is_line_marker(rest) {
                self.skip_line();
            } else if self.peek_raw().is_some_and(char::is_whitespace) {
                self.bump();
            } else {
                return;
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek_raw() {
            if c == '\n' {
                return;
            }
            self.bump();
        }
    }

    /// Returns the next significant character without consuming it.
    pub(super) fn peek(&mut self) -> Option<char> {
        self.skip_trivia();
        self.peek_raw()
    }

    pub(super) fn looking_at(&mut self, text: &str) -> bool {
        self.skip_trivia();
        self.rest().starts_with(text)
    }

    /// Consumes `text` if it comes next.
    pub(super) fn eat(&mut self, text: &str) -> bool {
        if self.looking_at(text) {
            for _ in text.chars() {
                self.bump();
            }
            true
        } else {
            false
        }
    }

    pub(super) fn expect(&mut self, text: &str) -> Result<(), Error> {
        if self.eat(text) {
            Ok(())
        } else {
            let found = self.peek().map_or_else(|| "end of input".to_owned(), |c| format!("`{c}`"));
            Err(self.error(format!("expected `{text}`, found {found}")))
        }
    }

    /// Reads a node name, property name or label.
    pub(super) fn name(&mut self) -> Option<&'s str> {
        self.skip_trivia();
        let start = self.position;
        while self.peek_raw().is_some_and(is_name_char) {
            self.bump();
        }
        (self.position > start).then(|| &self.source[start..self.position])
    }

    /// Reads a path inside `&{...}`, after the opening brace.
    pub(super) fn path(&mut self) -> Result<&'s str, Error> {
        let start = self.position;
        while let Some(c) = self.peek_raw() {
            if c == '}' {
                let path = &self.source[start..self.position];
                self.bump();
                return Ok(path.trim());
            }
            self.bump();
        }
        Err(self.error("unterminated path reference"))
    }

    /// Reads the body of a string literal; the opening quote must already be
    /// consumed.
    pub(super) fn string(&mut self) -> Result<Vec<u8>, Error> {
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some('"') => return Ok(bytes),
                Some('\\') => bytes.push(self.escape()?),
                Some(c) => {
                    let mut buffer = [0; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buffer).as_bytes());
                }
            }
        }
    }

    /// Reads a character literal; the opening quote must already be consumed.
    pub(super) fn char_literal(&mut self) -> Result<u64, Error> {
        let value = match self.bump() {
            Some('\\') => self.escape()?,
            Some(c) if c.is_ascii() && c != '\'' => c as u8,
            _ => return Err(self.error("bad character literal")),
        };
        if self.bump() != Some('\'') {
            return Err(self.error("unterminated character literal"));
        }
        Ok(u64::from(value))
    }

    fn escape(&mut self) -> Result<u8, Error> {
        let c = self.bump().ok_or_else(|| self.error("unterminated escape"))?;
        Ok(match c {
            'a' => 0x07,
            'b' => 0x08,
            't' => b'\t',
            'n' => b'\n',
            'v' => 0x0b,
            'f' => 0x0c,
            'r' => b'\r',
            'x' => {
                let digits = self.take_while(2, |c| c.is_ascii_hexdigit());
                u8::from_str_radix(digits, 16).map_err(|_| self.error("bad hex escape"))?
            }
            '0'..='7' => {
                let start = self.position - 1;
                self.take_while(2, |c| ('0'..='7').contains(&c));
                let digits = &self.source[start..self.position];
                u8::from_str_radix(digits, 8).map_err(|_| self.error("bad octal escape"))?
            }
            other if other.is_ascii() => other as u8,
            _ => return Err(self.error("bad escape")),
        })
    }

    fn take_while(&mut self, max: usize, accept: impl Fn(char) -> bool) -> &'s str {
        let start = self.position;
        for _ in 0..max {
            match self.peek_raw() {
                Some(c) if accept(c) => {
                    self.bump();
                }
                _ => break,
            }
        }
        &self.source[start..self.position]
    }

    /// Reads a C integer literal: hex, octal or decimal, with optional `U`
    /// and `L` suffixes.
    pub(super) fn integer(&mut self) -> Result<u64, Error> {
        self.skip_trivia();
        let start = self.position;
        while self.peek_raw().is_some_and(|c| c.is_ascii_alphanumeric()) {
            self.bump();
        }
        let literal = &self.source[start..self.position];
        let digits = literal.trim_end_matches(['U', 'L', 'u', 'l']);
        let parsed = if let Some(hex) = digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
        {
            u64::from_str_radix(hex, 16)
        } else if digits.len() > 1 && digits.starts_with('0') {
            u64::from_str_radix(&digits[1..], 8)
        } else {
            digits.parse()
        };
        parsed.map_err(|_| self.error(format!("bad integer literal `{literal}`")))
    }

    /// Reads a two-digit hex byte inside `[...]`.
    pub(super) fn hex_byte(&mut self) -> Result<u8, Error> {
        self.skip_trivia();
        let digits = self.take_while(2, |c| c.is_ascii_hexdigit());
        if digits.len() != 2 {
            return Err(self.error("byte strings need two hex digits per byte"));
        }
        u8::from_str_radix(digits, 16).map_err(|_| self.error("bad byte"))
    }
}

fn is_line_marker(rest: &str) -> bool {
    let Some(after) = rest.strip_prefix('#') else {
        return false;
    };
    after.starts_with(' ') || after.starts_with("line") || after.starts_with("pragma")
}
