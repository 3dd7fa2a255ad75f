// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Carrying comments and labels through a binary round trip.
//!
//! A compiled blob keeps neither comments nor labels. [`annotate`] rewrites
//! source text so that each of them becomes a property the blob does keep:
//! a comment becomes `sdt-comment-N = "..."` and a label becomes
//! `sdt-label-N = "..."` inside the node it names. The
//! [`Printer`](crate::printer::Printer) turns them back.

use std::collections::HashMap;

use log::warn;
use regex::Regex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::printer::{CommentFilter, quote};
use crate::tree::{COMMENT_PREFIX, LABEL_PREFIX, PREAMBLE};

/// Rewrites comments and labels in `source` as synthetic properties.
///
/// Comments are kept only where a property may stand: inside a node, before
/// its first child, and between statements. The first block comment before
/// the root node becomes the `sdt-preamble` of the root. Other comments, and
/// those matching [`Config::comment_droplist`], are dropped with a warning.
/// Line numbers are preserved.
///
/// # Errors
///
/// Returns [`Error::DuplicateLabel`] if one root block labels two nodes
/// alike, or [`Error::Pattern`] for a bad droplist entry.
///
/// ```
/// let source = "/ {\n\t// the uart\n\tuart0: serial@1000 { };\n};\n";
/// let text = sdt::annotate::annotate(source, &sdt::Config::default()).unwrap();
/// assert!(text.contains(r#"sdt-comment-1 = "// the uart";"#));
/// assert!(text.contains(r#"serial@1000 { sdt-label-1 = "uart0";"#));
/// ```
pub fn annotate(source: &str, config: &Config) -> Result<String> {
    let droplist = config.comment_droplist_patterns()?;
    Annotator::new(source, droplist).run()
}

#[derive(Debug)]
struct Annotator<'s> {
    source: &'s str,
    position: usize,
    line: usize,
    out: String,
    filter: CommentFilter,
    droplist: Vec<Regex>,
    comments: usize,
    labels: usize,
    at_line_start: bool,
    /// Text of the current statement, without labels and comments.
    statement: String,
    /// Labels seen at the start of the current statement.
    pending: Vec<String>,
    path: Vec<String>,
    /// Label to the path of the node that claimed it.
    claimed: HashMap<String, String>,
    preamble: Option<String>,
    opened_any: bool,
}

const DIRECTIVES: &[&str] = &[
    "include", "define", "undef", "if", "ifdef", "ifndef", "elif", "else", "endif", "line",
    "pragma", "error", "warning",
];

impl<'s> Annotator<'s> {
    fn new(source: &'s str, droplist: Vec<Regex>) -> Self {
        Self {
            source,
            position: 0,
            line: 1,
            out: String::with_capacity(source.len()),
            filter: CommentFilter::new(),
            droplist,
            comments: 0,
            labels: 0,
            at_line_start: true,
            statement: String::new(),
            pending: Vec::new(),
            path: Vec::new(),
            claimed: HashMap::new(),
            preamble: None,
            opened_any: false,
        }
    }

    fn rest(&self) -> &'s str {
        &self.source[self.position..]
    }

    /// Copies `len` bytes to the output unchanged.
    fn copy(&mut self, len: usize) {
        let text = &self.source[self.position..self.position + len];
        self.line += text.matches('\n').count();
        self.out.push_str(text);
        self.position += len;
    }

    fn run(mut self) -> Result<String> {
        while let Some(c) = self.rest().chars().next() {
            let rest = self.rest();
            if rest.starts_with("//") {
                let len = rest.find('\n').unwrap_or(rest.len());
                self.comment(len);
                continue;
            }
            if rest.starts_with("/*") {
                let len = rest[2..].find("*/").map_or(rest.len(), |end| end + 4);
                self.comment(len);
                continue;
            }

            match c {
                '\n' => {
                    self.copy(1);
                    self.at_line_start = true;
                    continue;
                }
                c if c.is_whitespace() => {
                    self.copy(c.len_utf8());
                    continue;
                }
                '#' if self.at_line_start && is_directive(&rest[1..]) => {
                    let len = rest.find('\n').unwrap_or(rest.len());
                    self.copy(len);
                }
                '"' | '\'' => {
                    let len = quoted_len(rest, c);
                    self.statement.push_str(&rest[..len]);
                    self.copy(len);
                }
                '{' => self.open()?,
                '}' => {
                    self.filter.close();
                    self.path.pop();
                    self.end_statement();
                    self.copy(1);
                }
                ';' => {
                    self.end_statement();
                    self.copy(1);
                }
                _ => match label_len(rest) {
                    Some((name, len)) if self.statement.trim().is_empty() => {
                        self.pending.push(name.to_owned());
                        self.copy(len);
                    }
                    _ => {
                        self.statement.push(c);
                        self.copy(c.len_utf8());
                    }
                },
            }
            self.at_line_start = false;
        }
        Ok(self.out)
    }

    fn end_statement(&mut self) {
        self.statement.clear();
        self.pending.clear();
    }

    fn open(&mut self) -> Result<()> {
        let name = self.statement.trim().to_owned();
        let top_level = self.filter.depth() == 0;
        self.copy(1);
        self.filter.open();
        self.opened_any = true;

        let path = if top_level {
            if name == "/" {
                // Each root block is checked on its own.
                self.claimed.clear();
                "/".to_owned()
            } else {
                name
            }
        } else {
            let parent = self.path.last().map_or("", String::as_str);
            format!("{}/{name}", parent.trim_end_matches('/'))
        };
        self.path.push(path.clone());

        if top_level && path == "/" {
            if let Some(preamble) = self.preamble.take() {
                self.out
                    .push_str(&format!(" {PREAMBLE} = {};", quote(&preamble)));
            }
        }
        for label in std::mem::take(&mut self.pending) {
            if let Some(first) = self.claimed.get(&label) {
                return Err(Error::DuplicateLabel {
                    label,
                    first: first.clone(),
                    second: path,
                });
            }
            self.labels += 1;
            self.out.push_str(&format!(
                " {LABEL_PREFIX}{} = {};",
                self.labels,
                quote(&label)
            ));
            self.claimed.insert(label, path.clone());
        }
        self.statement.clear();
        Ok(())
    }

    /// Handles a comment of `len` bytes at the current position.
    fn comment(&mut self, len: usize) {
        let text = &self.source[self.position..self.position + len];
        let newlines = text.matches('\n').count();
        let line = self.line;
        self.position += len;
        self.line += newlines;

        let between_statements = self.statement.trim().is_empty() && self.pending.is_empty();
        if !self.opened_any && self.preamble.is_none() && text.starts_with("/*") {
            self.preamble = Some(text.to_owned());
        } else if let Some(pattern) = self.droplist.iter().find(|p| p.is_match(text)) {
            warn!("line {line}: dropping comment matching `{pattern}`");
        } else if !self.filter.keeps() || !between_statements {
            warn!("line {line}: dropping comment outside a property position");
        } else {
            self.comments += 1;
            self.out.push_str(&format!(
                "{COMMENT_PREFIX}{} = {};",
                self.comments,
                quote(text)
            ));
        }
        self.out.extend(std::iter::repeat_n('\n', newlines));
    }
}

/// Returns `true` if `rest` (after a `#`) is a preprocessor directive or a
/// line marker rather than a property name such as `#address-cells`.
fn is_directive(rest: &str) -> bool {
    if rest.starts_with([' ', '\t']) || rest.starts_with(|c: char| c.is_ascii_digit()) {
        return true;
    }
    let word: String = rest.chars().take_while(char::is_ascii_alphabetic).collect();
    let after = rest[word.len()..].chars().next();
    DIRECTIVES.contains(&word.as_str()) && after.is_none_or(|c| !is_name_char(c))
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ',' | '.' | '_' | '+' | '*' | '#' | '?' | '@' | '-')
}

/// Returns the label name and the length of `name:` if `rest` starts with a
/// label.
fn label_len(rest: &str) -> Option<(&str, usize)> {
    let first = rest.chars().next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    let after = rest[end..].trim_start_matches([' ', '\t']);
    if after.starts_with(':') {
        let len = rest.len() - after.len() + 1;
        Some((&rest[..end], len))
    } else {
        None
    }
}

/// Length of the string or character literal at the start of `rest`,
/// including its quotes. An unterminated literal runs to the end of the
/// line.
fn quoted_len(rest: &str, quote: char) -> usize {
    let mut escaped = false;
    for (index, c) in rest.char_indices().skip(1) {
        match c {
            '\n' => return index,
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            c if c == quote => return index + 1,
            _ => {}
        }
    }
    rest.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SourceBackend;
    use crate::printer::Printer;
    use crate::tree::{PropertyClass, Tree};

    fn run(source: &str) -> String {
        annotate(source, &Config::default()).unwrap()
    }

    #[test]
    fn comments_become_properties() {
        let text = run("/ {\n\t/* first\n\t   line */\n\tmodel = \"x\"; // trailing\n};\n");
        assert!(text.contains(r#"sdt-comment-1 = "/* first\n\t   line */";"#), "{text}");
        assert!(text.contains(r#"sdt-comment-2 = "// trailing";"#), "{text}");
        assert_eq!(text.lines().count(), 5);
    }

    #[test]
    fn misplaced_comments_are_dropped() {
        let text = run(
            "// before\n/ {\n\ta { };\n\t// after a child\n\treg = <1 /* inside */ 2>;\n};\n/* after */\n",
        );
        assert!(!text.contains("sdt-comment"), "{text}");
        assert!(text.contains("reg = <1  2>;"), "{text}");
    }

    #[test]
    fn first_block_comment_is_the_preamble() {
        let text = run("/* SPDX */\n/dts-v1/;\n/ { };\n");
        assert!(text.contains(r#"/ { sdt-preamble = "/* SPDX */";"#), "{text}");
    }

    #[test]
    fn droplist() {
        let config = Config {
            comment_droplist: vec!["generated".to_owned()],
            ..Config::default()
        };
        let text = annotate("/ {\n\t// generated\n\t// kept\n};\n", &config).unwrap();
        assert!(!text.contains("generated"));
        assert!(text.contains(r#"sdt-comment-1 = "// kept";"#));
    }

    #[test]
    fn labels() {
        let text = run("/ {\n\ta: b: node@0 {\n\t\t#address-cells = <1>;\n\t};\n};\n&a { c: prop = <1>; };\n");
        assert!(text.contains(r#"node@0 { sdt-label-1 = "a"; sdt-label-2 = "b";"#), "{text}");
        assert!(!text.contains(r#""c""#), "{text}");
        assert!(text.contains("#address-cells = <1>;"));
    }

    #[test]
    fn directives_pass_through() {
        let text = run("#include \"x.dtsi\"\n# 1 \"x.dts\"\n/ { #size-cells = <0>; };\n");
        assert!(text.starts_with("#include \"x.dtsi\"\n# 1 \"x.dts\"\n"));
        assert!(text.contains("#size-cells = <0>;"));
    }

    #[test]
    fn duplicate_labels_fail() {
        let error = annotate("/ {\n\tfoo: a { };\n\tfoo: b { };\n};\n", &Config::default()).unwrap_err();
        assert!(
            matches!(error, Error::DuplicateLabel { ref label, ref first, ref second }
                if label == "foo" && first == "/a" && second == "/b"),
            "{error}"
        );
    }

    #[test]
    fn survives_a_round_trip() {
        let text = run("/dts-v1/;\n/ {\n\t// the clock\n\tclk: clock { #clock-cells = <0>; };\n};\n");
        let tree = Tree::new(Box::new(SourceBackend::parse(&text).unwrap())).unwrap();
        let clock = tree.node_by_path("/clock").unwrap();
        let node = tree.node(clock).unwrap();
        assert_eq!(node.label(), Some("clk"));
        assert!(node.properties().any(|p| p.class() == PropertyClass::Label));

        let printed = Printer::new().print(&tree).unwrap();
        assert!(printed.contains("        // the clock\n"), "{printed}");
        assert!(printed.contains("clk: clock {"), "{printed}");
    }
}
