// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! An in-memory engine for system device trees.
//!
//! A [`Tree`] is loaded from a [`Backend`](backend::Backend), either a binary
//! flattened device tree ([`FdtBackend`](backend::FdtBackend)) or device tree
//! source text ([`SourceBackend`](backend::SourceBackend)). Resolving the tree
//! decodes every property into typed [`Value`](codec::Value)s, using the
//! [`SchemaResolver`](schema::SchemaResolver) rules and the byte-shape
//! heuristics in [`codec`]. Edits are made on the tree and written back with
//! [`Tree::sync`]. The [`Printer`](printer::Printer) re-emits source text with
//! labels, comments and symbolic `&label` references restored.
//!
//! # Examples
//!
//! ```
//! use sdt::backend::SourceBackend;
//! use sdt::printer::Printer;
//! use sdt::Tree;
//!
//! let source = r#"
//! /dts-v1/;
//! / {
//!     clk: clock {
//!         #clock-cells = <0>;
//!     };
//!     serial@1000 {
//!         clocks = <&clk>;
//!         status = "disabled";
//!     };
//! };
//! "#;
//! let backend = SourceBackend::parse(source).unwrap();
//! let mut tree = Tree::new(Box::new(backend)).unwrap();
//!
//! let serial = tree.node_by_path("/serial@1000").unwrap();
//! tree.set_property(serial, "status", vec!["okay".into()]).unwrap();
//! tree.sync().unwrap();
//!
//! let text = Printer::new().print(&tree).unwrap();
//! assert!(text.contains("clocks = <&clk>;"));
//! assert!(text.contains("status = \"okay\";"));
//! ```

pub mod annotate;
pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod phandle;
pub mod printer;
pub mod schema;
pub mod transcode;
pub mod tree;

use indexmap::IndexMap;
use twox_hash::xxhash64;

pub use config::Config;
pub use error::{Error, Result};
pub use tree::{Node, NodeKey, Property, Registries, Tree};

const HASH_SEED: u64 = 0xdead_cafe;

/// Insertion-ordered map with a fixed-seed hasher, so iteration order and
/// hashing are reproducible run to run.
pub(crate) type OrderedMap<V, K = String> = IndexMap<K, V, xxhash64::State>;

pub(crate) fn ordered_map<K, V>(capacity: usize) -> OrderedMap<V, K> {
    IndexMap::with_capacity_and_hasher(capacity, xxhash64::State::with_seed(HASH_SEED))
}
