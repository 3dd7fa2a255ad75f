// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

use std::cell::OnceCell;

use super::NodeKey;
use crate::codec::{self, PropertyType, Value};

/// Prefix of the synthetic properties that carry source comments.
pub const COMMENT_PREFIX: &str = "sdt-comment-";
/// Prefix of the synthetic properties that carry node labels.
pub const LABEL_PREFIX: &str = "sdt-label-";
/// Name of the synthetic property holding text printed before `/dts-v1/`.
pub const PREAMBLE: &str = "sdt-preamble";

/// What a property stands for when the tree is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyClass {
    /// An ordinary property.
    Value,
    /// A source comment, printed as a comment.
    Comment,
    /// A node label, consumed by the printer.
    Label,
    /// Text printed before the version tag.
    Preamble,
}

impl PropertyClass {
    /// Classifies a property by its name.
    #[must_use]
    pub fn of(name: &str) -> Self {
        let numbered = |prefix: &str| {
            name.strip_prefix(prefix)
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        };
        if numbered(COMMENT_PREFIX) {
            PropertyClass::Comment
        } else if numbered(LABEL_PREFIX) {
            PropertyClass::Label
        } else if name == PREAMBLE {
            PropertyClass::Preamble
        } else {
            PropertyClass::Value
        }
    }
}

/// Where a property is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyState {
    /// Created locally and never written to the backend.
    Init,
    /// Decoded from the backend.
    Resolved,
    /// Written to the backend by the last sync.
    Synced,
    /// Deleted locally; removed from the backend on the next sync.
    Deleted,
}

/// A typed property of a [`Node`](super::Node).
#[derive(Debug, Clone)]
pub struct Property {
    pub(super) name: String,
    pub(super) values: Vec<Value>,
    pub(super) owner: NodeKey,
    pub(super) class: PropertyClass,
    pub(super) state: PropertyState,
    pub(super) ptype: PropertyType,
    /// Bytes last read from or written to the backend.
    pub(super) raw: Option<Vec<u8>>,
    pub(super) dirty: bool,
    rendered: OnceCell<String>,
}

impl Property {
    pub(super) fn local(owner: NodeKey, name: &str, values: Vec<Value>, ptype: PropertyType) -> Self {
        Self {
            name: name.to_owned(),
            values,
            owner,
            class: PropertyClass::of(name),
            state: PropertyState::Init,
            ptype,
            raw: None,
            dirty: true,
            rendered: OnceCell::new(),
        }
    }

    pub(super) fn decoded(owner: NodeKey, name: &str, bytes: Vec<u8>, hint: PropertyType) -> Self {
        let (ptype, values) = codec::decode_typed(&bytes, hint);
        Self {
            name: name.to_owned(),
            values,
            owner,
            class: PropertyClass::of(name),
            state: PropertyState::Resolved,
            ptype,
            raw: Some(bytes),
            dirty: false,
            rendered: OnceCell::new(),
        }
    }

    pub(super) fn assign(&mut self, values: Vec<Value>, ptype: PropertyType) {
        self.values = values;
        self.ptype = ptype;
        self.dirty = true;
        if self.state == PropertyState::Deleted {
            self.state = if self.raw.is_some() {
                PropertyState::Resolved
            } else {
                PropertyState::Init
            };
        }
        self.rendered = OnceCell::new();
    }

    pub(super) fn mark_synced(&mut self, bytes: Vec<u8>) {
        self.raw = Some(bytes);
        self.state = PropertyState::Synced;
        self.dirty = false;
    }

    /// The property name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The decoded value. A scalar is a one-element list.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The node holding this property.
    #[must_use]
    pub fn owner(&self) -> NodeKey {
        self.owner
    }

    /// How the printer treats this property.
    #[must_use]
    pub fn class(&self) -> PropertyClass {
        self.class
    }

    /// The lifecycle state.
    #[must_use]
    pub fn state(&self) -> PropertyState {
        self.state
    }

    /// The type the value was decoded as, or will be encoded as.
    #[must_use]
    pub fn ptype(&self) -> PropertyType {
        self.ptype
    }

    /// Returns `true` if the value has changed since the last sync.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The backend bytes as of the last resolve or sync.
    #[must_use]
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    /// The bytes that would be written to the backend.
    #[must_use]
    pub fn encoded(&self) -> Vec<u8> {
        codec::encode_property(&self.values, self.ptype)
    }

    /// Returns the first value as an integer.
    #[must_use]
    pub fn u64(&self) -> Option<u64> {
        self.values.first().and_then(Value::as_u64)
    }

    /// Renders the property as a source statement, without resolving
    /// references. The text is cached until the value changes.
    ///
    /// ```
    /// use sdt::backend::SourceBackend;
    /// use sdt::Tree;
    ///
    /// let backend = SourceBackend::parse("/ { reg = <0x1000 0x100>; };").unwrap();
    /// let tree = Tree::new(Box::new(backend)).unwrap();
    /// let root = tree.node(tree.root()).unwrap();
    /// assert_eq!(root.property("reg").unwrap().to_dts(), "reg = <0x1000 0x100>;");
    /// ```
    #[must_use]
    pub fn to_dts(&self) -> &str {
        self.rendered
            .get_or_init(|| crate::printer::format_property(&self.name, &self.values, self.ptype))
    }
}
