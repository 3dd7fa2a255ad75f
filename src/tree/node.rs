// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

use std::fmt;

use super::property::{Property, PropertyState};
use crate::OrderedMap;
use crate::backend::NodeId;
use crate::codec::Value;

/// Index of a node in its [`Tree`](super::Tree)'s arena.
///
/// Keys stay valid for the lifetime of the tree. A node that has vanished
/// from the backend keeps its key but is marked [`NodeState::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub(crate) usize);

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a node is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Created, not yet read from the backend.
    Uninitialized,
    /// Matches a backend node as of the last resolve.
    Resolved,
    /// No longer present in the backend.
    Invalid,
}

/// A node of a [`Tree`](super::Tree).
#[derive(Debug, Clone)]
pub struct Node {
    pub(super) key: NodeKey,
    pub(super) id: Option<NodeId>,
    pub(super) name: String,
    /// Name in the backend; differs from `name` while a rename is pending.
    pub(super) synced_name: String,
    pub(super) path: String,
    /// Path in the backend as of the last resolve or sync.
    pub(super) synced_path: String,
    pub(super) label: Option<String>,
    pub(super) phandle: u32,
    pub(super) types: Vec<String>,
    pub(super) parent: Option<NodeKey>,
    pub(super) children: Vec<NodeKey>,
    pub(super) properties: OrderedMap<Property>,
    pub(super) ref_count: usize,
    pub(super) state: NodeState,
    pub(super) dirty: bool,
    pub(super) depth: usize,
}

impl Node {
    pub(super) fn new(key: NodeKey, name: &str, path: &str) -> Self {
        Self {
            key,
            id: None,
            name: name.to_owned(),
            synced_name: name.to_owned(),
            path: path.to_owned(),
            synced_path: path.to_owned(),
            label: None,
            phandle: 0,
            types: Vec::new(),
            parent: None,
            children: Vec::new(),
            properties: crate::ordered_map(0),
            ref_count: 0,
            state: NodeState::Uninitialized,
            dirty: false,
            depth: 0,
        }
    }

    /// This node's key.
    #[must_use]
    pub fn key(&self) -> NodeKey {
        self.key
    }

    /// The backend id as of the last resolve, or `None` if the node is not
    /// materialized.
    #[must_use]
    pub fn id(&self) -> Option<NodeId> {
        self.id
    }

    /// The node name, including any unit address. The root is `""`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The absolute path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// The phandle, or 0 if the node has none.
    #[must_use]
    pub fn phandle(&self) -> u32 {
        self.phandle
    }

    /// The `compatible` strings, in order.
    #[must_use]
    pub fn types(&self) -> &[String] {
        &self.types
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[NodeKey] {
        &self.children
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Returns `true` if the node has edits that are not synced yet.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Depth below the root, which is at depth 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Iterates over the live properties, in order.
    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties
            .values()
            .filter(|property| property.state != PropertyState::Deleted)
    }

    /// Returns a property, unless it is absent or deleted.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties
            .get(name)
            .filter(|property| property.state != PropertyState::Deleted)
    }

    /// Returns a property value.
    #[must_use]
    pub fn get_property(&self, name: &str) -> Option<&[Value]> {
        self.property(name).map(Property::values)
    }

    /// Returns the first value of a property as a cell.
    #[must_use]
    pub fn u32(&self, name: &str) -> Option<u32> {
        self.property(name)?
            .u64()
            .and_then(|value| u32::try_from(value).ok())
    }

    /// Returns the first value of a property as a string.
    #[must_use]
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get_property(name)?.first()?.as_str()
    }

    /// Returns the string values of a property.
    #[must_use]
    pub fn strings(&self, name: &str) -> Vec<&str> {
        self.get_property(name)
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_str)
            .collect()
    }

    pub(super) fn refresh_dirty(&mut self) {
        self.dirty = self.name != self.synced_name
            || self
                .properties
                .values()
                .any(|property| property.dirty || property.state == PropertyState::Deleted);
    }
}
