// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! The in-memory tree.
//!
//! A [`Tree`] mirrors a [`Backend`] as an arena of [`Node`]s addressed by
//! [`NodeKey`]. [`Tree::resolve`] reads the backend into the arena and
//! rebuilds the path, id, phandle and label indices; [`Tree::sync`] writes
//! local edits back and resolves again. Property edits are local until the
//! next sync. Structural edits ([`Tree::add_node`], [`Tree::delete_node`],
//! [`Tree::copy_node`]) go to the backend at once.

mod node;
mod property;
mod refs;
mod resolve;

use log::{debug, warn};
use regex::Regex;

pub use self::node::{Node, NodeKey, NodeState};
pub use self::property::{
    COMMENT_PREFIX, LABEL_PREFIX, PREAMBLE, Property, PropertyClass, PropertyState,
};
pub use self::refs::{NodeCells, ResolvedRecord};
use crate::backend::{
    Backend, BackendRegistry, NodeId, join_path, retry_on_capacity, split_path,
};
use crate::codec::{PropertyType, Value};
use crate::config::Config;
use crate::error::{BackendError, Error, Result};
use crate::phandle::{FieldSpec, PhandleRegistry};
use crate::schema::{SchemaResolver, SchemaScanner};
use crate::{OrderedMap, ordered_map};

/// The typing and cross-reference rules a [`Tree`] decodes with.
#[derive(Debug, Clone)]
pub struct Registries {
    /// Property typing rules.
    pub schema: SchemaResolver,
    /// Reference-bearing property layouts.
    pub phandles: PhandleRegistry,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            schema: SchemaResolver::builtin(),
            phandles: PhandleRegistry::with_defaults(),
        }
    }
}

impl Registries {
    /// Adds what `scanner` learned, without replacing existing rules.
    pub fn learn(&mut self, scanner: &SchemaScanner) {
        self.schema.merge(&scanner.schema());
        let mut added = 0;
        for (name, spec) in scanner.phandle_specs() {
            if self.phandles.merge(name, FieldSpec::parse(&spec)) {
                added += 1;
            }
        }
        debug!("learned {added} reference layouts");
    }
}

#[derive(Debug)]
enum BackendHandle<'b> {
    Owned(Box<dyn Backend>),
    Borrowed(&'b mut dyn Backend),
}

impl BackendHandle<'_> {
    fn get(&self) -> &dyn Backend {
        match self {
            BackendHandle::Owned(backend) => &**backend,
            BackendHandle::Borrowed(backend) => &**backend,
        }
    }

    fn get_mut(&mut self) -> &mut dyn Backend {
        match self {
            BackendHandle::Owned(backend) => &mut **backend,
            BackendHandle::Borrowed(backend) => &mut **backend,
        }
    }
}

/// An indexed, editable device tree over a [`Backend`].
#[derive(Debug)]
pub struct Tree<'b> {
    backend: BackendHandle<'b>,
    config: Config,
    registries: Registries,
    nodes: Vec<Node>,
    root: NodeKey,
    by_path: OrderedMap<NodeKey>,
    by_id: OrderedMap<NodeKey, NodeId>,
    by_phandle: OrderedMap<NodeKey, u32>,
    by_label: OrderedMap<NodeKey>,
    by_synced_path: OrderedMap<NodeKey>,
    dirty: bool,
}

impl Tree<'static> {
    /// Creates a tree that owns `backend`, and resolves it.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be resolved.
    pub fn new(backend: Box<dyn Backend>) -> Result<Self> {
        Self::with_config(backend, Config::default(), Registries::default())
    }

    /// Like [`Tree::new`], with explicit options and rules.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be resolved.
    pub fn with_config(
        backend: Box<dyn Backend>,
        config: Config,
        registries: Registries,
    ) -> Result<Self> {
        Tree::build(BackendHandle::Owned(backend), config, registries)
    }

    /// Creates a tree over a private copy of `backend`. Edits never reach the
    /// original.
    ///
    /// # Errors
    ///
    /// Fails if the copy cannot be resolved.
    pub fn snapshot(backend: &dyn Backend) -> Result<Self> {
        Self::new(backend.duplicate())
    }

    /// Opens binary or source input with the default backends, choosing the
    /// format from the content.
    ///
    /// # Errors
    ///
    /// Fails if the input is not a valid blob or source text.
    pub fn from_bytes(bytes: &[u8], config: Config, registries: Registries) -> Result<Self> {
        let backend = BackendRegistry::with_defaults().open_detected(bytes, &config)?;
        Self::with_config(backend, config, registries)
    }
}

impl<'b> Tree<'b> {
    /// Creates a tree that edits `backend` in place.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be resolved.
    pub fn attach(backend: &'b mut dyn Backend) -> Result<Self> {
        Self::attach_with_config(backend, Config::default(), Registries::default())
    }

    /// Like [`Tree::attach`], with explicit options and rules.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be resolved.
    pub fn attach_with_config(
        backend: &'b mut dyn Backend,
        config: Config,
        registries: Registries,
    ) -> Result<Self> {
        Self::build(BackendHandle::Borrowed(backend), config, registries)
    }

    fn build(backend: BackendHandle<'b>, config: Config, registries: Registries) -> Result<Self> {
        let root = NodeKey(0);
        let mut synced = ordered_map(1);
        synced.insert("/".to_owned(), root);
        let mut tree = Self {
            backend,
            config,
            registries,
            nodes: vec![Node::new(root, "", "/")],
            root,
            by_path: ordered_map(0),
            by_id: ordered_map(0),
            by_phandle: ordered_map(0),
            by_label: ordered_map(0),
            by_synced_path: synced,
            dirty: false,
        };
        tree.resolve()?;
        Ok(tree)
    }

    /// The backing store.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.get()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Mutable access to the rules. Changes apply from the next resolve.
    pub fn registries_mut(&mut self) -> &mut Registries {
        &mut self.registries
    }

    /// Returns `true` if there are local edits not yet synced.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn root(&self) -> NodeKey {
        self.root
    }

    /// Returns a node by key, including nodes that have become
    /// [`NodeState::Invalid`].
    #[must_use]
    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(key.0)
    }

    /// Iterates over the live nodes in depth-first order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.by_path.values().map(|key| &self.nodes[key.0])
    }

    /// Returns the number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    /// Returns `true` if the tree holds only an empty root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1 && self.node(self.root).is_none_or(|root| root.properties.is_empty())
    }

    #[must_use]
    pub fn node_by_path(&self, path: &str) -> Option<NodeKey> {
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        self.by_path.get(path).copied()
    }

    /// Returns the live nodes whose path matches `pattern`, in depth-first
    /// order.
    #[must_use]
    pub fn nodes_matching(&self, pattern: &Regex) -> Vec<NodeKey> {
        self.by_path
            .iter()
            .filter(|(path, _)| pattern.is_match(path))
            .map(|(_, key)| *key)
            .collect()
    }

    /// Returns the live nodes with a `compatible` string matching `pattern`.
    #[must_use]
    pub fn nodes_compatible(&self, pattern: &Regex) -> Vec<NodeKey> {
        self.nodes()
            .filter(|node| node.types.iter().any(|compatible| pattern.is_match(compatible)))
            .map(Node::key)
            .collect()
    }

    #[must_use]
    pub fn node_by_phandle(&self, phandle: u32) -> Option<NodeKey> {
        self.by_phandle.get(&phandle).copied()
    }

    #[must_use]
    pub fn node_by_label(&self, label: &str) -> Option<NodeKey> {
        self.by_label.get(label).copied()
    }

    /// Returns the node a backend id pointed at during the last resolve.
    #[must_use]
    pub fn node_by_id(&self, id: NodeId) -> Option<NodeKey> {
        self.by_id.get(&id).copied()
    }

    /// Finds a node by absolute path, by label, or by `&label`.
    #[must_use]
    pub fn lookup(&self, target: &str) -> Option<NodeKey> {
        if target.starts_with('/') {
            self.node_by_path(target)
        } else {
            self.node_by_label(target.strip_prefix('&').unwrap_or(target))
        }
    }

    /// Resolves a value to the node it names: an integer is a phandle and a
    /// string is a path or label.
    #[must_use]
    pub fn deref(&self, value: &Value) -> Option<NodeKey> {
        match value {
            Value::Int(phandle) => u32::try_from(*phandle)
                .ok()
                .and_then(|phandle| self.node_by_phandle(phandle)),
            Value::Str(target) => self.lookup(target),
        }
    }

    /// Returns the direct children of a node.
    #[must_use]
    pub fn children(&self, key: NodeKey) -> &[NodeKey] {
        self.node(key).map(Node::children).unwrap_or_default()
    }

    /// Returns the paths of the direct children of a node.
    #[must_use]
    pub fn child_paths(&self, key: NodeKey) -> Vec<String> {
        self.children(key)
            .iter()
            .filter_map(|&child| self.node(child))
            .map(|child| child.path.clone())
            .collect()
    }

    /// Returns `key` and all of its descendants, depth first.
    #[must_use]
    pub fn subnodes(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut keys = Vec::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            let Some(node) = self.node(current) else {
                continue;
            };
            keys.push(current);
            stack.extend(node.children.iter().rev().copied());
        }
        keys
    }

    /// Returns a node's property value.
    #[must_use]
    pub fn get_property(&self, key: NodeKey, name: &str) -> Option<&[Value]> {
        self.node(key)?.get_property(name)
    }

    /// Sets a property locally. The type is kept from the existing property
    /// when it still fits, or else taken from the schema or the values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotFound`] if the node is not live.
    pub fn set_property(&mut self, key: NodeKey, name: &str, values: Vec<Value>) -> Result<()> {
        let node = self.live_node(key)?;
        let existing = node.properties.get(name).map(Property::ptype);
        let ptype = match existing {
            Some(ptype) if kind_fits(ptype, &values) => ptype,
            _ => {
                let hint =
                    self.registries
                        .schema
                        .resolve(name, Some(&node.path), &node.types);
                if kind_fits(hint, &values) {
                    hint
                } else {
                    infer_type(&values)
                }
            }
        };
        self.set_property_typed(key, name, values, ptype)
    }

    /// Sets a property locally with an explicit type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotFound`] if the node is not live.
    pub fn set_property_typed(
        &mut self,
        key: NodeKey,
        name: &str,
        values: Vec<Value>,
        ptype: PropertyType,
    ) -> Result<()> {
        self.live_node(key)?;
        let node = &mut self.nodes[key.0];
        match node.properties.get_mut(name) {
            Some(property) => property.assign(values, ptype),
            None => {
                node.properties
                    .insert(name.to_owned(), Property::local(key, name, values, ptype));
            }
        }
        let property = &node.properties[name];
        match (name, property.class()) {
            ("compatible", _) => {
                node.types = property.values().iter().map(ToString::to_string).collect();
            }
            ("phandle" | "linux,phandle", _) => {
                if let Some(phandle) = property.u64().and_then(|p| u32::try_from(p).ok()) {
                    node.phandle = phandle;
                    self.by_phandle.insert(phandle, key);
                }
            }
            (_, PropertyClass::Label) => {
                node.label = property.values().first().map(ToString::to_string);
            }
            _ => {}
        }
        node.dirty = true;
        self.dirty = true;
        Ok(())
    }

    /// Deletes a property locally. Returns `false` if there was no such
    /// property.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotFound`] if the node is not live.
    pub fn delete_property(&mut self, key: NodeKey, name: &str) -> Result<bool> {
        self.live_node(key)?;
        let node = &mut self.nodes[key.0];
        let deleted = match node.properties.get(name).map(Property::state) {
            None | Some(PropertyState::Deleted) => false,
            Some(PropertyState::Init) => {
                node.properties.shift_remove(name);
                true
            }
            Some(_) => {
                if let Some(property) = node.properties.get_mut(name) {
                    property.state = PropertyState::Deleted;
                    property.dirty = false;
                }
                true
            }
        };
        if deleted {
            node.dirty = true;
            self.dirty = true;
        }
        Ok(deleted)
    }

    /// Sets or clears the label of a node. The label applies to the printed
    /// source; backends do not store it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotFound`] if the node is not live.
    pub fn set_label(&mut self, key: NodeKey, label: Option<&str>) -> Result<()> {
        self.live_node(key)?;
        let node = &mut self.nodes[key.0];
        if let Some(old) = node.label.take() {
            if self.by_label.get(&old) == Some(&key) {
                self.by_label.shift_remove(&old);
            }
        }
        if let Some(label) = label {
            node.label = Some(label.to_owned());
            self.by_label.entry(label.to_owned()).or_insert(key);
        }
        Ok(())
    }

    /// Renames a node locally. The new paths apply at once; the backend is
    /// renamed on the next sync.
    ///
    /// # Errors
    ///
    /// Fails if the node is the root or not live, the name is not valid, or a
    /// sibling already has the name.
    pub fn rename_node(&mut self, key: NodeKey, new_name: &str) -> Result<()> {
        let node = self.live_node(key)?;
        let Some(parent) = node.parent else {
            return Err(Error::backend("rename", "/", BackendError::InvalidName(new_name.to_owned())));
        };
        if new_name.is_empty() || new_name.contains('/') {
            return Err(Error::backend(
                "rename",
                &node.path,
                BackendError::InvalidName(new_name.to_owned()),
            ));
        }
        let collides = self.nodes[parent.0]
            .children
            .iter()
            .any(|&sibling| sibling != key && self.nodes[sibling.0].name == new_name);
        if collides {
            let target = join_path(&self.nodes[parent.0].path, new_name);
            return Err(Error::backend("rename", &node.path, BackendError::Exists(target)));
        }

        self.nodes[key.0].name = new_name.to_owned();
        self.nodes[key.0].refresh_dirty();
        self.dirty = true;
        self.reindex_paths();
        Ok(())
    }

    /// Adds a node, creating missing parents, and returns its key.
    ///
    /// # Errors
    ///
    /// Fails if a node exists at `path`, the path is not valid, or the
    /// backend stays out of space after the retry bound.
    pub fn add_node(&mut self, path: &str) -> Result<NodeKey> {
        if self.node_by_path(path).is_some() {
            return Err(Error::backend("add", path, BackendError::Exists(path.to_owned())));
        }
        let backend_path = self.backend_path_for(path)?;
        retry_on_capacity(
            self.backend.get_mut(),
            self.config.max_capacity_retries,
            "add",
            path,
            |backend| backend.add(&backend_path, true),
        )?;
        self.resolve()?;
        self.node_by_path(path)
            .ok_or_else(|| Error::NodeNotFound(path.to_owned()))
    }

    /// Removes a node and its subtree from the backend, then resolves. The
    /// removed nodes become [`NodeState::Invalid`].
    ///
    /// # Errors
    ///
    /// Fails if the node is the root or not live.
    pub fn delete_node(&mut self, key: NodeKey) -> Result<()> {
        let node = self.live_node(key)?;
        let path = node.path.clone();
        let synced_path = node.synced_path.clone();
        let backend = self.backend.get_mut();
        let id = backend
            .find(&synced_path)
            .ok_or_else(|| Error::NodeNotFound(path.clone()))?;
        backend
            .remove(id)
            .map_err(|e| Error::backend("remove", &path, e))?;
        debug!("removed {path}");
        self.resolve()
    }

    /// Copies the subtree at `source` under `parent`, with its current local
    /// values, and returns the key of the copy. The copy is named `name`, or
    /// keeps the source name.
    ///
    /// Copied nodes that had a phandle get the next free one, so phandles
    /// stay unique, and labels are not copied. References inside the copy
    /// still name the original nodes.
    ///
    /// Each node and property is written with its own capacity retry, so a
    /// copy that runs out of space resumes where it stopped.
    ///
    /// # Errors
    ///
    /// Fails if either node is not live, the destination exists, or the
    /// backend stays out of space.
    pub fn copy_node(
        &mut self,
        source: NodeKey,
        parent: NodeKey,
        name: Option<&str>,
    ) -> Result<NodeKey> {
        let source_node = self.live_node(source)?;
        let name = name.unwrap_or(&source_node.name).to_owned();
        let source_path = source_node.path.clone();
        let parent_node = self.live_node(parent)?;
        let destination = join_path(&parent_node.path, &name);
        let backend_destination = join_path(&parent_node.synced_path, &name);
        if self.node_by_path(&destination).is_some() {
            return Err(Error::backend(
                "copy",
                &destination,
                BackendError::Exists(destination.clone()),
            ));
        }

        let mut next_phandle = self.next_phandle();
        let mut plan = Vec::new();
        for key in self.subnodes(source) {
            let node = &self.nodes[key.0];
            let relative = &node.path[source_path.len()..];
            let relative = if source_path == "/" && !relative.is_empty() {
                format!("/{relative}")
            } else {
                relative.to_owned()
            };
            let phandle = (node.phandle != 0).then(|| {
                next_phandle += 1;
                next_phandle - 1
            });
            let properties: Vec<(String, Vec<u8>)> = node
                .properties()
                .filter(|property| property.class() != PropertyClass::Label)
                .map(|property| match (property.name.as_str(), phandle) {
                    ("phandle" | "linux,phandle", Some(phandle)) => {
                        (property.name.clone(), phandle.to_be_bytes().to_vec())
                    }
                    _ => (property.name.clone(), property.encoded()),
                })
                .collect();
            plan.push((format!("{backend_destination}{relative}"), properties));
        }

        let attempts = self.config.max_capacity_retries;
        let backend = self.backend.get_mut();
        for (path, properties) in &plan {
            retry_on_capacity(&mut *backend, attempts, "add", path, |backend| {
                backend.add(path, true)
            })?;
            for (property, bytes) in properties {
                retry_on_capacity(&mut *backend, attempts, "set_property", path, |backend| {
                    let id = backend
                        .find(path)
                        .ok_or_else(|| BackendError::NotFound(path.clone()))?;
                    backend.set_property(id, property, bytes)
                })?;
            }
        }
        debug!("copied {source_path} to {destination} ({} nodes)", plan.len());
        self.resolve()?;
        self.node_by_path(&destination)
            .ok_or(Error::NodeNotFound(destination))
    }

    /// Returns one more than the largest phandle in use.
    #[must_use]
    pub fn next_phandle(&self) -> u32 {
        self.nodes()
            .map(Node::phandle)
            .chain(self.by_phandle.keys().copied())
            .max()
            .unwrap_or(0)
            .saturating_add(1)
    }

    /// Returns the phandle of a node, assigning the next free one first if
    /// the node has none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotFound`] if the node is not live.
    pub fn ensure_phandle(&mut self, key: NodeKey) -> Result<u32> {
        let phandle = self.live_node(key)?.phandle;
        if phandle != 0 {
            return Ok(phandle);
        }
        let phandle = self.next_phandle();
        self.set_property_typed(key, "phandle", vec![phandle.into()], PropertyType::UInt32)?;
        Ok(phandle)
    }

    /// Serializes the backend as a blob. Local edits are included only after
    /// [`Tree::sync`].
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot produce a blob.
    pub fn to_dtb(&self) -> Result<Vec<u8>> {
        if self.dirty {
            warn!("serializing a tree with unsynced edits");
        }
        self.backend
            .get()
            .to_dtb()
            .map_err(|e| Error::backend("to_dtb", "/", e))
    }

    /// The memory reservation block of the backend.
    #[must_use]
    pub fn memory_reservations(&self) -> Vec<sdt_device_tree::MemoryReservation> {
        self.backend.get().memory_reservations()
    }

    fn live_node(&self, key: NodeKey) -> Result<&Node> {
        self.nodes
            .get(key.0)
            .filter(|node| node.state == NodeState::Resolved)
            .ok_or_else(|| Error::NodeNotFound(key.to_string()))
    }

    /// Maps a local path to the backend path it will have, following the
    /// deepest existing ancestor, which may have a pending rename.
    fn backend_path_for(&self, path: &str) -> Result<String> {
        if !path.starts_with('/') {
            return Err(Error::NodeNotFound(path.to_owned()));
        }
        let mut ancestor = path;
        let mut missing = Vec::new();
        let base = loop {
            if let Some(key) = self.node_by_path(ancestor) {
                break self.nodes[key.0].synced_path.clone();
            }
            let (parent, name) = split_path(ancestor).ok_or_else(|| {
                Error::backend("add", path, BackendError::InvalidName(path.to_owned()))
            })?;
            missing.push(name);
            ancestor = parent;
        };
        Ok(missing
            .iter()
            .rev()
            .fold(base, |backend_path, name| join_path(&backend_path, name)))
    }

    /// Recomputes local paths below the root and rebuilds the path index.
    fn reindex_paths(&mut self) {
        let mut by_path = ordered_map(self.by_path.len());
        let mut stack = vec![self.root];
        while let Some(key) = stack.pop() {
            let path = match self.nodes[key.0].parent {
                Some(parent) => join_path(&self.nodes[parent.0].path, &self.nodes[key.0].name),
                None => "/".to_owned(),
            };
            by_path.insert(path.clone(), key);
            self.nodes[key.0].path = path;
            stack.extend(self.nodes[key.0].children.iter().rev().copied());
        }
        self.by_path = by_path;
    }
}

/// Returns `true` if `values` can be encoded as `ptype` without changing
/// their kind.
fn kind_fits(ptype: PropertyType, values: &[Value]) -> bool {
    let strings = values.iter().all(|value| matches!(value, Value::Str(_)));
    let ints = values.iter().all(|value| matches!(value, Value::Int(_)));
    match ptype {
        PropertyType::Unknown => false,
        PropertyType::Empty => values.is_empty(),
        ptype if ptype.is_string() => !values.is_empty() && strings,
        _ => !values.is_empty() && ints,
    }
}

fn infer_type(values: &[Value]) -> PropertyType {
    match values {
        [] => PropertyType::Empty,
        [Value::Str(_)] => PropertyType::String,
        values if values.iter().any(|value| matches!(value, Value::Str(_))) => {
            PropertyType::MultiString
        }
        _ => PropertyType::UInt32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_inference() {
        assert_eq!(infer_type(&[]), PropertyType::Empty);
        assert_eq!(infer_type(&["a".into()]), PropertyType::String);
        assert_eq!(infer_type(&["a".into(), "b".into()]), PropertyType::MultiString);
        assert_eq!(infer_type(&[1u32.into(), 2u32.into()]), PropertyType::UInt32);
        assert!(kind_fits(PropertyType::MultiString, &["a".into()]));
        assert!(!kind_fits(PropertyType::UInt32, &["a".into()]));
        assert!(!kind_fits(PropertyType::Unknown, &[1u32.into()]));
    }
}
