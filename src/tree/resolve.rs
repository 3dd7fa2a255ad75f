// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Reading the backend into the arena, and writing local edits back.

use std::mem;

use log::{debug, trace, warn};

use super::node::{Node, NodeKey, NodeState};
use super::property::{Property, PropertyClass, PropertyState};
use super::{Registries, Tree};
use crate::backend::{NodeId, join_path, retry_on_capacity};
use crate::codec::{self, PropertyType};
use crate::error::{BackendError, Error, Result};
use crate::ordered_map;

impl Tree<'_> {
    /// Reads the backend into the tree.
    ///
    /// Nodes are matched to arena nodes by backend path, so keys held by the
    /// caller stay valid. Local edits that are not synced yet (dirty or new
    /// properties, pending deletions and renames) are kept. Properties whose
    /// backend bytes did not change are not decoded again. Nodes that are no
    /// longer in the backend become [`NodeState::Invalid`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Structural`] if two backend nodes produce the same
    /// path. The tree must then be discarded.
    pub fn resolve(&mut self) -> Result<()> {
        let root_id = self
            .backend
            .get()
            .find("/")
            .ok_or_else(|| Error::NodeNotFound("/".to_owned()))?;

        let capacity = self.nodes.len();
        let mut seen = vec![false; capacity];
        let mut by_path = ordered_map(capacity);
        let mut by_id = ordered_map(capacity);
        let mut by_phandle = ordered_map(capacity);
        let mut by_label = ordered_map(capacity);
        let mut by_synced_path = ordered_map(capacity);

        let mut stack: Vec<(NodeId, String, Option<NodeKey>, usize)> =
            vec![(root_id, "/".to_owned(), None, 0)];
        while let Some((id, backend_path, parent, depth)) = stack.pop() {
            let backend_name = match parent {
                None => String::new(),
                Some(_) => self
                    .backend
                    .get()
                    .name_of(id)
                    .ok_or_else(|| Error::NodeNotFound(backend_path.clone()))?,
            };

            let reused = self
                .by_synced_path
                .get(&backend_path)
                .copied()
                .filter(|key| {
                    self.nodes[key.0].state != NodeState::Invalid
                        && !seen.get(key.0).copied().unwrap_or(true)
                });
            let key = match reused {
                Some(key) => key,
                None => {
                    let key = NodeKey(self.nodes.len());
                    self.nodes.push(Node::new(key, &backend_name, &backend_path));
                    seen.push(false);
                    key
                }
            };
            seen[key.0] = true;

            let node = &mut self.nodes[key.0];
            if node.name == node.synced_name {
                node.name.clone_from(&backend_name);
            }
            node.synced_name = backend_name;
            node.synced_path.clone_from(&backend_path);
            node.id = Some(id);
            node.parent = parent;
            node.depth = depth;
            node.children.clear();
            node.state = NodeState::Resolved;
            let path = match parent {
                Some(parent) => join_path(&self.nodes[parent.0].path, &self.nodes[key.0].name),
                None => "/".to_owned(),
            };
            if by_path.insert(path.clone(), key).is_some() {
                return Err(Error::Structural { path });
            }
            self.nodes[key.0].path = path;
            if let Some(parent) = parent {
                self.nodes[parent.0].children.push(key);
            }

            self.resolve_properties(key, id);

            let node = &self.nodes[key.0];
            by_id.insert(id, key);
            by_synced_path.insert(backend_path.clone(), key);
            if node.phandle != 0 {
                if let Some(other) = by_phandle.insert(node.phandle, key) {
                    warn!(
                        "phandle {:#x} is used by {} and {}",
                        node.phandle, self.nodes[other.0].path, node.path
                    );
                    by_phandle.insert(node.phandle, other);
                }
            }
            if let Some(label) = &node.label {
                by_label.entry(label.clone()).or_insert(key);
            }

            let backend = self.backend.get();
            for child in backend.children_of(id).into_iter().rev() {
                let name = backend.name_of(child).unwrap_or_default();
                stack.push((child, join_path(&backend_path, &name), Some(key), depth + 1));
            }
        }

        let mut vanished = 0;
        for (node, seen) in self.nodes.iter_mut().zip(&seen) {
            if !seen && node.state != NodeState::Invalid {
                node.state = NodeState::Invalid;
                node.id = None;
                node.children.clear();
                vanished += 1;
            }
        }
        if vanished > 0 {
            debug!("{vanished} nodes are no longer in the backend");
        }

        self.by_path = by_path;
        self.by_id = by_id;
        self.by_phandle = by_phandle;
        self.by_label = by_label;
        self.by_synced_path = by_synced_path;
        let dirty = self.nodes().any(Node::is_dirty);
        self.dirty = dirty;
        debug!("resolved {} nodes", self.by_path.len());
        Ok(())
    }

    /// Merges the backend properties of node `key` with its local ones.
    fn resolve_properties(&mut self, key: NodeKey, id: NodeId) {
        let backend = self.backend.get();
        let registries = &self.registries;
        let incoming = backend.properties_of(id);
        let node = &mut self.nodes[key.0];
        let mut local = mem::replace(&mut node.properties, ordered_map(incoming.len()));

        let compatible = incoming
            .iter()
            .find(|(name, _)| name == "compatible")
            .map(|(_, bytes)| codec::decode(bytes, PropertyType::MultiString));
        if let Some(values) = compatible {
            node.types = values.iter().map(ToString::to_string).collect();
        } else if !local.get("compatible").is_some_and(Property::is_dirty) {
            node.types.clear();
        }

        for (name, bytes) in incoming {
            let property = match local.shift_remove(&name) {
                Some(property)
                    if property.state == PropertyState::Deleted
                        || property.dirty
                        || property.raw.as_deref() == Some(bytes.as_slice()) =>
                {
                    property
                }
                _ => {
                    let hint = property_type(registries, &name, &bytes, &node.path, &node.types);
                    trace!("{}: {name} decoded as {hint}", node.path);
                    Property::decoded(key, &name, bytes, hint)
                }
            };
            node.properties.insert(name, property);
        }
        // Local properties the backend does not have yet.
        for (name, property) in local {
            if property.state == PropertyState::Init || property.dirty {
                node.properties.insert(name, property);
            }
        }

        let label = node
            .properties()
            .find(|property| property.class() == PropertyClass::Label)
            .and_then(|property| property.values().first())
            .map(ToString::to_string);
        node.label = label.or_else(|| backend.label_of(id)).or(node.label.take());
        node.phandle = node
            .u32("phandle")
            .or_else(|| node.u32("linux,phandle"))
            .unwrap_or(0);
        node.refresh_dirty();
    }

    /// Writes local edits to the backend, then resolves.
    ///
    /// Nodes are visited depth first. Each node is found again by its backend
    /// path, because binary ids move with every edit. Pending renames are
    /// applied, pending deletions removed, and dirty or new properties
    /// written. Renames and writes that run out of space grow the backend and
    /// retry, up to [`Config::max_capacity_retries`](crate::Config) attempts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] if a write still does not fit, or
    /// [`Error::Backend`] if the backend rejects an edit.
    pub fn sync(&mut self) -> Result<()> {
        let attempts = self.config.max_capacity_retries;
        let order: Vec<NodeKey> = self.by_path.values().copied().collect();
        let mut backend_paths: Vec<Option<String>> = vec![None; self.nodes.len()];
        let mut written = 0;

        for key in order {
            let node = &self.nodes[key.0];
            let mut backend_path = match node.parent {
                None => "/".to_owned(),
                Some(parent) => match &backend_paths[parent.0] {
                    Some(parent_path) => join_path(parent_path, &node.synced_name),
                    None => continue,
                },
            };
            let path = node.path.clone();
            let backend = self.backend.get_mut();
            let Some(id) = backend.find(&backend_path) else {
                warn!("{path} is no longer in the backend; skipping");
                continue;
            };
            self.nodes[key.0].id = Some(id);

            let node = &self.nodes[key.0];
            if node.parent.is_some() && node.name != node.synced_name {
                let new_name = node.name.clone();
                let old_path = backend_path.clone();
                retry_on_capacity(&mut *backend, attempts, "rename", &path, |backend| {
                    let id = backend
                        .find(&old_path)
                        .ok_or_else(|| BackendError::NotFound(old_path.clone()))?;
                    backend.rename(id, &new_name)
                })?;
                debug!("renamed {old_path} to {path}");
                backend_path = match old_path.rsplit_once('/') {
                    Some(("", _)) => join_path("/", &new_name),
                    Some((parent, _)) => join_path(parent, &new_name),
                    None => new_name.clone(),
                };
                self.nodes[key.0].synced_name = new_name;
            }

            let deleted: Vec<String> = self.nodes[key.0]
                .properties
                .values()
                .filter(|property| property.state == PropertyState::Deleted)
                .map(|property| property.name.clone())
                .collect();
            for name in deleted {
                let id = backend
                    .find(&backend_path)
                    .ok_or_else(|| Error::NodeNotFound(path.clone()))?;
                match backend.delete_property(id, &name) {
                    Ok(()) | Err(BackendError::NotFound(_)) => {}
                    Err(e) => return Err(Error::backend("delete_property", &path, e)),
                }
                self.nodes[key.0].properties.shift_remove(&name);
            }

            let pending: Vec<(String, Vec<u8>)> = self.nodes[key.0]
                .properties
                .values()
                .filter(|property| property.dirty || property.state == PropertyState::Init)
                .map(|property| (property.name.clone(), property.encoded()))
                .collect();
            for (name, bytes) in pending {
                retry_on_capacity(&mut *backend, attempts, "set_property", &path, |backend| {
                    let id = backend
                        .find(&backend_path)
                        .ok_or_else(|| BackendError::NotFound(backend_path.clone()))?;
                    backend.set_property(id, &name, &bytes)
                })?;
                if let Some(property) = self.nodes[key.0].properties.get_mut(&name) {
                    property.mark_synced(bytes);
                }
                written += 1;
            }

            self.nodes[key.0].refresh_dirty();
            backend_paths[key.0] = Some(backend_path);
        }

        // Renames moved backend paths; resolve must find the nodes there.
        for (index, backend_path) in backend_paths.into_iter().enumerate() {
            if let Some(backend_path) = backend_path {
                self.nodes[index].synced_path.clone_from(&backend_path);
                self.by_synced_path.insert(backend_path, NodeKey(index));
            }
        }
        debug!("synced {written} properties");
        self.resolve()
    }

    /// Re-decodes every property with the current registries, keeping
    /// local edits.
    pub fn retype(&mut self) {
        let keys: Vec<NodeKey> = self.by_path.values().copied().collect();
        for key in keys {
            let node = &self.nodes[key.0];
            let (path, types) = (node.path.clone(), node.types.clone());
            let retyped: Vec<(String, PropertyType, Vec<u8>)> = node
                .properties
                .values()
                .filter(|property| !property.dirty && property.state != PropertyState::Deleted)
                .filter_map(|property| {
                    let raw = property.raw.clone()?;
                    let ptype = property_type(&self.registries, &property.name, &raw, &path, &types);
                    (ptype != property.ptype).then(|| (property.name.clone(), ptype, raw))
                })
                .collect();
            for (name, ptype, raw) in retyped {
                let state = self.nodes[key.0].properties[&name].state;
                let mut property = Property::decoded(key, &name, raw, ptype);
                property.state = state;
                self.nodes[key.0].properties.insert(name, property);
            }
        }
    }
}

/// Chooses the type to decode property `name` as: references are cells,
/// then the schema type if the bytes fit it, otherwise a guess.
fn property_type(
    registries: &Registries,
    name: &str,
    bytes: &[u8],
    path: &str,
    compatible: &[String],
) -> PropertyType {
    if registries.phandles.contains(name) && bytes.len().is_multiple_of(4) {
        return PropertyType::UInt32;
    }
    let ptype = registries.schema.resolve(name, Some(path), compatible);
    if ptype != PropertyType::Unknown && codec::fits(bytes, ptype) {
        ptype
    } else {
        codec::guess_type_named(name, bytes)
    }
}
