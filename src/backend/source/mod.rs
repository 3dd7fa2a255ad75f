// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! A [`Backend`] over parsed device tree source.

mod lexer;
mod parser;

use log::debug;
use sdt_device_tree::MemoryReservation;
use sdt_device_tree::model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty};

use super::{Backend, NodeId, components, join_path};
use crate::error::{BackendError, Error, Result};

#[derive(Debug, Clone, Default)]
struct SourceNode {
    name: String,
    parent: Option<usize>,
    children: Vec<usize>,
    properties: Vec<(String, Vec<u8>)>,
    labels: Vec<String>,
    alive: bool,
}

/// Device tree source, held as an arena of nodes.
///
/// Ids are arena indices and stay valid until their node is removed. The
/// arena never runs out of space, so [`Backend::grow`] does nothing. Labels
/// from the source are kept and reported through [`Backend::label_of`].
///
/// ```
/// use sdt::backend::{Backend, SourceBackend};
///
/// let backend = SourceBackend::parse("/dts-v1/; / { uart0: serial { }; };").unwrap();
/// let serial = backend.find("/serial").unwrap();
/// assert_eq!(backend.label_of(serial).as_deref(), Some("uart0"));
/// ```
#[derive(Debug, Clone)]
pub struct SourceBackend {
    nodes: Vec<SourceNode>,
    reservations: Vec<MemoryReservation>,
    boot_cpuid_phys: u32,
}

impl Default for SourceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceBackend {
    /// Creates a tree holding only an empty root.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![SourceNode {
                alive: true,
                ..SourceNode::default()
            }],
            reservations: Vec::new(),
            boot_cpuid_phys: 0,
        }
    }

    /// Parses device tree source text.
    ///
    /// `/include/` and cpp directives are rejected; the text must already be
    /// preprocessed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] with the offending line.
    pub fn parse(source: &str) -> Result<Self> {
        let parsed = parser::parse(source)?;
        debug!(
            "parsed {} source nodes",
            parsed.nodes.iter().filter(|node| node.alive).count()
        );
        Ok(Self {
            nodes: parsed.nodes,
            reservations: parsed.reservations,
            boot_cpuid_phys: parsed.boot_cpuid_phys,
        })
    }

    /// Parses UTF-8 source text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if `bytes` is not UTF-8 or not valid source.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).map_err(|e| Error::Parse {
            line: 1 + bytes[..e.valid_up_to()].iter().filter(|&&b| b == b'\n').count(),
            message: "source is not valid UTF-8".to_owned(),
        })?;
        Self::parse(text)
    }

    /// Adds a memory reservation.
    pub fn reserve(&mut self, reservation: MemoryReservation) {
        self.reservations.push(reservation);
    }

    fn node(&self, id: NodeId) -> Option<&SourceNode> {
        self.nodes.get(id.0).filter(|node| node.alive)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut SourceNode, BackendError> {
        self.nodes
            .get_mut(id.0)
            .filter(|node| node.alive)
            .ok_or_else(|| BackendError::NotFound(format!("node {id}")))
    }

    fn child(&self, parent: usize, name: &str) -> Option<usize> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[child].name == name)
    }

    fn new_child(&mut self, parent: usize, name: &str) -> Result<usize, BackendError> {
        if name.is_empty() || name.contains('/') {
            return Err(BackendError::InvalidName(name.to_owned()));
        }
        let key = self.nodes.len();
        self.nodes.push(SourceNode {
            name: name.to_owned(),
            parent: Some(parent),
            alive: true,
            ..SourceNode::default()
        });
        self.nodes[parent].children.push(key);
        Ok(key)
    }

    fn model_node(&self, key: usize) -> DeviceTreeNode {
        let node = &self.nodes[key];
        let mut model = DeviceTreeNode::new(node.name.clone());
        for (name, value) in &node.properties {
            model.add_property(DeviceTreeProperty::new(name.clone(), value.clone()));
        }
        for &child in &node.children {
            model.add_child(self.model_node(child));
        }
        model
    }
}

impl Backend for SourceBackend {
    fn format(&self) -> &'static str {
        "dts"
    }

    fn find(&self, path: &str) -> Option<NodeId> {
        if !path.starts_with('/') {
            return None;
        }
        components(path)
            .try_fold(0, |node, name| self.child(node, name))
            .map(NodeId)
    }

    fn name_of(&self, id: NodeId) -> Option<String> {
        self.node(id).map(|node| node.name.clone())
    }

    fn rename(&mut self, id: NodeId, new_name: &str) -> Result<(), BackendError> {
        let parent = self.node_mut(id)?.parent;
        if let Some(parent) = parent {
            if self.child(parent, new_name).is_some_and(|other| other != id.0) {
                return Err(BackendError::Exists(new_name.to_owned()));
            }
        }
        self.node_mut(id)?.name = new_name.to_owned();
        Ok(())
    }

    fn add(&mut self, path: &str, create_parents: bool) -> Result<NodeId, BackendError> {
        let names: Vec<&str> = components(path).collect();
        let Some((last, parents)) = names.split_last() else {
            return Err(BackendError::Exists(path.to_owned()));
        };
        let mut node = 0;
        let mut current = String::from("/");
        for name in parents {
            current = join_path(&current, name);
            node = match self.child(node, name) {
                Some(existing) => existing,
                None if create_parents => self.new_child(node, name)?,
                None => return Err(BackendError::NotFound(current)),
            };
        }
        if self.child(node, last).is_some() {
            return Err(BackendError::Exists(path.to_owned()));
        }
        self.new_child(node, last).map(NodeId)
    }

    fn remove(&mut self, id: NodeId) -> Result<(), BackendError> {
        let parent = self
            .node_mut(id)?
            .parent
            .ok_or_else(|| BackendError::InvalidName("/".to_owned()))?;
        self.nodes[parent].children.retain(|&child| child != id.0);
        let mut stack = vec![id.0];
        while let Some(key) = stack.pop() {
            let node = &mut self.nodes[key];
            node.alive = false;
            stack.extend(node.children.iter().copied());
        }
        Ok(())
    }

    fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id)
            .map(|node| node.children.iter().copied().map(NodeId).collect())
            .unwrap_or_default()
    }

    fn properties_of(&self, id: NodeId) -> Vec<(String, Vec<u8>)> {
        self.node(id)
            .map(|node| node.properties.clone())
            .unwrap_or_default()
    }

    fn get_property(&self, id: NodeId, name: &str) -> Option<Vec<u8>> {
        self.node(id)?
            .properties
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.clone())
    }

    fn set_property(&mut self, id: NodeId, name: &str, value: &[u8]) -> Result<(), BackendError> {
        if name.is_empty() {
            return Err(BackendError::InvalidName(name.to_owned()));
        }
        let properties = &mut self.node_mut(id)?.properties;
        match properties.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, existing)) => value.clone_into(existing),
            None => properties.push((name.to_owned(), value.to_vec())),
        }
        Ok(())
    }

    fn delete_property(&mut self, id: NodeId, name: &str) -> Result<(), BackendError> {
        let properties = &mut self.node_mut(id)?.properties;
        let position = properties
            .iter()
            .position(|(existing, _)| existing == name)
            .ok_or_else(|| BackendError::NotFound(name.to_owned()))?;
        properties.remove(position);
        Ok(())
    }

    fn cross_ref_to_id(&self, phandle: u32) -> Option<NodeId> {
        if phandle == 0 || phandle == u32::MAX {
            return None;
        }
        (0..self.nodes.len())
            .map(NodeId)
            .find(|&id| self.id_to_cross_ref(id) == Some(phandle))
    }

    fn id_to_cross_ref(&self, id: NodeId) -> Option<u32> {
        let value = self
            .get_property(id, "phandle")
            .or_else(|| self.get_property(id, "linux,phandle"))?;
        <[u8; 4]>::try_from(value.as_slice())
            .ok()
            .map(u32::from_be_bytes)
    }

    fn grow(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn label_of(&self, id: NodeId) -> Option<String> {
        self.node(id)?.labels.first().cloned()
    }

    fn memory_reservations(&self) -> Vec<MemoryReservation> {
        self.reservations.clone()
    }

    fn to_dtb(&self) -> Result<Vec<u8>, BackendError> {
        let mut tree = DeviceTree::new(self.model_node(0));
        tree.memory_reservations.clone_from(&self.reservations);
        tree.boot_cpuid_phys = self.boot_cpuid_phys;
        Ok(tree.to_dtb())
    }

    fn duplicate(&self) -> Box<dyn Backend> {
        Box::new(self.clone())
    }
}
