// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::borrow::ToOwned;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use indexmap::IndexMap;
use twox_hash::xxhash64;

use super::property::DeviceTreeProperty;
use crate::{error::FdtError, fdt::FdtNode};

const HASH_SEED: u64 = 0xdead_cafe;

type OrderedMap<V> = IndexMap<String, V, xxhash64::State>;

fn ordered_map<V>(capacity: usize) -> OrderedMap<V> {
    IndexMap::with_capacity_and_hasher(capacity, xxhash64::State::with_seed(HASH_SEED))
}

/// An owned device tree node.
///
/// Children and properties are stored in [`IndexMap`]s, which provide O(1)
/// lookups by name while preserving insertion order. Insertion order is the
/// order in which they are written to a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTreeNode {
    name: String,
    properties: OrderedMap<DeviceTreeProperty>,
    children: OrderedMap<DeviceTreeNode>,
}

impl Default for DeviceTreeNode {
    fn default() -> Self {
        Self {
            name: String::new(),
            properties: ordered_map(0),
            children: ordered_map(0),
        }
    }
}

impl DeviceTreeNode {
    /// Creates a new, empty [`DeviceTreeNode`] with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Creates a new [`DeviceTreeNodeBuilder`] with the given name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> DeviceTreeNodeBuilder {
        DeviceTreeNodeBuilder::new(name)
    }

    /// Returns the name of this node.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames this node.
    ///
    /// A renamed child keeps its old key in its parent until it is removed
    /// and re-added, so rename before inserting.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Returns an iterator over the properties of this node.
    pub fn properties(&self) -> impl Iterator<Item = &DeviceTreeProperty> {
        self.properties.values()
    }

    /// Finds a property by its name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&DeviceTreeProperty> {
        self.properties.get(name)
    }

    /// Finds a property by its name and returns a mutable reference to it.
    #[must_use]
    pub fn property_mut(&mut self, name: &str) -> Option<&mut DeviceTreeProperty> {
        self.properties.get_mut(name)
    }

    /// Adds a property to this node, replacing any property with the same
    /// name in place.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sdt_device_tree::model::{DeviceTreeNode, DeviceTreeProperty};
    /// let mut node = DeviceTreeNode::new("my-node");
    /// node.add_property(DeviceTreeProperty::new("my-prop", vec![1, 2, 3, 4]));
    /// assert_eq!(node.property("my-prop").unwrap().value(), &[1, 2, 3, 4]);
    /// ```
    pub fn add_property(&mut self, property: DeviceTreeProperty) {
        self.properties.insert(property.name().to_owned(), property);
    }

    /// Removes a property from this node by its name, keeping the order of
    /// the remaining properties.
    pub fn remove_property(&mut self, name: &str) -> Option<DeviceTreeProperty> {
        self.properties.shift_remove(name)
    }

    /// Returns an iterator over the children of this node.
    pub fn children(&self) -> impl Iterator<Item = &DeviceTreeNode> {
        self.children.values()
    }

    /// Finds a child by its name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&DeviceTreeNode> {
        self.children.get(name)
    }

    /// Finds a child by its name and returns a mutable reference to it.
    #[must_use]
    pub fn child_mut(&mut self, name: &str) -> Option<&mut DeviceTreeNode> {
        self.children.get_mut(name)
    }

    /// Adds a child to this node and returns a mutable reference to it. A
    /// child with the same name is replaced in place.
    pub fn add_child(&mut self, child: DeviceTreeNode) -> &mut DeviceTreeNode {
        let entry = self.children.entry(child.name().to_owned());
        match entry {
            indexmap::map::Entry::Occupied(mut occupied) => {
                occupied.insert(child);
                occupied.into_mut()
            }
            indexmap::map::Entry::Vacant(vacant) => vacant.insert(child),
        }
    }

    /// Removes a child from this node by its name, keeping the order of the
    /// remaining children.
    pub fn remove_child(&mut self, name: &str) -> Option<DeviceTreeNode> {
        self.children.shift_remove(name)
    }
}

impl<'a> TryFrom<FdtNode<'a>> for DeviceTreeNode {
    type Error = FdtError;

    fn try_from(node: FdtNode<'a>) -> Result<Self, Self::Error> {
        let properties = node
            .properties()
            .map(|property| property.map(DeviceTreeProperty::from))
            .collect::<Result<Vec<_>, _>>()?;
        let mut property_map = ordered_map(properties.len());
        for property in properties {
            property_map.insert(property.name().to_owned(), property);
        }

        let children_vec = node
            .children()
            .map(|child| child?.try_into())
            .collect::<Result<Vec<DeviceTreeNode>, _>>()?;
        let mut children = ordered_map(children_vec.len());
        for child in children_vec {
            children.insert(child.name().to_owned(), child);
        }

        Ok(DeviceTreeNode {
            name: node.name()?.to_string(),
            properties: property_map,
            children,
        })
    }
}

/// A builder for creating [`DeviceTreeNode`]s.
#[derive(Debug, Default)]
pub struct DeviceTreeNodeBuilder {
    node: DeviceTreeNode,
}

impl DeviceTreeNodeBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            node: DeviceTreeNode::new(name),
        }
    }

    /// Adds a property to the node.
    #[must_use]
    pub fn property(mut self, property: DeviceTreeProperty) -> Self {
        self.node.add_property(property);
        self
    }

    /// Adds a property holding big-endian 32-bit cells.
    #[must_use]
    pub fn cells(self, name: impl Into<String>, cells: &[u32]) -> Self {
        let value: Vec<u8> = cells.iter().flat_map(|cell| cell.to_be_bytes()).collect();
        self.property(DeviceTreeProperty::new(name, value))
    }

    /// Adds a property holding NUL-terminated strings.
    #[must_use]
    pub fn strings(self, name: impl Into<String>, strings: &[&str]) -> Self {
        let mut value = Vec::new();
        for string in strings {
            value.extend_from_slice(string.as_bytes());
            value.push(0);
        }
        self.property(DeviceTreeProperty::new(name, value))
    }

    /// Adds a child to the node.
    #[must_use]
    pub fn child(mut self, child: DeviceTreeNode) -> Self {
        self.node.add_child(child);
        self
    }

    /// Builds the `DeviceTreeNode`.
    #[must_use]
    pub fn build(self) -> DeviceTreeNode {
        self.node
    }
}
