// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An owned, in-memory representation of a device tree.
//!
//! This module provides the [`DeviceTree`], [`DeviceTreeNode`], and
//! [`DeviceTreeProperty`] structs, which can be used to build a device tree
//! by hand or to take an owned copy of a blob. A [`DeviceTree`] serializes to
//! a fresh flattened device tree blob, optionally with spare capacity for
//! in-place edits through [`FdtBlob`](crate::fdt::FdtBlob).

use alloc::vec::Vec;

use crate::error::FdtError;
use crate::fdt::Fdt;
use crate::{MemoryReservation, writer};
mod node;
mod property;
pub use node::{DeviceTreeNode, DeviceTreeNodeBuilder};
pub use property::DeviceTreeProperty;

/// An owned representation of a whole device tree.
///
/// # Examples
///
/// ```
/// # use sdt_device_tree::model::{DeviceTree, DeviceTreeNode};
/// let mut tree = DeviceTree::new(DeviceTreeNode::new(""));
/// tree.root_mut().add_child(DeviceTreeNode::new("child"));
/// assert!(tree.find_node("/child").is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTree {
    root: DeviceTreeNode,
    /// The memory reservations for this device tree.
    pub memory_reservations: Vec<MemoryReservation>,
    /// Physical id of the boot CPU, copied into the blob header.
    pub boot_cpuid_phys: u32,
}

impl DeviceTree {
    /// Creates a new `DeviceTree` with the given root node.
    #[must_use]
    pub fn new(root: DeviceTreeNode) -> Self {
        Self {
            root,
            memory_reservations: Vec::new(),
            boot_cpuid_phys: 0,
        }
    }

    /// Takes an owned copy of a parsed blob.
    ///
    /// # Errors
    ///
    /// Returns an error if any node or property of the `Fdt` cannot be
    /// parsed.
    pub fn from_fdt(fdt: &Fdt<'_>) -> Result<Self, FdtError> {
        let root = DeviceTreeNode::try_from(fdt.root()?)?;
        Ok(DeviceTree {
            root,
            memory_reservations: fdt.memory_reservations().collect(),
            boot_cpuid_phys: fdt.boot_cpuid_phys(),
        })
    }

    /// Serializes the `DeviceTree` to a packed flattened device tree blob.
    ///
    /// # Panics
    ///
    /// This may panic if any of the lengths written to the DTB (block sizes,
    /// property value length, etc.) exceed [`u32::MAX`].
    #[must_use]
    pub fn to_dtb(&self) -> Vec<u8> {
        writer::to_bytes(self, 0)
    }

    /// Serializes the `DeviceTree` with `headroom` bytes of free space after
    /// the strings block.
    ///
    /// # Panics
    ///
    /// Same as [`DeviceTree::to_dtb`].
    #[must_use]
    pub fn to_dtb_with_headroom(&self, headroom: usize) -> Vec<u8> {
        writer::to_bytes(self, headroom)
    }

    /// Returns a reference to the root node of the device tree.
    #[must_use]
    pub fn root(&self) -> &DeviceTreeNode {
        &self.root
    }

    /// Returns a mutable reference to the root node of the device tree.
    pub fn root_mut(&mut self) -> &mut DeviceTreeNode {
        &mut self.root
    }

    /// Finds a node by its absolute path.
    #[must_use]
    pub fn find_node(&self, path: &str) -> Option<&DeviceTreeNode> {
        if !path.starts_with('/') {
            return None;
        }
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(&self.root, |node, component| node.child(component))
    }

    /// Finds a node by its absolute path and returns a mutable reference to
    /// it.
    ///
    /// # Performance
    ///
    /// Child lookup is a constant-time operation, so this is linear in the
    /// number of path segments.
    pub fn find_node_mut(&mut self, path: &str) -> Option<&mut DeviceTreeNode> {
        if !path.starts_with('/') {
            return None;
        }
        let mut current_node = &mut self.root;
        for component in path.split('/').filter(|s| !s.is_empty()) {
            current_node = current_node.child_mut(component)?;
        }
        Some(current_node)
    }
}
