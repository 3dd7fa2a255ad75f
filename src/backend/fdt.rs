// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! A [`Backend`] over an editable flattened device tree blob.

use log::debug;
use sdt_device_tree::MemoryReservation;
use sdt_device_tree::error::FdtErrorKind;
use sdt_device_tree::fdt::FdtBlob;

use super::{Backend, NodeId, components, join_path};
use crate::config::DEFAULT_GROW_STEP;
use crate::error::{BackendError, Result};

/// A binary device tree, edited in place.
///
/// The blob has a fixed capacity. Edits that do not fit fail with
/// [`BackendError::NoSpace`]; [`Backend::grow`] enlarges the blob by the
/// configured step.
#[derive(Debug, Clone)]
pub struct FdtBackend {
    blob: FdtBlob,
    grow_step: usize,
}

impl FdtBackend {
    /// Copies and validates a blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fdt`](crate::Error::Fdt) if `bytes` is not a valid
    /// blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            blob: FdtBlob::from_bytes(bytes)?,
            grow_step: DEFAULT_GROW_STEP,
        })
    }

    /// Sets the number of bytes added by each [`Backend::grow`].
    #[must_use]
    pub fn with_grow_step(mut self, grow_step: usize) -> Self {
        self.grow_step = grow_step.max(1);
        self
    }

    /// Returns the blob bytes, including any free space.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.blob.as_bytes()
    }

    /// Returns the current capacity of the blob.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.blob.totalsize()
    }

    fn path_of(&self, id: NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut offset = id.0;
        while let Some(parent) = self.blob.parent_offset(offset).ok()? {
            names.push(self.blob.node_name(offset).ok()?);
            offset = parent;
        }
        if names.is_empty() {
            return Some("/".to_owned());
        }
        names.reverse();
        Some(names.iter().fold(String::new(), |path, name| path + "/" + name))
    }
}

impl Backend for FdtBackend {
    fn format(&self) -> &'static str {
        "dtb"
    }

    fn find(&self, path: &str) -> Option<NodeId> {
        self.blob.path_offset(path).ok().flatten().map(NodeId)
    }

    fn name_of(&self, id: NodeId) -> Option<String> {
        self.blob.node_name(id.0).ok()
    }

    fn rename(&mut self, id: NodeId, new_name: &str) -> Result<(), BackendError> {
        self.blob.set_name(id.0, new_name).map_err(|e| match e.kind {
            FdtErrorKind::Exists => BackendError::Exists(new_name.to_owned()),
            FdtErrorKind::BadPath => BackendError::InvalidName(new_name.to_owned()),
            _ => e.into(),
        })
    }

    fn add(&mut self, path: &str, create_parents: bool) -> Result<NodeId, BackendError> {
        let names: Vec<&str> = components(path).collect();
        let Some((last, parents)) = names.split_last() else {
            return Err(BackendError::Exists(path.to_owned()));
        };
        let mut offset = self.blob.root_offset();
        let mut current = String::from("/");
        for name in parents {
            current = join_path(&current, name);
            offset = match self.blob.path_offset(&current)? {
                Some(existing) => existing,
                None if create_parents => {
                    debug!("creating missing parent {current}");
                    self.add_child(offset, name)?
                }
                None => return Err(BackendError::NotFound(current)),
            };
        }
        self.add_child(offset, last).map(NodeId)
    }

    fn remove(&mut self, id: NodeId) -> Result<(), BackendError> {
        Ok(self.blob.delete_node(id.0)?)
    }

    fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.blob
            .subnode_offsets(id.0)
            .map(|offsets| offsets.into_iter().map(NodeId).collect())
            .unwrap_or_default()
    }

    fn properties_of(&self, id: NodeId) -> Vec<(String, Vec<u8>)> {
        self.blob.properties(id.0).unwrap_or_default()
    }

    fn get_property(&self, id: NodeId, name: &str) -> Option<Vec<u8>> {
        self.blob.property(id.0, name).ok().flatten()
    }

    fn set_property(&mut self, id: NodeId, name: &str, value: &[u8]) -> Result<(), BackendError> {
        self.blob.set_property(id.0, name, value).map_err(|e| match e.kind {
            FdtErrorKind::BadPath => BackendError::InvalidName(name.to_owned()),
            _ => e.into(),
        })
    }

    fn delete_property(&mut self, id: NodeId, name: &str) -> Result<(), BackendError> {
        self.blob.delete_property(id.0, name).map_err(|e| match e.kind {
            FdtErrorKind::NotFound => BackendError::NotFound(name.to_owned()),
            _ => e.into(),
        })
    }

    fn cross_ref_to_id(&self, phandle: u32) -> Option<NodeId> {
        self.blob.node_offset_by_phandle(phandle).ok().flatten().map(NodeId)
    }

    fn id_to_cross_ref(&self, id: NodeId) -> Option<u32> {
        self.blob.phandle(id.0).ok().flatten()
    }

    fn grow(&mut self) -> Result<(), BackendError> {
        let new_size = self.blob.totalsize() + self.grow_step;
        debug!("growing blob to {new_size} bytes");
        Ok(self.blob.resize(new_size)?)
    }

    fn label_of(&self, id: NodeId) -> Option<String> {
        let symbols = self.blob.path_offset("/__symbols__").ok().flatten()?;
        let path = self.path_of(id)?;
        self.blob
            .properties(symbols)
            .ok()?
            .into_iter()
            .find(|(_, value)| value.strip_suffix(b"\0").unwrap_or(value) == path.as_bytes())
            .map(|(name, _)| name)
    }

    fn memory_reservations(&self) -> Vec<MemoryReservation> {
        self.blob.fdt().memory_reservations().collect()
    }

    fn to_dtb(&self) -> Result<Vec<u8>, BackendError> {
        let mut blob = self.blob.clone();
        blob.pack();
        Ok(blob.into_bytes())
    }

    fn duplicate(&self) -> Box<dyn Backend> {
        Box::new(self.clone())
    }
}

impl FdtBackend {
    fn add_child(&mut self, parent: usize, name: &str) -> Result<usize, BackendError> {
        self.blob.add_subnode(parent, name).map_err(|e| match e.kind {
            FdtErrorKind::Exists => BackendError::Exists(name.to_owned()),
            FdtErrorKind::BadPath => BackendError::InvalidName(name.to_owned()),
            _ => e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use sdt_device_tree::model::{DeviceTree, DeviceTreeNode};

    use super::*;

    fn backend() -> FdtBackend {
        let tree = DeviceTree::new(
            DeviceTreeNode::builder("")
                .child(
                    DeviceTreeNode::builder("soc")
                        .child(
                            DeviceTreeNode::builder("uart@100")
                                .strings("status", &["okay"])
                                .cells("phandle", &[3])
                                .build(),
                        )
                        .build(),
                )
                .child(
                    DeviceTreeNode::builder("__symbols__")
                        .strings("uart0", &["/soc/uart@100"])
                        .build(),
                )
                .build(),
        );
        FdtBackend::from_bytes(&tree.to_dtb()).unwrap().with_grow_step(64)
    }

    #[test]
    fn packed_blob_needs_growth() {
        let mut backend = backend();
        let uart = backend.find("/soc/uart@100").unwrap();
        assert!(matches!(
            backend.set_property(uart, "clock-frequency", &[0, 0, 0, 1]),
            Err(BackendError::NoSpace)
        ));
        let before = backend.capacity();
        backend.grow().unwrap();
        assert_eq!(backend.capacity(), before + 64);
        let uart = backend.find("/soc/uart@100").unwrap();
        backend.set_property(uart, "clock-frequency", &[0, 0, 0, 1]).unwrap();
        assert_eq!(backend.get_property(uart, "clock-frequency").unwrap(), [0, 0, 0, 1]);
    }

    #[test]
    fn add_reuses_existing_parents() {
        let mut backend = backend();
        backend.grow().unwrap();
        backend.grow().unwrap();
        let id = backend.add("/soc/bus/dev", true).unwrap();
        assert_eq!(backend.name_of(id).unwrap(), "dev");
        assert!(backend.find("/soc/bus").is_some());
        assert!(matches!(
            backend.add("/soc/bus/dev", true),
            Err(BackendError::Exists(_))
        ));
        assert!(matches!(
            backend.add("/missing/dev", false),
            Err(BackendError::NotFound(_))
        ));
    }

    #[test]
    fn phandles_and_labels() {
        let backend = backend();
        let uart = backend.cross_ref_to_id(3).unwrap();
        assert_eq!(backend.id_to_cross_ref(uart), Some(3));
        assert_eq!(backend.label_of(uart).as_deref(), Some("uart0"));
        assert_eq!(backend.path_of(uart).as_deref(), Some("/soc/uart@100"));
    }

    #[test]
    fn delete_missing_property() {
        let mut backend = backend();
        let root = backend.find("/").unwrap();
        assert!(matches!(
            backend.delete_property(root, "nothing"),
            Err(BackendError::NotFound(_))
        ));
        assert!(backend.remove(root).is_err());
    }
}
