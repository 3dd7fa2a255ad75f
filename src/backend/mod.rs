// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Backing stores for a [`Tree`](crate::Tree).
//!
//! A [`Backend`] holds the authoritative copy of a device tree in some
//! format and exposes it through opaque [`NodeId`]s. Ids are only valid
//! until the next structural edit: binary ids are byte offsets that move
//! whenever anything before them grows or shrinks.

mod fdt;
mod source;

use std::fmt;

use log::{info, warn};
use sdt_device_tree::MemoryReservation;

pub use self::fdt::FdtBackend;
pub use self::source::SourceBackend;
use crate::config::Config;
use crate::error::{BackendError, Error, Result};
use crate::{OrderedMap, ordered_map};

const FDT_MAGIC: [u8; 4] = 0xd00d_feed_u32.to_be_bytes();

/// Identifies a node inside one [`Backend`], until its next structural edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The operations a backing store supports.
///
/// Lookups return `Option`. Edits return [`BackendError::NoSpace`] when the
/// store is full; the caller may [`grow`](Backend::grow) and retry, see
/// [`retry_on_capacity`].
pub trait Backend: fmt::Debug {
    /// Short format name, as registered in a [`BackendRegistry`].
    fn format(&self) -> &'static str;

    /// Finds a node by absolute path.
    fn find(&self, path: &str) -> Option<NodeId>;

    /// Returns the name of a node. The root is named `""`.
    fn name_of(&self, id: NodeId) -> Option<String>;

    /// Renames a node.
    ///
    /// # Errors
    ///
    /// Fails if a sibling already has `new_name`, or the store is full.
    fn rename(&mut self, id: NodeId, new_name: &str) -> Result<(), BackendError>;

    /// Adds a node at `path`. With `create_parents`, missing ancestors are
    /// created too. Ancestors that already exist are reused, so an add that
    /// failed half-way can be retried.
    ///
    /// # Errors
    ///
    /// Fails if the node exists, a parent is missing and `create_parents` is
    /// not set, or the store is full.
    fn add(&mut self, path: &str, create_parents: bool) -> Result<NodeId, BackendError>;

    /// Removes a node and its subtree.
    ///
    /// # Errors
    ///
    /// Fails for the root, or a stale id.
    fn remove(&mut self, id: NodeId) -> Result<(), BackendError>;

    /// Returns the children of a node, in order.
    fn children_of(&self, id: NodeId) -> Vec<NodeId>;

    /// Returns all properties of a node, in order.
    fn properties_of(&self, id: NodeId) -> Vec<(String, Vec<u8>)>;

    /// Returns one property value.
    fn get_property(&self, id: NodeId, name: &str) -> Option<Vec<u8>>;

    /// Sets a property, in place if it exists or after the last property
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Fails for a stale id, or when the store is full.
    fn set_property(&mut self, id: NodeId, name: &str, value: &[u8]) -> Result<(), BackendError>;

    /// Deletes a property.
    ///
    /// # Errors
    ///
    /// Fails with [`BackendError::NotFound`] if there is no such property.
    fn delete_property(&mut self, id: NodeId, name: &str) -> Result<(), BackendError>;

    /// Finds the node carrying `phandle`.
    fn cross_ref_to_id(&self, phandle: u32) -> Option<NodeId>;

    /// Returns the phandle of a node.
    fn id_to_cross_ref(&self, id: NodeId) -> Option<u32>;

    /// Makes room for more data.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be enlarged.
    fn grow(&mut self) -> Result<(), BackendError>;

    /// Returns a label the store knows for a node.
    fn label_of(&self, _id: NodeId) -> Option<String> {
        None
    }

    /// Returns the memory reservation block.
    fn memory_reservations(&self) -> Vec<MemoryReservation>;

    /// Serializes the store as a flattened device tree.
    ///
    /// # Errors
    ///
    /// Fails if the contents cannot be represented in a blob.
    fn to_dtb(&self) -> Result<Vec<u8>, BackendError>;

    /// Returns an independent copy of the store.
    fn duplicate(&self) -> Box<dyn Backend>;
}

/// Runs `op` against `backend`, growing it after every capacity failure.
///
/// With a bound of `max_attempts`, up to `max_attempts - 1` failures are
/// absorbed, each followed by exactly one [`Backend::grow`]. Any other
/// failure is returned immediately as [`Error::Backend`].
///
/// # Errors
///
/// Returns [`Error::Capacity`] if the operation still does not fit on the
/// last attempt.
pub fn retry_on_capacity<T>(
    backend: &mut dyn Backend,
    max_attempts: usize,
    operation: &'static str,
    path: &str,
    mut op: impl FnMut(&mut dyn Backend) -> Result<T, BackendError>,
) -> Result<T> {
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        match op(backend) {
            Ok(value) => return Ok(value),
            Err(BackendError::NoSpace) if attempt < attempts => {
                warn!("{operation} on {path} is out of space (attempt {attempt}), growing");
                backend
                    .grow()
                    .map_err(|e| Error::backend("grow", path, e))?;
            }
            Err(BackendError::NoSpace) => break,
            Err(e) => return Err(Error::backend(operation, path, e)),
        }
    }
    Err(Error::Capacity {
        operation,
        path: path.to_owned(),
        attempts,
    })
}

/// Builds a backend from raw input.
pub type BackendFactory = fn(&[u8], &Config) -> Result<Box<dyn Backend>>;

/// Backend constructors by format name.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    factories: OrderedMap<BackendFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BackendRegistry {
    /// Creates a registry with no formats.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: ordered_map(2),
        }
    }

    /// Creates a registry with `"dtb"` ([`FdtBackend`]) and `"dts"`
    /// ([`SourceBackend`]).
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("dtb", |bytes, config| {
            Ok(Box::new(FdtBackend::from_bytes(bytes)?.with_grow_step(config.grow_step)))
        });
        registry.register("dts", |bytes, _| {
            Ok(Box::new(SourceBackend::from_bytes(bytes)?))
        });
        registry
    }

    /// Registers a factory for `format`, replacing any previous one.
    pub fn register(&mut self, format: &str, factory: BackendFactory) {
        self.factories.insert(format.to_owned(), factory);
    }

    /// Returns the registered format names.
    pub fn formats(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Builds a backend for `format` from `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFormat`] if nothing is registered for
    /// `format`, or the factory's error if the input is rejected.
    pub fn open(&self, format: &str, bytes: &[u8], config: &Config) -> Result<Box<dyn Backend>> {
        let factory = self
            .factories
            .get(format)
            .ok_or_else(|| Error::UnknownFormat(format.to_owned()))?;
        info!("opening {} bytes with the {format} backend", bytes.len());
        factory(bytes, config)
    }

    /// Builds a backend, choosing `"dtb"` for input that starts with the FDT
    /// magic and `"dts"` otherwise.
    ///
    /// # Errors
    ///
    /// As for [`BackendRegistry::open`].
    pub fn open_detected(&self, bytes: &[u8], config: &Config) -> Result<Box<dyn Backend>> {
        self.open(detect_format(bytes), bytes, config)
    }
}

/// Returns `"dtb"` if `bytes` starts with the FDT magic, `"dts"` otherwise.
#[must_use]
pub fn detect_format(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&FDT_MAGIC) {
        "dtb"
    } else {
        "dts"
    }
}

/// Splits an absolute path into its components. The root has none.
pub(crate) fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|component| !component.is_empty())
}

/// Joins a parent path and a child name.
pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Splits a path into its parent path and last component.
pub(crate) fn split_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = trimmed.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((if parent.is_empty() { "/" } else { parent }, name))
}
