// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Error types for the `sdt` crate.
//!
//! Lookups that routinely miss return `Option` instead of an error. The
//! variants here are for failures the caller has to act on, and each one
//! carries the node path (and property name, where there is one).

use sdt_device_tree::error::{FdtError, FdtErrorKind};
use thiserror::Error;

use crate::codec::CodecError;

/// A failure reported by a [`Backend`](crate::backend::Backend).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The backing store is full. Callers may [`grow`] and retry.
    ///
    /// [`grow`]: crate::backend::Backend::grow
    #[error("backing store has no space left")]
    NoSpace,
    /// The node or property does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A node already exists at the target path.
    #[error("node already exists: {0}")]
    Exists(String),
    /// The node or property name is not acceptable to the backend.
    #[error("invalid name: {0}")]
    InvalidName(String),
    /// The binary engine rejected the operation.
    #[error(transparent)]
    Fdt(FdtError),
}

impl From<FdtError> for BackendError {
    fn from(error: FdtError) -> Self {
        match error.kind {
            FdtErrorKind::NoSpace => BackendError::NoSpace,
            _ => BackendError::Fdt(error),
        }
    }
}

impl BackendError {
    /// Returns `true` for the capacity failure that resize-and-retry
    /// recovers from.
    #[must_use]
    pub fn is_no_space(&self) -> bool {
        matches!(self, BackendError::NoSpace)
    }
}

/// An error raised by the tree engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An operation required a node that does not exist.
    #[error("node not found: {0}")]
    NodeNotFound(String),
    /// A write still did not fit after the bounded number of resizes.
    #[error("{operation} on {path} is still out of space after {attempts} attempts")]
    Capacity {
        /// Backend operation that ran out of space.
        operation: &'static str,
        /// Path of the node being written.
        path: String,
        /// Number of attempts made.
        attempts: usize,
    },
    /// Two distinct backend nodes resolve to the same path. The tree is
    /// corrupt and must be discarded.
    #[error("two distinct nodes resolve to the same path {path}")]
    Structural {
        /// The duplicated path.
        path: String,
    },
    /// A cross-reference slot does not resolve to any node.
    #[error("{path}: property {property} references unknown phandle {phandle:#x}")]
    InvalidReference {
        /// Path of the node holding the property.
        path: String,
        /// Name of the reference-bearing property.
        property: String,
        /// The unresolvable value.
        phandle: u64,
    },
    /// Two nodes carry the same label.
    #[error("label `{label}` is used by both {first} and {second}")]
    DuplicateLabel {
        /// The duplicated label.
        label: String,
        /// Path of the node that claimed the label first.
        first: String,
        /// Path of the node that claimed it again.
        second: String,
    },
    /// A backend operation failed for a reason other than capacity.
    #[error("{operation} on {path} failed: {source}")]
    Backend {
        /// Backend operation that failed.
        operation: &'static str,
        /// Path of the node being operated on.
        path: String,
        /// The backend's report.
        source: BackendError,
    },
    /// A property value could not be parsed or encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Device tree source text could not be parsed.
    #[error("line {line}: {message}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        message: String,
    },
    /// A binary blob could not be read.
    #[error(transparent)]
    Fdt(#[from] FdtError),
    /// No backend is registered for the requested format.
    #[error("no backend registered for format `{0}`")]
    UnknownFormat(String),
    /// A generic-tree mapping could not be applied.
    #[error("invalid generic tree entry {path}: {message}")]
    Import {
        /// Path key of the offending entry.
        path: String,
        /// What was wrong.
        message: String,
    },
    /// An external transcoding tool failed.
    #[error("{tool} exited with {status}: {stderr}")]
    Tool {
        /// The command that was run.
        tool: String,
        /// Its exit status.
        status: String,
        /// Captured diagnostic output.
        stderr: String,
    },
    /// A pattern could not be compiled.
    #[error(transparent)]
    Pattern(#[from] regex::Error),
    /// JSON (de)serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Writing output text failed.
    #[error(transparent)]
    Format(#[from] std::fmt::Error),
    /// An I/O operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn backend(operation: &'static str, path: &str, source: BackendError) -> Self {
        Error::Backend {
            operation,
            path: path.to_owned(),
            source,
        }
    }
}

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
