// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types for the `sdt_device_tree` crate.

use core::fmt;

/// An error that can occur when reading or editing a device tree blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct FdtError {
    offset: usize,
    /// What went wrong.
    pub kind: FdtErrorKind,
}

impl FdtError {
    pub(crate) fn new(kind: FdtErrorKind, offset: usize) -> Self {
        Self { offset, kind }
    }

    /// Byte offset into the blob at which the error was detected.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// The kind of an [`FdtError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FdtErrorKind {
    /// The magic number of the device tree is invalid.
    InvalidMagic,
    /// The Device Tree version is not supported by this library.
    UnsupportedVersion(u32),
    /// The length of the device tree is invalid.
    InvalidLength,
    /// An invalid token was encountered.
    BadToken(u32),
    /// An invalid string was encountered.
    InvalidString,
    /// The blob has no room left for the requested edit.
    NoSpace,
    /// The requested node or property does not exist.
    NotFound,
    /// A node with the requested name already exists.
    Exists,
    /// The offset does not point at a node.
    BadOffset,
    /// The node name or path is malformed.
    BadPath,
}

impl fmt::Display for FdtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.kind, self.offset)
    }
}

impl fmt::Display for FdtErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdtErrorKind::InvalidMagic => write!(f, "invalid FDT magic number"),
            FdtErrorKind::UnsupportedVersion(version) => {
                write!(f, "the FDT version {version} is not supported")
            }
            FdtErrorKind::InvalidLength => write!(f, "invalid FDT length"),
            FdtErrorKind::BadToken(token) => write!(f, "bad FDT token: 0x{token:x}"),
            FdtErrorKind::InvalidString => write!(f, "invalid string in FDT"),
            FdtErrorKind::NoSpace => write!(f, "not enough free space in FDT"),
            FdtErrorKind::NotFound => write!(f, "node or property not found"),
            FdtErrorKind::Exists => write!(f, "node already exists"),
            FdtErrorKind::BadOffset => write!(f, "offset does not point at a node"),
            FdtErrorKind::BadPath => write!(f, "malformed node name or path"),
        }
    }
}

impl core::error::Error for FdtError {}
