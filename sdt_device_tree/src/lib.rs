// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Reading, in-place editing and writing of Flattened Device Tree (FDT)
//! blobs.
//!
//! The crate has three layers:
//!
//! - A read-only, zero-copy view of a blob ([`Fdt`](fdt::Fdt)) that needs no
//!   allocation.
//! - An editable blob ([`FdtBlob`](fdt::FdtBlob)) that mutates the structure
//!   block in place, the way libfdt does. The blob has a fixed capacity and
//!   reports [`FdtErrorKind::NoSpace`](error::FdtErrorKind::NoSpace) instead
//!   of growing behind the caller's back; call
//!   [`FdtBlob::resize`](fdt::FdtBlob::resize) to make room. Node handles are
//!   struct-block offsets, so they move whenever the blob is edited.
//! - An owned tree model ([`DeviceTree`](model::DeviceTree)) that is cheap to
//!   build by hand and serializes to a fresh blob.
//!
//! # Examples
//!
//! ```
//! use sdt_device_tree::fdt::{Fdt, FdtBlob};
//! use sdt_device_tree::model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty};
//!
//! let tree = DeviceTree::new(
//!     DeviceTreeNode::builder("")
//!         .child(
//!             DeviceTreeNode::builder("serial@1000")
//!                 .property(DeviceTreeProperty::new("status", "okay\0"))
//!                 .build(),
//!         )
//!         .build(),
//! );
//!
//! let mut blob = FdtBlob::from_bytes(&tree.to_dtb()).unwrap();
//! blob.resize(blob.totalsize() + 256).unwrap();
//! let serial = blob.path_offset("/serial@1000").unwrap().unwrap();
//! blob.set_property(serial, "status", b"disabled\0").unwrap();
//!
//! let fdt = Fdt::new(blob.as_bytes()).unwrap();
//! let node = fdt.find_node("/serial@1000").unwrap().unwrap();
//! let status = node.property("status").unwrap().unwrap();
//! assert_eq!(status.as_str().unwrap(), "disabled");
//! ```

#![no_std]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod error;
pub mod fdt;
pub mod memreserve;
#[cfg(feature = "write")]
#[cfg_attr(docsrs, doc(cfg(feature = "write")))]
pub mod model;
#[cfg(feature = "write")]
mod writer;

pub use memreserve::MemoryReservation;

/// Result type used throughout this crate.
pub type Result<T> = core::result::Result<T, error::FdtError>;
