// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![cfg(feature = "write")]

use sdt_device_tree::MemoryReservation;
use sdt_device_tree::fdt::{Fdt, FdtBlob};
use sdt_device_tree::model::{DeviceTree, DeviceTreeNode};

#[test]
fn memreserve() {
    let mut tree = DeviceTree::new(DeviceTreeNode::new(""));
    tree.memory_reservations = vec![
        MemoryReservation::new(0x1000, 0x100),
        MemoryReservation::new(0x2000, 0x200),
    ];
    let dtb = tree.to_dtb();
    let fdt = Fdt::new(&dtb).unwrap();

    let reservations: Vec<_> = fdt.memory_reservations().collect();
    assert_eq!(reservations, tree.memory_reservations);

    let copy = DeviceTree::from_fdt(&fdt).unwrap();
    assert_eq!(copy.memory_reservations, reservations);
    assert_eq!(copy.to_dtb(), dtb);

    assert_eq!(reservations[0].to_string(), "/memreserve/ 0x1000 0x100;");
}

#[test]
fn memreserve_survives_blob_edits() {
    let mut tree = DeviceTree::new(DeviceTreeNode::new(""));
    tree.memory_reservations = vec![MemoryReservation::new(0x8000_0000, 0x10_0000)];
    let mut blob = FdtBlob::from_bytes(&tree.to_dtb_with_headroom(64)).unwrap();
    let root = blob.root_offset();
    blob.set_property(root, "model", b"board\0").unwrap();

    let reservations: Vec<_> = blob.fdt().memory_reservations().collect();
    assert_eq!(reservations, tree.memory_reservations);
}
