// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![cfg(feature = "write")]

use sdt_device_tree::error::FdtErrorKind;
use sdt_device_tree::fdt::{Fdt, FdtBlob};
use sdt_device_tree::model::{DeviceTree, DeviceTreeNode};

fn sample(headroom: usize) -> FdtBlob {
    let tree = DeviceTree::new(
        DeviceTreeNode::builder("")
            .cells("#address-cells", &[1])
            .child(
                DeviceTreeNode::builder("cpus")
                    .child(DeviceTreeNode::builder("cpu@0").cells("reg", &[0]).build())
                    .child(DeviceTreeNode::builder("cpu@1").cells("reg", &[1]).build())
                    .build(),
            )
            .child(
                DeviceTreeNode::builder("clk")
                    .cells("phandle", &[3])
                    .cells("#clock-cells", &[0])
                    .build(),
            )
            .build(),
    );
    FdtBlob::from_bytes(&tree.to_dtb_with_headroom(headroom)).unwrap()
}

fn names(blob: &FdtBlob, path: &str) -> Vec<String> {
    let offset = blob.path_offset(path).unwrap().unwrap();
    blob.subnode_offsets(offset)
        .unwrap()
        .into_iter()
        .map(|child| blob.node_name(child).unwrap())
        .collect()
}

#[test]
fn packed_blob_reports_no_space() {
    let mut blob = sample(0);
    let root = blob.root_offset();
    let before = blob.clone();

    let err = blob.set_property(root, "model", b"board\0").unwrap_err();
    assert_eq!(err.kind, FdtErrorKind::NoSpace);
    assert_eq!(blob, before);

    let err = blob.add_subnode(root, "memory@0").unwrap_err();
    assert_eq!(err.kind, FdtErrorKind::NoSpace);
    assert_eq!(blob, before);
}

#[test]
fn resize_makes_room() {
    let mut blob = sample(0);
    let size = blob.totalsize();
    blob.resize(size + 1024).unwrap();
    assert_eq!(blob.free_space(), 1024);

    let root = blob.root_offset();
    blob.set_property(root, "model", b"board\0").unwrap();
    let fdt = Fdt::new(blob.as_bytes()).unwrap();
    let model = fdt.root().unwrap().property("model").unwrap().unwrap();
    assert_eq!(model.as_str().unwrap(), "board");

    blob.pack();
    assert_eq!(blob.free_space(), 0);
    Fdt::new(blob.as_bytes()).unwrap();
    assert_eq!(
        blob.resize(16).unwrap_err().kind,
        FdtErrorKind::NoSpace
    );
}

#[test]
fn set_property_replaces_in_place_and_keeps_order() {
    let mut blob = sample(256);
    let cpu = blob.path_offset("/cpus/cpu@0").unwrap().unwrap();
    blob.set_property(cpu, "status", b"okay\0").unwrap();
    blob.set_property(cpu, "reg", &[0, 0, 0, 8, 0, 0, 0, 9]).unwrap();

    let props = blob.properties(cpu).unwrap();
    assert_eq!(props[0], ("reg".to_owned(), vec![0, 0, 0, 8, 0, 0, 0, 9]));
    assert_eq!(props[1], ("status".to_owned(), b"okay\0".to_vec()));

    // Nodes after the edit moved, but are still reachable by path.
    let cpu1 = blob.path_offset("/cpus/cpu@1").unwrap().unwrap();
    assert_eq!(blob.property(cpu1, "reg").unwrap(), Some(vec![0, 0, 0, 1]));
}

#[test]
fn delete_property_and_node() {
    let mut blob = sample(0);
    let used = blob.totalsize() - blob.free_space();
    let cpu = blob.path_offset("/cpus/cpu@0").unwrap().unwrap();
    blob.delete_property(cpu, "reg").unwrap();
    assert!(blob.property(cpu, "reg").unwrap().is_none());
    assert_eq!(
        blob.delete_property(cpu, "reg").unwrap_err().kind,
        FdtErrorKind::NotFound
    );

    blob.delete_node(cpu).unwrap();
    assert_eq!(names(&blob, "/cpus"), ["cpu@1"]);
    assert!(blob.totalsize() - blob.free_space() < used);

    let root = blob.root_offset();
    assert_eq!(
        blob.delete_node(root).unwrap_err().kind,
        FdtErrorKind::BadOffset
    );
}

#[test]
fn add_subnode_appends_after_siblings() {
    let mut blob = sample(128);
    let cpus = blob.path_offset("/cpus").unwrap().unwrap();
    let cpu2 = blob.add_subnode(cpus, "cpu@2").unwrap();
    assert_eq!(blob.node_name(cpu2).unwrap(), "cpu@2");
    assert_eq!(names(&blob, "/cpus"), ["cpu@0", "cpu@1", "cpu@2"]);
    assert_eq!(blob.parent_offset(cpu2).unwrap(), Some(cpus));

    let cpus = blob.path_offset("/cpus").unwrap().unwrap();
    assert_eq!(
        blob.add_subnode(cpus, "cpu@2").unwrap_err().kind,
        FdtErrorKind::Exists
    );
    assert_eq!(
        blob.add_subnode(cpus, "a/b").unwrap_err().kind,
        FdtErrorKind::BadPath
    );
}

#[test]
fn rename_node() {
    let mut blob = sample(64);
    let cpu = blob.path_offset("/cpus/cpu@1").unwrap().unwrap();
    blob.set_name(cpu, "processor@1").unwrap();
    assert_eq!(names(&blob, "/cpus"), ["cpu@0", "processor@1"]);
    let clk = blob.path_offset("/clk").unwrap().unwrap();
    assert_eq!(blob.phandle(clk).unwrap(), Some(3));

    let cpu0 = blob.path_offset("/cpus/cpu@0").unwrap().unwrap();
    assert_eq!(
        blob.set_name(cpu0, "processor@1").unwrap_err().kind,
        FdtErrorKind::Exists
    );
}

#[test]
fn phandle_lookup_follows_edits() {
    let mut blob = sample(64);
    let clk = blob.path_offset("/clk").unwrap().unwrap();
    assert_eq!(blob.node_offset_by_phandle(3).unwrap(), Some(clk));
    assert_eq!(blob.node_offset_by_phandle(4).unwrap(), None);
    assert_eq!(blob.node_offset_by_phandle(0).unwrap(), None);

    let root = blob.root_offset();
    blob.set_property(root, "model", b"moves-everything\0").unwrap();
    let moved = blob.node_offset_by_phandle(3).unwrap().unwrap();
    assert_ne!(moved, clk);
    assert_eq!(blob.node_name(moved).unwrap(), "clk");
}
