// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::borrow::ToOwned;
use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use zerocopy::IntoBytes;

use crate::fdt::{
    FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_PROP,
    FDT_VERSION, Fdt, FdtHeader,
};
use crate::memreserve::MemoryReservation;
use crate::model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty};

/// Deduplicating builder for the strings block.
#[derive(Default)]
struct StringTable {
    block: Vec<u8>,
    offsets: BTreeMap<String, u32>,
}

impl StringTable {
    fn offset_of(&mut self, name: &str) -> u32 {
        if let Some(offset) = self.offsets.get(name) {
            return *offset;
        }
        let offset = block_len(self.block.len());
        self.block.extend_from_slice(name.as_bytes());
        self.block.push(0);
        self.offsets.insert(name.to_owned(), offset);
        offset
    }
}

pub(crate) fn to_bytes(tree: &DeviceTree, headroom: usize) -> Vec<u8> {
    let memory_reservations = write_memory_reservations(&tree.memory_reservations);
    let mut strings = StringTable::default();
    let mut struct_block = Vec::new();
    write_node(&mut struct_block, &mut strings, tree.root());
    struct_block.extend_from_slice(&FDT_END.to_be_bytes());

    let off_mem_rsvmap = size_of::<FdtHeader>();
    let off_dt_struct = off_mem_rsvmap + memory_reservations.len();
    let off_dt_strings = off_dt_struct + struct_block.len();
    let totalsize = off_dt_strings + strings.block.len() + headroom;

    let header = FdtHeader {
        magic: FDT_MAGIC.into(),
        totalsize: block_len(totalsize).into(),
        off_dt_struct: block_len(off_dt_struct).into(),
        off_dt_strings: block_len(off_dt_strings).into(),
        off_mem_rsvmap: block_len(off_mem_rsvmap).into(),
        version: FDT_VERSION.into(),
        last_comp_version: FDT_LAST_COMP_VERSION.into(),
        boot_cpuid_phys: tree.boot_cpuid_phys.into(),
        size_dt_strings: block_len(strings.block.len()).into(),
        size_dt_struct: block_len(struct_block.len()).into(),
    };

    let mut dtb = Vec::with_capacity(totalsize);
    dtb.extend_from_slice(header.as_bytes());
    dtb.extend_from_slice(&memory_reservations);
    dtb.extend_from_slice(&struct_block);
    dtb.extend_from_slice(&strings.block);
    dtb.resize(totalsize, 0);
    dtb
}

fn block_len(len: usize) -> u32 {
    u32::try_from(len).expect("device tree blocks are limited to u32::MAX bytes")
}

fn write_memory_reservations(reservations: &[MemoryReservation]) -> Vec<u8> {
    let mut memory_reservations = Vec::new();
    for reservation in reservations {
        memory_reservations.extend_from_slice(&reservation.address().to_be_bytes());
        memory_reservations.extend_from_slice(&reservation.size().to_be_bytes());
    }
    memory_reservations.extend_from_slice(&[0; 16]);
    memory_reservations
}

fn write_node(struct_block: &mut Vec<u8>, strings: &mut StringTable, node: &DeviceTreeNode) {
    struct_block.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
    struct_block.extend_from_slice(node.name().as_bytes());
    struct_block.push(0);
    align(struct_block);

    for prop in node.properties() {
        write_prop(struct_block, strings, prop);
    }

    for child in node.children() {
        write_node(struct_block, strings, child);
    }

    struct_block.extend_from_slice(&FDT_END_NODE.to_be_bytes());
}

fn write_prop(struct_block: &mut Vec<u8>, strings: &mut StringTable, prop: &DeviceTreeProperty) {
    struct_block.extend_from_slice(&FDT_PROP.to_be_bytes());
    struct_block.extend_from_slice(&block_len(prop.value().len()).to_be_bytes());
    struct_block.extend_from_slice(&strings.offset_of(prop.name()).to_be_bytes());
    struct_block.extend_from_slice(prop.value());
    align(struct_block);
}

fn align(vec: &mut Vec<u8>) {
    let new_len = Fdt::align_tag_offset(vec.len());
    vec.resize(new_len, 0);
}
