// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An owned device tree blob that is edited in place.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::vec::Vec;

use zerocopy::{FromBytes, IntoBytes};

use super::{
    FDT_BEGIN_NODE, FDT_END_NODE, FDT_LAST_COMP_VERSION, FDT_MAGIC, FDT_PROP, FDT_TAGSIZE,
    FDT_VERSION, Fdt, FdtHeader, FdtToken,
};
use crate::error::{FdtError, FdtErrorKind};

const PROP_HEADER_SIZE: usize = 3 * FDT_TAGSIZE;

/// An owned flattened device tree with a fixed capacity.
///
/// The blob is kept in canonical layout: header, memory reservation map,
/// structure block, strings block, then free space up to `totalsize`. Every
/// edit splices the structure block in place and fails with
/// [`FdtErrorKind::NoSpace`] if the free space is exhausted, leaving the blob
/// unchanged. Nodes are addressed by the offset of their `FDT_BEGIN_NODE`
/// tag; any structural edit may move the nodes that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdtBlob {
    data: Vec<u8>,
}

impl FdtBlob {
    /// Copies `bytes` into a new editable blob.
    ///
    /// The capacity of the new blob equals the `totalsize` of the input.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid FDT.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let fdt = Fdt::new(bytes)?;
        let header = fdt.header();

        let rsv_start = header.off_mem_rsvmap() as usize;
        let rsv_entries = fdt.memory_reservations().count() + 1;
        let rsv_end = rsv_start + rsv_entries * super::FDT_RSV_ENTRY_SIZE;
        let struct_start = header.off_dt_struct() as usize;
        let struct_end = struct_start + header.size_dt_struct() as usize;
        let strings_start = header.off_dt_strings() as usize;
        let strings_end = strings_start + header.size_dt_strings() as usize;
        let (Some(rsvmap), Some(structs), Some(strings)) = (
            bytes.get(rsv_start..rsv_end),
            bytes.get(struct_start..struct_end),
            bytes.get(strings_start..strings_end),
        ) else {
            return Err(FdtError::new(FdtErrorKind::InvalidLength, 0));
        };

        let off_mem_rsvmap = size_of::<FdtHeader>();
        let off_dt_struct = off_mem_rsvmap + rsvmap.len();
        let off_dt_strings = off_dt_struct + structs.len();
        let used = off_dt_strings + strings.len();
        let totalsize = used.max(bytes.len());

        let mut data = Vec::with_capacity(totalsize);
        let header = FdtHeader {
            magic: FDT_MAGIC.into(),
            totalsize: to_u32(totalsize)?.into(),
            off_dt_struct: to_u32(off_dt_struct)?.into(),
            off_dt_strings: to_u32(off_dt_strings)?.into(),
            off_mem_rsvmap: to_u32(off_mem_rsvmap)?.into(),
            version: FDT_VERSION.into(),
            last_comp_version: FDT_LAST_COMP_VERSION.into(),
            boot_cpuid_phys: header.boot_cpuid_phys().into(),
            size_dt_strings: to_u32(strings.len())?.into(),
            size_dt_struct: to_u32(structs.len())?.into(),
        };
        data.extend_from_slice(header.as_bytes());
        data.extend_from_slice(rsvmap);
        data.extend_from_slice(structs);
        data.extend_from_slice(strings);
        data.resize(totalsize, 0);

        Ok(Self { data })
    }

    /// Returns a read-only view of the blob.
    #[must_use]
    pub fn fdt(&self) -> Fdt<'_> {
        Fdt { data: &self.data }
    }

    /// Returns the raw bytes of the blob, including free space.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the blob and returns its raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Returns the capacity of the blob in bytes.
    #[must_use]
    pub fn totalsize(&self) -> usize {
        self.data.len()
    }

    /// Returns the number of bytes still available for edits.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.data.len() - self.used()
    }

    /// Changes the capacity of the blob to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NoSpace`] if `new_size` is smaller than the
    /// bytes currently in use, or does not fit the header.
    pub fn resize(&mut self, new_size: usize) -> crate::Result<()> {
        if new_size < self.used() {
            return Err(FdtError::new(FdtErrorKind::NoSpace, new_size));
        }
        let totalsize = to_u32(new_size)?;
        self.data.resize(new_size, 0);
        self.header_mut().totalsize.set(totalsize);
        Ok(())
    }

    /// Drops all free space from the end of the blob.
    pub fn pack(&mut self) {
        let used = self.used();
        self.data.truncate(used);
        // `used` never exceeds the previous totalsize, which fits in a u32.
        if let Ok(totalsize) = u32::try_from(used) {
            self.header_mut().totalsize.set(totalsize);
        }
    }

    /// Returns the offset of the root node.
    #[must_use]
    pub fn root_offset(&self) -> usize {
        self.header().off_dt_struct() as usize
    }

    /// Finds a node by absolute path.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be parsed along the path.
    pub fn path_offset(&self, path: &str) -> crate::Result<Option<usize>> {
        let fdt = self.fdt();
        match fdt.find_node(path) {
            None => Ok(None),
            Some(node) => Ok(Some(node?.offset())),
        }
    }

    /// Returns the name of the node at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `offset` is not a node.
    pub fn node_name(&self, offset: usize) -> crate::Result<String> {
        let fdt = self.fdt();
        let node = fdt.node_at(offset)?;
        Ok(node.name()?.to_owned())
    }

    /// Returns the offsets of the children of the node at `offset`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `offset` is not a node.
    pub fn subnode_offsets(&self, offset: usize) -> crate::Result<Vec<usize>> {
        let fdt = self.fdt();
        let node = fdt.node_at(offset)?;
        node.children()
            .map(|child| child.map(|child| child.offset()))
            .collect()
    }

    /// Returns copies of all properties of the node at `offset`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `offset` is not a node.
    pub fn properties(&self, offset: usize) -> crate::Result<Vec<(String, Vec<u8>)>> {
        let fdt = self.fdt();
        let node = fdt.node_at(offset)?;
        node.properties()
            .map(|prop| prop.map(|prop| (prop.name().to_owned(), prop.value().to_vec())))
            .collect()
    }

    /// Returns a copy of a single property value.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `offset` is not a node.
    pub fn property(&self, offset: usize, name: &str) -> crate::Result<Option<Vec<u8>>> {
        let fdt = self.fdt();
        let node = fdt.node_at(offset)?;
        Ok(node.property(name)?.map(|prop| prop.value().to_vec()))
    }

    /// Returns the phandle of the node at `offset`, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `offset` is not a node.
    pub fn phandle(&self, offset: usize) -> crate::Result<Option<u32>> {
        let fdt = self.fdt();
        fdt.node_at(offset)?.phandle()
    }

    /// Finds the node carrying `phandle`.
    ///
    /// # Errors
    ///
    /// Returns an error if the structure block cannot be parsed.
    pub fn node_offset_by_phandle(&self, phandle: u32) -> crate::Result<Option<usize>> {
        if phandle == 0 || phandle == u32::MAX {
            return Ok(None);
        }
        let fdt = self.fdt();
        let mut found = None;
        let mut error = None;
        self.walk(|offset, _| match fdt.node_at(offset).and_then(|n| n.phandle()) {
            Ok(Some(value)) if value == phandle => {
                found = Some(offset);
                false
            }
            Ok(_) => true,
            Err(e) => {
                error = Some(e);
                false
            }
        })?;
        match error {
            Some(e) => Err(e),
            None => Ok(found),
        }
    }

    /// Returns the offset of the parent of the node at `offset`, or `None`
    /// for the root.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `offset` is not a node.
    pub fn parent_offset(&self, offset: usize) -> crate::Result<Option<usize>> {
        self.fdt().node_at(offset)?;
        let mut parent = None;
        self.walk(|node, node_parent| {
            if node == offset {
                parent = node_parent;
                false
            } else {
                true
            }
        })?;
        Ok(parent)
    }

    /// Sets a property, replacing its value in place or appending it after
    /// the node's existing properties.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NoSpace`] if the blob has no room for the new
    /// value, or [`FdtErrorKind::BadOffset`] if `offset` is not a node.
    pub fn set_property(&mut self, offset: usize, name: &str, value: &[u8]) -> crate::Result<()> {
        if name.is_empty() || name.contains('\0') {
            return Err(FdtError::new(FdtErrorKind::BadPath, offset));
        }
        let len = to_u32(value.len())?;
        let padded = padded(value);

        if let Some((tag, old_len)) = self.locate_property(offset, name)? {
            self.splice(tag + PROP_HEADER_SIZE, Fdt::align_tag_offset(old_len), &padded)?;
            self.write_u32(tag + FDT_TAGSIZE, len);
            return Ok(());
        }

        let name_offset = self.find_string(name);
        let needed = PROP_HEADER_SIZE
            + padded.len()
            + if name_offset.is_none() { name.len() + 1 } else { 0 };
        if needed > self.free_space() {
            return Err(FdtError::new(FdtErrorKind::NoSpace, offset));
        }
        let insert_at = self.fdt().node_properties_end(offset)?;
        let name_offset = match name_offset {
            Some(name_offset) => name_offset,
            None => self.append_string(name)?,
        };

        let mut record = Vec::with_capacity(PROP_HEADER_SIZE + padded.len());
        record.extend_from_slice(&FDT_PROP.to_be_bytes());
        record.extend_from_slice(&len.to_be_bytes());
        record.extend_from_slice(&to_u32(name_offset)?.to_be_bytes());
        record.extend_from_slice(&padded);
        self.splice(insert_at, 0, &record)
    }

    /// Removes a property from the node at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] if the node has no such property.
    pub fn delete_property(&mut self, offset: usize, name: &str) -> crate::Result<()> {
        let Some((tag, len)) = self.locate_property(offset, name)? else {
            return Err(FdtError::new(FdtErrorKind::NotFound, offset));
        };
        self.splice(tag, PROP_HEADER_SIZE + Fdt::align_tag_offset(len), &[])
    }

    /// Appends an empty child named `name` to the node at `parent` and
    /// returns the new node's offset.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::Exists`] if the parent already has a child of
    /// that name, or [`FdtErrorKind::NoSpace`] if the blob is full.
    pub fn add_subnode(&mut self, parent: usize, name: &str) -> crate::Result<usize> {
        check_node_name(name, parent)?;
        let end = {
            let fdt = self.fdt();
            let node = fdt.node_at(parent)?;
            if node.child(name)?.is_some() {
                return Err(FdtError::new(FdtErrorKind::Exists, parent));
            }
            fdt.next_sibling_offset(parent)? - FDT_TAGSIZE
        };

        let mut record = Vec::with_capacity(2 * FDT_TAGSIZE + name.len() + 4);
        record.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        record.extend_from_slice(&padded_name(name));
        record.extend_from_slice(&FDT_END_NODE.to_be_bytes());
        self.splice(end, 0, &record)?;
        Ok(end)
    }

    /// Removes the node at `offset` together with its subtree.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `offset` is not a node or is the
    /// root.
    pub fn delete_node(&mut self, offset: usize) -> crate::Result<()> {
        if offset == self.root_offset() {
            return Err(FdtError::new(FdtErrorKind::BadOffset, offset));
        }
        let end = {
            let fdt = self.fdt();
            fdt.node_at(offset)?;
            fdt.next_sibling_offset(offset)?
        };
        self.splice(offset, end - offset, &[])
    }

    /// Renames the node at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::Exists`] if a sibling already has that name,
    /// or [`FdtErrorKind::NoSpace`] if a longer name does not fit.
    pub fn set_name(&mut self, offset: usize, name: &str) -> crate::Result<()> {
        check_node_name(name, offset)?;
        let old_len = {
            let fdt = self.fdt();
            let node = fdt.node_at(offset)?;
            if node.name()? == name {
                return Ok(());
            }
            fdt.node_body_offset(offset)? - (offset + FDT_TAGSIZE)
        };
        if let Some(parent) = self.parent_offset(offset)? {
            let fdt = self.fdt();
            if fdt.node_at(parent)?.child(name)?.is_some() {
                return Err(FdtError::new(FdtErrorKind::Exists, offset));
            }
        }
        self.splice(offset + FDT_TAGSIZE, old_len, &padded_name(name))
    }

    fn header(&self) -> &FdtHeader {
        match FdtHeader::ref_from_prefix(&self.data) {
            Ok((header, _)) => header,
            Err(_) => unreachable!("FdtBlob always holds a complete header"),
        }
    }

    fn header_mut(&mut self) -> &mut FdtHeader {
        match FdtHeader::mut_from_prefix(&mut self.data) {
            Ok((header, _)) => header,
            Err(_) => unreachable!("FdtBlob always holds a complete header"),
        }
    }

    /// End of the strings block, which is the last block in use.
    fn used(&self) -> usize {
        let header = self.header();
        header.off_dt_strings() as usize + header.size_dt_strings() as usize
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + FDT_TAGSIZE].copy_from_slice(&value.to_be_bytes());
    }

    /// Returns the tag offset and value length of property `name`.
    fn locate_property(&self, offset: usize, name: &str) -> crate::Result<Option<(usize, usize)>> {
        let fdt = self.fdt();
        let node = fdt.node_at(offset)?;
        Ok(node
            .property(name)?
            .map(|prop| (prop.offset(), prop.value().len())))
    }

    fn find_string(&self, name: &str) -> Option<usize> {
        let header = self.header();
        let start = header.off_dt_strings() as usize;
        let strings = self
            .data
            .get(start..start + header.size_dt_strings() as usize)?;
        let mut position = 0;
        for candidate in strings.split(|&byte| byte == 0) {
            if candidate == name.as_bytes() && position + candidate.len() < strings.len() {
                return Some(position);
            }
            position += candidate.len() + 1;
        }
        None
    }

    fn append_string(&mut self, name: &str) -> crate::Result<usize> {
        let end = self.used();
        let needed = name.len() + 1;
        if end + needed > self.data.len() {
            return Err(FdtError::new(FdtErrorKind::NoSpace, end));
        }
        self.data[end..end + name.len()].copy_from_slice(name.as_bytes());
        self.data[end + name.len()] = 0;
        let header = self.header_mut();
        let offset = header.size_dt_strings() as usize;
        header.size_dt_strings.set(to_u32(offset + needed)?);
        Ok(offset)
    }

    /// Replaces `remove` bytes of the structure block at `at` with `insert`.
    fn splice(&mut self, at: usize, remove: usize, insert: &[u8]) -> crate::Result<()> {
        let end = self.used();
        let new_end = end + insert.len() - remove;
        if new_end > self.data.len() {
            return Err(FdtError::new(FdtErrorKind::NoSpace, at));
        }
        self.data.copy_within(at + remove..end, at + insert.len());
        self.data[at..at + insert.len()].copy_from_slice(insert);
        if new_end < end {
            self.data[new_end..end].fill(0);
        }

        let header = self.header_mut();
        let size_dt_struct = header.size_dt_struct() as usize + insert.len() - remove;
        let off_dt_strings = header.off_dt_strings() as usize + insert.len() - remove;
        header.size_dt_struct.set(to_u32(size_dt_struct)?);
        header.off_dt_strings.set(to_u32(off_dt_strings)?);
        Ok(())
    }

    /// Visits every node in document order with its parent's offset. The
    /// walk stops early when `visit` returns `false`.
    fn walk(&self, mut visit: impl FnMut(usize, Option<usize>) -> bool) -> crate::Result<()> {
        let fdt = self.fdt();
        let mut offset = self.root_offset();
        let mut stack: Vec<usize> = Vec::new();
        loop {
            match fdt.read_token(offset)? {
                FdtToken::BeginNode => {
                    if !visit(offset, stack.last().copied()) {
                        return Ok(());
                    }
                    stack.push(offset);
                    offset = fdt.node_body_offset(offset)?;
                }
                FdtToken::EndNode => {
                    stack.pop();
                    offset += FDT_TAGSIZE;
                    if stack.is_empty() {
                        return Ok(());
                    }
                }
                FdtToken::Prop => offset = fdt.next_property_offset(offset + FDT_TAGSIZE)?,
                FdtToken::Nop => offset += FDT_TAGSIZE,
                FdtToken::End => return Ok(()),
            }
        }
    }
}

fn check_node_name(name: &str, offset: usize) -> crate::Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(FdtError::new(FdtErrorKind::BadPath, offset));
    }
    Ok(())
}

fn to_u32(value: usize) -> crate::Result<u32> {
    u32::try_from(value).map_err(|_| FdtError::new(FdtErrorKind::NoSpace, value))
}

fn padded(value: &[u8]) -> Vec<u8> {
    let mut padded = value.to_vec();
    padded.resize(Fdt::align_tag_offset(value.len()), 0);
    padded
}

fn padded_name(name: &str) -> Vec<u8> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    bytes.resize(Fdt::align_tag_offset(bytes.len()), 0);
    bytes
}
