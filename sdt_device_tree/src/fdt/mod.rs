// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A read-only API for parsing and traversing a [Flattened Device Tree (FDT)],
//! plus an editable, fixed-capacity blob built on top of it.
//!
//! [`Fdt`] performs no memory allocation and provides a zero-copy view of the
//! FDT data. [`FdtBlob`] (with the `alloc` feature) owns a copy of the blob
//! and edits it in place.
//!
//! [Flattened Device Tree (FDT)]: https://devicetree-specification.readthedocs.io/en/latest/chapter5-flattened-format.html

use core::ffi::CStr;

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::big_endian;

use crate::error::{FdtError, FdtErrorKind};
use crate::memreserve::MemoryReservation;

mod node;
mod property;
#[cfg(feature = "alloc")]
mod rw;

pub use node::FdtNode;
pub use property::FdtProperty;
#[cfg(feature = "alloc")]
pub use rw::FdtBlob;

/// Version of the FDT specification supported by this library.
pub(crate) const FDT_VERSION: u32 = 17;
pub(crate) const FDT_LAST_COMP_VERSION: u32 = 16;
pub(crate) const FDT_TAGSIZE: usize = core::mem::size_of::<u32>();
pub(crate) const FDT_MAGIC: u32 = 0xd00d_feed;
pub(crate) const FDT_BEGIN_NODE: u32 = 0x1;
pub(crate) const FDT_END_NODE: u32 = 0x2;
pub(crate) const FDT_PROP: u32 = 0x3;
pub(crate) const FDT_NOP: u32 = 0x4;
pub(crate) const FDT_END: u32 = 0x9;
pub(crate) const FDT_RSV_ENTRY_SIZE: usize = 2 * core::mem::size_of::<u64>();

#[repr(C, packed)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub(crate) struct FdtHeader {
    /// Magic number of the device tree.
    pub(crate) magic: big_endian::U32,
    /// Total size of the device tree.
    pub(crate) totalsize: big_endian::U32,
    /// Offset of the device tree structure.
    pub(crate) off_dt_struct: big_endian::U32,
    /// Offset of the device tree strings.
    pub(crate) off_dt_strings: big_endian::U32,
    /// Offset of the memory reservation map.
    pub(crate) off_mem_rsvmap: big_endian::U32,
    /// Version of the device tree.
    pub(crate) version: big_endian::U32,
    /// Last compatible version of the device tree.
    pub(crate) last_comp_version: big_endian::U32,
    /// Physical ID of the boot CPU.
    pub(crate) boot_cpuid_phys: big_endian::U32,
    /// Size of the device tree strings.
    pub(crate) size_dt_strings: big_endian::U32,
    /// Size of the device tree structure.
    pub(crate) size_dt_struct: big_endian::U32,
}

impl FdtHeader {
    pub(crate) fn magic(&self) -> u32 {
        self.magic.get()
    }

    pub(crate) fn totalsize(&self) -> u32 {
        self.totalsize.get()
    }

    pub(crate) fn off_dt_struct(&self) -> u32 {
        self.off_dt_struct.get()
    }

    pub(crate) fn off_dt_strings(&self) -> u32 {
        self.off_dt_strings.get()
    }

    pub(crate) fn off_mem_rsvmap(&self) -> u32 {
        self.off_mem_rsvmap.get()
    }

    pub(crate) fn version(&self) -> u32 {
        self.version.get()
    }

    pub(crate) fn last_comp_version(&self) -> u32 {
        self.last_comp_version.get()
    }

    pub(crate) fn boot_cpuid_phys(&self) -> u32 {
        self.boot_cpuid_phys.get()
    }

    pub(crate) fn size_dt_strings(&self) -> u32 {
        self.size_dt_strings.get()
    }

    pub(crate) fn size_dt_struct(&self) -> u32 {
        self.size_dt_struct.get()
    }
}

/// A flattened device tree.
#[derive(Debug, Clone, Copy)]
pub struct Fdt<'a> {
    pub(crate) data: &'a [u8],
}

/// A token in the device tree structure.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FdtToken {
    BeginNode,
    EndNode,
    Prop,
    Nop,
    End,
}

impl TryFrom<u32> for FdtToken {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            FDT_BEGIN_NODE => Ok(FdtToken::BeginNode),
            FDT_END_NODE => Ok(FdtToken::EndNode),
            FDT_PROP => Ok(FdtToken::Prop),
            FDT_NOP => Ok(FdtToken::Nop),
            FDT_END => Ok(FdtToken::End),
            _ => Err(value),
        }
    }
}

impl<'a> Fdt<'a> {
    /// Creates a new `Fdt` from the given byte slice.
    ///
    /// The slice must be exactly `totalsize` bytes long.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is truncated, the magic number is
    /// wrong, the version is unsupported or the slice length does not match
    /// the header.
    pub fn new(data: &'a [u8]) -> Result<Self, FdtError> {
        if data.len() < core::mem::size_of::<FdtHeader>() {
            return Err(FdtError::new(FdtErrorKind::InvalidLength, 0));
        }

        let fdt = Fdt { data };
        let header = fdt.header();

        if header.magic() != FDT_MAGIC {
            return Err(FdtError::new(FdtErrorKind::InvalidMagic, 0));
        }
        if !(header.last_comp_version()..=header.version()).contains(&FDT_VERSION) {
            return Err(FdtError::new(
                FdtErrorKind::UnsupportedVersion(header.version()),
                20,
            ));
        }

        if header.totalsize() as usize != data.len() {
            return Err(FdtError::new(FdtErrorKind::InvalidLength, 4));
        }
        let struct_end = header.off_dt_struct() as usize + header.size_dt_struct() as usize;
        let strings_end = header.off_dt_strings() as usize + header.size_dt_strings() as usize;
        if struct_end > data.len() || strings_end > data.len() {
            return Err(FdtError::new(FdtErrorKind::InvalidLength, 8));
        }

        Ok(fdt)
    }

    /// Returns the header of the device tree.
    pub(crate) fn header(&self) -> &FdtHeader {
        // `new()` checks that the slice is at least as big as the header, so
        // the fallback is never taken for a constructed `Fdt`.
        match FdtHeader::ref_from_prefix(self.data) {
            Ok((header, _remaining_bytes)) => header,
            Err(_) => unreachable!("Fdt::new() validates the header length"),
        }
    }

    /// Returns the raw bytes of the blob.
    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the physical id of the boot CPU.
    #[must_use]
    pub fn boot_cpuid_phys(&self) -> u32 {
        self.header().boot_cpuid_phys()
    }

    /// Returns the root node of the device tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the structure block does not start with a node.
    pub fn root(&self) -> Result<FdtNode<'_>, FdtError> {
        let offset = self.header().off_dt_struct() as usize;
        self.node_at(offset)
    }

    /// Returns the node whose `FDT_BEGIN_NODE` tag is at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `offset` does not point at a
    /// node.
    pub fn node_at(&self, offset: usize) -> Result<FdtNode<'_>, FdtError> {
        let header = self.header();
        let start = header.off_dt_struct() as usize;
        let end = start + header.size_dt_struct() as usize;
        if offset < start || offset >= end || offset % FDT_TAGSIZE != 0 {
            return Err(FdtError::new(FdtErrorKind::BadOffset, offset));
        }
        match self.read_token(offset)? {
            FdtToken::BeginNode => Ok(FdtNode { fdt: self, offset }),
            _ => Err(FdtError::new(FdtErrorKind::BadOffset, offset)),
        }
    }

    /// Finds a node by its path.
    ///
    /// Returns `None` if the path is relative or if any component is missing.
    ///
    /// # Performance
    ///
    /// This method traverses the device tree and its performance is linear in
    /// the number of nodes visited along the path.
    pub fn find_node(&self, path: &str) -> Option<Result<FdtNode<'_>, FdtError>> {
        if !path.starts_with('/') {
            return None;
        }
        let mut current_node = match self.root() {
            Ok(node) => node,
            Err(e) => return Some(Err(e)),
        };
        for component in path.split('/').filter(|s| !s.is_empty()) {
            match current_node.child(component) {
                Ok(Some(node)) => current_node = node,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(current_node))
    }

    /// Returns an iterator over the memory reservation block.
    pub fn memory_reservations(&self) -> impl Iterator<Item = MemoryReservation> + use<'a> {
        let data = self.data;
        let mut offset = self.header().off_mem_rsvmap() as usize;
        core::iter::from_fn(move || {
            let (address, rest) = big_endian::U64::read_from_prefix(data.get(offset..)?).ok()?;
            let (size, _) = big_endian::U64::read_from_prefix(rest).ok()?;
            let (address, size) = (address.get(), size.get());
            if address == 0 && size == 0 {
                return None;
            }
            offset += FDT_RSV_ENTRY_SIZE;
            Some(MemoryReservation::new(address, size))
        })
    }

    pub(crate) fn read_u32(&self, offset: usize) -> Result<u32, FdtError> {
        self.data
            .get(offset..)
            .and_then(|bytes| big_endian::U32::ref_from_prefix(bytes).ok())
            .map(|(val, _)| val.get())
            .ok_or(FdtError::new(FdtErrorKind::InvalidLength, offset))
    }

    pub(crate) fn read_token(&self, offset: usize) -> Result<FdtToken, FdtError> {
        let val = self.read_u32(offset)?;
        FdtToken::try_from(val).map_err(|t| FdtError::new(FdtErrorKind::BadToken(t), offset))
    }

    /// Return a string from the string block.
    pub(crate) fn string(&self, string_block_offset: usize) -> Result<&'a str, FdtError> {
        let header = self.header();
        let strings_start = header.off_dt_strings() as usize;
        let strings_size = header.size_dt_strings() as usize;
        let strings_end = strings_start + strings_size;
        let string_start = strings_start + string_block_offset;

        if string_start >= strings_end {
            return Err(FdtError::new(FdtErrorKind::InvalidLength, string_start));
        }

        self.string_at_offset(string_start, Some(strings_end))
    }

    /// Return a NUL-terminated string from a given offset.
    pub(crate) fn string_at_offset(
        &self,
        offset: usize,
        end: Option<usize>,
    ) -> Result<&'a str, FdtError> {
        let slice = match end {
            Some(end) => self.data.get(offset..end),
            None => self.data.get(offset..),
        }
        .ok_or(FdtError::new(FdtErrorKind::InvalidString, offset))?;

        match CStr::from_bytes_until_nul(slice).map(CStr::to_str) {
            Ok(Ok(val)) => Ok(val),
            _ => Err(FdtError::new(FdtErrorKind::InvalidString, offset)),
        }
    }

    pub(crate) fn find_string_end(&self, start: usize) -> Result<usize, FdtError> {
        let mut offset = start;
        loop {
            match self.data.get(offset) {
                Some(0) => return Ok(offset + 1),
                Some(_) => {}
                None => return Err(FdtError::new(FdtErrorKind::InvalidString, start)),
            }
            offset += 1;
        }
    }

    /// Returns the offset of the first token after the name of the node at
    /// `offset`.
    pub(crate) fn node_body_offset(&self, offset: usize) -> crate::Result<usize> {
        let offset = self.find_string_end(offset + FDT_TAGSIZE)?;
        Ok(Self::align_tag_offset(offset))
    }

    /// Returns the offset of the first token after the properties of the node
    /// at `offset`, i.e. of its first child or of its `FDT_END_NODE`.
    pub(crate) fn node_properties_end(&self, offset: usize) -> crate::Result<usize> {
        let mut offset = self.node_body_offset(offset)?;
        loop {
            match self.read_token(offset)? {
                FdtToken::Prop => offset = self.next_property_offset(offset + FDT_TAGSIZE)?,
                FdtToken::Nop => offset += FDT_TAGSIZE,
                _ => return Ok(offset),
            }
        }
    }

    pub(crate) fn next_sibling_offset(&self, offset: usize) -> crate::Result<usize> {
        let mut offset = self.node_properties_end(offset)?;

        loop {
            match self.read_token(offset)? {
                FdtToken::BeginNode => offset = self.next_sibling_offset(offset)?,
                FdtToken::EndNode => return Ok(offset + FDT_TAGSIZE),
                FdtToken::Nop => offset += FDT_TAGSIZE,
                token => {
                    return Err(FdtError::new(
                        FdtErrorKind::BadToken(token_value(&token)),
                        offset,
                    ));
                }
            }
        }
    }

    pub(crate) fn next_property_offset(&self, mut offset: usize) -> crate::Result<usize> {
        let len = self.read_u32(offset)? as usize;
        offset += FDT_TAGSIZE; // skip value length
        offset += FDT_TAGSIZE; // skip name offset
        offset += len; // skip property value

        Ok(Self::align_tag_offset(offset))
    }

    pub(crate) fn align_tag_offset(offset: usize) -> usize {
        offset.next_multiple_of(FDT_TAGSIZE)
    }
}

fn token_value(token: &FdtToken) -> u32 {
    match token {
        FdtToken::BeginNode => FDT_BEGIN_NODE,
        FdtToken::EndNode => FDT_END_NODE,
        FdtToken::Prop => FDT_PROP,
        FdtToken::Nop => FDT_NOP,
        FdtToken::End => FDT_END,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FdtErrorKind;

    const FDT_HEADER_OK: &[u8] = &[
        0xd0, 0x0d, 0xfe, 0xed, // magic
        0x00, 0x00, 0x00, 0x48, // totalsize = 72
        0x00, 0x00, 0x00, 0x38, // off_dt_struct = 56
        0x00, 0x00, 0x00, 0x48, // off_dt_strings = 72
        0x00, 0x00, 0x00, 0x28, // off_mem_rsvmap = 40
        0x00, 0x00, 0x00, 0x11, // version = 17
        0x00, 0x00, 0x00, 0x10, // last_comp_version = 16
        0x00, 0x00, 0x00, 0x00, // boot_cpuid_phys = 0
        0x00, 0x00, 0x00, 0x00, // size_dt_strings = 0
        0x00, 0x00, 0x00, 0x10, // size_dt_struct = 16
        0x00, 0x00, 0x00, 0x00, // memory reservation
        0x00, 0x00, 0x00, 0x00, // ...
        0x00, 0x00, 0x00, 0x00, // ...
        0x00, 0x00, 0x00, 0x00, // ...
        0x00, 0x00, 0x00, 0x01, // FDT_BEGIN_NODE
        0x00, 0x00, 0x00, 0x00, // "" (root)
        0x00, 0x00, 0x00, 0x02, // FDT_END_NODE
        0x00, 0x00, 0x00, 0x09, // FDT_END
    ];

    #[test]
    fn header_is_parsed_correctly() {
        let fdt = Fdt::new(FDT_HEADER_OK).unwrap();
        let header = fdt.header();

        assert_eq!(header.totalsize(), 72);
        assert_eq!(header.off_dt_struct(), 56);
        assert_eq!(header.off_dt_strings(), 72);
        assert_eq!(header.off_mem_rsvmap(), 40);
        assert_eq!(header.version(), 17);
        assert_eq!(header.last_comp_version(), 16);
        assert_eq!(header.boot_cpuid_phys(), 0);
        assert_eq!(header.size_dt_strings(), 0);
        assert_eq!(header.size_dt_struct(), 16);
    }

    #[test]
    fn empty_root() {
        let fdt = Fdt::new(FDT_HEADER_OK).unwrap();
        let root = fdt.root().unwrap();
        assert_eq!(root.name().unwrap(), "");
        assert_eq!(root.properties().count(), 0);
        assert_eq!(root.children().count(), 0);
        assert!(fdt.find_node("/").is_some());
        assert!(fdt.find_node("/missing").is_none());
        assert_eq!(fdt.memory_reservations().count(), 0);
    }

    #[test]
    fn node_at_rejects_non_node_offsets() {
        let fdt = Fdt::new(FDT_HEADER_OK).unwrap();
        assert!(fdt.node_at(56).is_ok());
        let err = fdt.node_at(64).unwrap_err();
        assert_eq!(err.kind, FdtErrorKind::BadOffset);
        assert_eq!(fdt.node_at(57).unwrap_err().kind, FdtErrorKind::BadOffset);
    }

    #[test]
    fn invalid_magic() {
        let mut header = FDT_HEADER_OK.to_vec();
        header[0] = 0x00;
        let result = Fdt::new(&header);
        assert!(matches!(result, Err(e) if matches!(e.kind, FdtErrorKind::InvalidMagic)));
    }

    #[test]
    fn invalid_length() {
        let header = &FDT_HEADER_OK[..10];
        let result = Fdt::new(header);
        assert!(matches!(result, Err(e) if matches!(e.kind, FdtErrorKind::InvalidLength)));
    }

    #[test]
    fn unsupported_version() {
        let mut header = FDT_HEADER_OK.to_vec();
        header[23] = 0x10;
        let result = Fdt::new(&header);
        assert!(
            matches!(result, Err(e) if matches!(e.kind, FdtErrorKind::UnsupportedVersion(16)))
        );
    }
}
