// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::fdt::FdtProperty;

/// An owned device tree property: a name and its raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTreeProperty {
    name: String,
    value: Vec<u8>,
}

impl DeviceTreeProperty {
    /// Creates a new `DeviceTreeProperty` with the given name and value.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sdt_device_tree::model::DeviceTreeProperty;
    /// let prop = DeviceTreeProperty::new("my-prop", vec![1, 2, 3, 4]);
    /// assert_eq!(prop.name(), "my-prop");
    /// assert_eq!(prop.value(), &[1, 2, 3, 4]);
    /// ```
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Returns the name of this property.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value of this property.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Sets the value of this property.
    pub fn set_value(&mut self, value: impl Into<Vec<u8>>) {
        self.value = value.into();
    }

    /// Returns the value as a single big-endian `u32`, if it is 4 bytes long.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sdt_device_tree::model::DeviceTreeProperty;
    /// let prop = DeviceTreeProperty::new("my-prop", 1234u32.to_be_bytes());
    /// assert_eq!(prop.as_u32(), Some(1234));
    /// ```
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        self.value.as_slice().try_into().ok().map(u32::from_be_bytes)
    }

    /// Returns the value as a string with trailing NULs removed, if it is
    /// valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.value)
            .ok()
            .map(|s| s.trim_end_matches('\0'))
    }
}

impl<'a> From<FdtProperty<'a>> for DeviceTreeProperty {
    fn from(prop: FdtProperty<'a>) -> Self {
        DeviceTreeProperty {
            name: prop.name().to_string(),
            value: prop.value().to_vec(),
        }
    }
}
