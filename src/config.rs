// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Engine options.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default number of attempts for a write that runs out of space.
pub const DEFAULT_MAX_CAPACITY_RETRIES: usize = 10;
/// Default number of bytes a binary backend grows by per resize.
pub const DEFAULT_GROW_STEP: usize = 1024;

/// Options that control how a [`Tree`](crate::tree::Tree) treats its
/// backend and its references.
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// let config: sdt::Config = serde_json::from_str(r#"{"strict_phandles": true}"#).unwrap();
/// assert!(config.strict_phandles);
/// assert_eq!(config.max_capacity_retries, sdt::config::DEFAULT_MAX_CAPACITY_RETRIES);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Turn unresolvable cross-references into errors instead of warnings.
    pub strict_phandles: bool,
    /// Attempts made for a rename, write or add that runs out of space.
    pub max_capacity_retries: usize,
    /// Bytes added to a binary backend on every resize.
    pub grow_step: usize,
    /// Regular expressions; comments matching any of them are dropped when
    /// source text is annotated.
    pub comment_droplist: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strict_phandles: false,
            max_capacity_retries: DEFAULT_MAX_CAPACITY_RETRIES,
            grow_step: DEFAULT_GROW_STEP,
            comment_droplist: Vec::new(),
        }
    }
}

impl Config {
    /// Compiles [`Config::comment_droplist`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pattern`](crate::Error::Pattern) if an entry is not a
    /// valid regular expression.
    pub fn comment_droplist_patterns(&self) -> Result<Vec<Regex>> {
        self.comment_droplist
            .iter()
            .map(|pattern| Regex::new(pattern).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_droplist_pattern_is_reported() {
        let config = Config {
            comment_droplist: vec!["(".to_owned()],
            ..Config::default()
        };
        assert!(config.comment_droplist_patterns().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config {
            strict_phandles: true,
            grow_step: 64,
            ..Config::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<Config>(&text).unwrap(), config);
    }
}
