// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! Cross-reference resolution and reference counting.

use std::collections::HashSet;

use log::warn;
use regex::Regex;

use super::node::{Node, NodeKey, NodeState};
use super::Tree;
use crate::OrderedMap;
use crate::error::{Error, Result};
use crate::phandle::{CellContext, Record};

/// Cell counts as seen from one node of a tree.
#[derive(Debug, Clone, Copy)]
pub struct NodeCells<'t> {
    nodes: &'t [Node],
    by_phandle: &'t OrderedMap<NodeKey, u32>,
    key: NodeKey,
}

impl NodeCells<'_> {
    fn first(&self, key: NodeKey, property: &str) -> Option<u64> {
        self.nodes.get(key.0)?.property(property)?.u64()
    }
}

impl CellContext for NodeCells<'_> {
    fn own_count(&self, property: &str) -> Option<u64> {
        self.first(self.key, property)
    }

    fn parent_count(&self, property: &str) -> Option<u64> {
        let parent = self.nodes.get(self.key.0)?.parent?;
        self.first(parent, property)
    }

    fn target_count(&self, phandle: u64, property: &str) -> Option<u64> {
        let phandle = u32::try_from(phandle).ok()?;
        let target = *self.by_phandle.get(&phandle)?;
        self.first(target, property)
    }
}

/// One record of a reference-bearing property, with its targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecord {
    /// Where the record sits in the value.
    pub record: Record,
    /// For each reference cell: its index and the node it names. A zero cell
    /// names no node.
    pub targets: Vec<(usize, Option<NodeKey>)>,
    /// Set if a non-zero reference cell names no node.
    pub dangling: bool,
}

impl Tree<'_> {
    /// Returns the cell-count context of a node.
    #[must_use]
    pub fn cells(&self, key: NodeKey) -> NodeCells<'_> {
        NodeCells {
            nodes: &self.nodes,
            by_phandle: &self.by_phandle,
            key,
        }
    }

    /// Splits a reference-bearing property into records and resolves each
    /// reference cell. Returns `None` if the property carries no
    /// references.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidReference`] for a dangling reference when
    /// [`Config::strict_phandles`](crate::Config) is set. Otherwise dangling
    /// references are logged and flagged on their record.
    pub fn reference_records(&self, key: NodeKey, name: &str) -> Result<Option<Vec<ResolvedRecord>>> {
        let Some(node) = self.node(key) else {
            return Ok(None);
        };
        let Some(values) = node.get_property(name) else {
            return Ok(None);
        };
        let Some(records) = self
            .registries
            .phandles
            .records(name, values, &self.cells(key))
        else {
            return Ok(None);
        };

        let mut resolved = Vec::with_capacity(records.len());
        for record in records {
            let mut targets = Vec::with_capacity(record.phandles.len());
            let mut dangling = false;
            for &index in &record.phandles {
                let phandle = values.get(index).and_then(|value| value.as_u64()).unwrap_or(0);
                let target = u32::try_from(phandle)
                    .ok()
                    .and_then(|phandle| self.node_by_phandle(phandle));
                if target.is_none() && phandle != 0 {
                    if self.config.strict_phandles {
                        return Err(Error::InvalidReference {
                            path: node.path.clone(),
                            property: name.to_owned(),
                            phandle,
                        });
                    }
                    warn!("{}: {name} references unknown phandle {phandle:#x}", node.path);
                    dangling = true;
                }
                targets.push((index, target));
            }
            resolved.push(ResolvedRecord {
                record,
                targets,
                dangling,
            });
        }
        Ok(Some(resolved))
    }

    /// Returns the nodes a node references, in property order, without
    /// duplicates. Properties whose name matches any of `mask` are skipped.
    ///
    /// # Errors
    ///
    /// As for [`Tree::reference_records`].
    pub fn references_masked(&self, key: NodeKey, mask: &[Regex]) -> Result<Vec<NodeKey>> {
        let Some(node) = self.node(key) else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        for property in node.properties() {
            if mask.iter().any(|pattern| pattern.is_match(property.name())) {
                continue;
            }
            let Some(records) = self.reference_records(key, property.name())? else {
                continue;
            };
            for (_, target) in records.iter().flat_map(|record| &record.targets) {
                if let Some(target) = *target {
                    if !found.contains(&target) {
                        found.push(target);
                    }
                }
            }
        }
        Ok(found)
    }

    /// Returns the nodes a node references.
    ///
    /// # Errors
    ///
    /// As for [`Tree::reference_records`].
    pub fn references(&self, key: NodeKey) -> Result<Vec<NodeKey>> {
        self.references_masked(key, &[])
    }

    /// Returns `key`, then (with `parents`) its ancestors, then every node
    /// reachable from it through references, transitively. With `parents`,
    /// the ancestors of reached nodes are included too.
    ///
    /// # Errors
    ///
    /// As for [`Tree::reference_records`].
    pub fn resolve_all_refs(&self, key: NodeKey, mask: &[Regex], parents: bool) -> Result<Vec<NodeKey>> {
        self.reach(&[key], mask, parents)
    }

    fn reach(&self, start: &[NodeKey], mask: &[Regex], parents: bool) -> Result<Vec<NodeKey>> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        for &key in start {
            if visited.insert(key) {
                order.push(key);
            }
        }
        // Ancestors are counted but their references are not followed.
        let mut expanded: HashSet<NodeKey> = order.iter().copied().collect();
        let mut pending = order.clone();
        let mut next = 0;

        while next < pending.len() {
            let key = pending[next];
            next += 1;
            if parents {
                for ancestor in self.ancestors(key) {
                    if visited.insert(ancestor) {
                        order.push(ancestor);
                    }
                }
            }
            for target in self.references_masked(key, mask)? {
                if visited.insert(target) {
                    order.push(target);
                }
                if expanded.insert(target) {
                    pending.push(target);
                }
            }
        }
        Ok(order)
    }

    fn ancestors(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut ancestors = Vec::new();
        let mut current = self.node(key).and_then(Node::parent);
        while let Some(parent) = current {
            ancestors.push(parent);
            current = self.node(parent).and_then(Node::parent);
        }
        ancestors
    }

    /// Counts one reference on `start`, its descendants, every node they
    /// reach through references, and (with `parent_nodes`) the ancestors of
    /// all of those. Each node is counted once per call. Returns the number
    /// of nodes counted.
    ///
    /// # Errors
    ///
    /// As for [`Tree::reference_records`].
    pub fn ref_all(&mut self, start: NodeKey, parent_nodes: bool) -> Result<usize> {
        self.ref_all_masked(start, parent_nodes, &[])
    }

    /// Like [`Tree::ref_all`], skipping properties whose name matches any of
    /// `mask`.
    ///
    /// # Errors
    ///
    /// As for [`Tree::reference_records`].
    pub fn ref_all_masked(
        &mut self,
        start: NodeKey,
        parent_nodes: bool,
        mask: &[Regex],
    ) -> Result<usize> {
        let reached = self.reach(&self.subnodes(start), mask, parent_nodes)?;
        for &key in &reached {
            self.nodes[key.0].ref_count += 1;
        }
        Ok(reached.len())
    }

    /// Sets the reference count of every live node whose path matches
    /// `pattern` (or of all live nodes): `0` clears it, anything else is
    /// added to it.
    pub fn set_ref(&mut self, value: usize, pattern: Option<&Regex>) {
        for node in &mut self.nodes {
            let matches = node.state == NodeState::Resolved
                && pattern.is_none_or(|pattern| pattern.is_match(&node.path));
            if !matches {
                continue;
            }
            if value == 0 {
                node.ref_count = 0;
            } else {
                node.ref_count += value;
            }
        }
    }

    /// Returns the live nodes with a non-zero reference count whose path
    /// matches `pattern`, in depth-first order.
    #[must_use]
    pub fn referenced(&self, pattern: Option<&Regex>) -> Vec<NodeKey> {
        self.nodes()
            .filter(|node| node.ref_count > 0)
            .filter(|node| pattern.is_none_or(|pattern| pattern.is_match(&node.path)))
            .map(Node::key)
            .collect()
    }

    /// Returns the reference count of a node.
    #[must_use]
    pub fn ref_count(&self, key: NodeKey) -> usize {
        self.node(key).map_or(0, Node::ref_count)
    }
}
