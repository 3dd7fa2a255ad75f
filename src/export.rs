// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

//! A plain, serializable view of a tree.
//!
//! A [`GenericTree`] maps every node path to a map of property names to
//! JSON values, plus reserved `__key__` entries describing the node itself.
//! It is the shape tree data takes when it leaves the engine as JSON, YAML or
//! any other serde format.

use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::codec::{PropertyType, Value};
use crate::error::{Error, Result};
use crate::tree::{NodeKey, Tree};

/// Key holding the node path.
pub const PATH_KEY: &str = "__path__";
/// Key holding the node name.
pub const NAME_KEY: &str = "__fdt_name__";
/// Key holding the node phandle, or 0.
pub const PHANDLE_KEY: &str = "__fdt_phandle__";
/// Key holding the backend node id, or -1.
pub const NUMBER_KEY: &str = "__fdt_number__";
/// Key holding the node label.
pub const LABEL_KEY: &str = "__label__";

/// Returns the key that holds the type of property `name`.
#[must_use]
pub fn type_key(name: &str) -> String {
    format!("__{name}_type__")
}

fn is_reserved(key: &str) -> bool {
    key.len() > 4 && key.starts_with("__") && key.ends_with("__")
}

/// The keys of one node.
pub type GenericNode = IndexMap<String, Json>;

/// Node path to node keys, in depth-first order.
///
/// Property values are JSON: `true` is an empty property, a string or a
/// number is a one-element value, and an array is a list of strings or
/// integers. `false` or `null`, like a missing key, means the property is
/// absent.
///
/// ```
/// use sdt::backend::SourceBackend;
/// use sdt::Tree;
///
/// let backend = SourceBackend::parse("/ { uart { status = \"okay\"; reg = <0x10 4>; }; };").unwrap();
/// let tree = Tree::new(Box::new(backend)).unwrap();
/// let generic = tree.export();
///
/// let uart = generic.get("/uart").unwrap();
/// assert_eq!(uart["status"], "okay");
/// assert_eq!(uart["reg"], serde_json::json!([16, 4]));
/// assert_eq!(uart["__reg_type__"], "uint32");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenericTree {
    nodes: IndexMap<String, GenericNode>,
}

impl GenericTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the node at `path`.
    pub fn insert(&mut self, path: impl Into<String>, node: GenericNode) {
        self.nodes.insert(path.into(), node);
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&GenericNode> {
        self.nodes.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut GenericNode> {
        self.nodes.get_mut(path)
    }

    /// Removes the node at `path`, keeping the order of the others.
    pub fn remove(&mut self, path: &str) -> Option<GenericNode> {
        self.nodes.shift_remove(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &GenericNode)> {
        self.nodes.iter().map(|(path, node)| (path.as_str(), node))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Serializes the mapping as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a mapping from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if `text` is not a valid mapping.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

fn export_values(values: &[Value], ptype: PropertyType) -> Json {
    let json = |value: &Value| match value {
        Value::Int(int) => Json::from(*int),
        Value::Str(text) => Json::from(text.as_str()),
    };
    match (ptype, values) {
        (PropertyType::Empty, _) | (_, []) => Json::Bool(true),
        (PropertyType::MultiString | PropertyType::UInt8, values) => {
            Json::Array(values.iter().map(json).collect())
        }
        (_, [single]) => json(single),
        (_, values) => Json::Array(values.iter().map(json).collect()),
    }
}

/// Converts a JSON value to property values. `None` means absent.
fn import_values(path: &str, name: &str, json: &Json) -> Result<Option<Vec<Value>>> {
    let scalar = |json: &Json| match json {
        Json::String(text) => Some(Value::Str(text.clone())),
        Json::Number(number) => number.as_u64().map(Value::Int),
        _ => None,
    };
    let invalid = || Error::Import {
        path: path.to_owned(),
        message: format!("property {name} has an unsupported value {json}"),
    };
    match json {
        Json::Null | Json::Bool(false) => Ok(None),
        Json::Bool(true) => Ok(Some(Vec::new())),
        Json::Array(items) => {
            let values = items.iter().map(scalar).collect::<Option<Vec<_>>>().ok_or_else(invalid)?;
            let strings = values.iter().filter(|value| matches!(value, Value::Str(_))).count();
            if strings != 0 && strings != values.len() {
                return Err(invalid());
            }
            Ok(Some(values))
        }
        other => scalar(other).map(|value| Some(vec![value])).ok_or_else(invalid),
    }
}

impl Tree<'_> {
    /// Returns the tree as a [`GenericTree`], with local edits included.
    #[must_use]
    pub fn export(&self) -> GenericTree {
        let mut generic = GenericTree::new();
        for node in self.nodes() {
            let mut keys = GenericNode::new();
            keys.insert(PATH_KEY.to_owned(), Json::from(node.path()));
            keys.insert(NAME_KEY.to_owned(), Json::from(node.name()));
            keys.insert(PHANDLE_KEY.to_owned(), Json::from(node.phandle()));
            let number = node
                .id()
                .and_then(|id| i64::try_from(id.0).ok())
                .unwrap_or(-1);
            keys.insert(NUMBER_KEY.to_owned(), Json::from(number));
            if let Some(label) = node.label() {
                keys.insert(LABEL_KEY.to_owned(), Json::from(label));
            }
            for property in node.properties() {
                keys.insert(
                    property.name().to_owned(),
                    export_values(property.values(), property.ptype()),
                );
                keys.insert(
                    type_key(property.name()),
                    Json::from(property.ptype().as_str()),
                );
            }
            generic.insert(node.path(), keys);
        }
        generic
    }

    /// Makes the tree match `generic`, then syncs.
    ///
    /// Nodes missing from the tree are added and nodes missing from the
    /// mapping are deleted. On every node, properties are set from the
    /// mapping, typed by their `__<name>_type__` key when present, and
    /// properties the mapping does not list are deleted. `__fdt_name__` and
    /// `__fdt_number__` are not applied: the path decides the name, and ids
    /// belong to the backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Import`] for a malformed entry, or any error of the
    /// edits and the final sync.
    pub fn import(&mut self, generic: &GenericTree) -> Result<()> {
        let mut wanted: Vec<NodeKey> = Vec::with_capacity(generic.len());
        for (entry, keys) in generic.iter() {
            let path = keys.get(PATH_KEY).and_then(Json::as_str).unwrap_or(entry);
            if !path.starts_with('/') {
                return Err(Error::Import {
                    path: path.to_owned(),
                    message: "node paths must be absolute".to_owned(),
                });
            }
            let key = match self.node_by_path(path) {
                Some(key) => key,
                None => self.add_node(path)?,
            };
            self.import_node(key, path, keys)?;
            wanted.push(key);
        }

        let stale: Vec<NodeKey> = self
            .nodes()
            .map(crate::tree::Node::key)
            .filter(|key| *key != self.root() && !wanted.contains(key))
            .collect();
        let mut removed = 0;
        for key in stale {
            // Already gone with an ancestor.
            if self.node(key).is_some_and(|node| node.state() == crate::tree::NodeState::Resolved) {
                self.delete_node(key)?;
                removed += 1;
            }
        }
        debug!("imported {} nodes, removed {removed}", wanted.len());
        self.sync()
    }

    fn import_node(&mut self, key: NodeKey, path: &str, keys: &GenericNode) -> Result<()> {
        let mut present = Vec::new();
        for (name, json) in keys.iter().filter(|(name, _)| !is_reserved(name)) {
            let Some(values) = import_values(path, name, json)? else {
                continue;
            };
            let ptype = match keys.get(&type_key(name)).and_then(Json::as_str) {
                Some(ptype) => Some(ptype.parse::<PropertyType>().map_err(|e| Error::Import {
                    path: path.to_owned(),
                    message: format!("property {name}: {e}"),
                })?),
                None => None,
            };
            match ptype {
                _ if values.is_empty() => {
                    self.set_property_typed(key, name, values, PropertyType::Empty)?;
                }
                Some(ptype) if ptype != PropertyType::Unknown => {
                    self.set_property_typed(key, name, values, ptype)?;
                }
                _ => self.set_property(key, name, values)?,
            }
            present.push(name.as_str());
        }

        if !present.contains(&"phandle") {
            let phandle = keys.get(PHANDLE_KEY).and_then(Json::as_u64).unwrap_or(0);
            if let Ok(phandle @ 1..) = u32::try_from(phandle) {
                self.set_property_typed(key, "phandle", vec![phandle.into()], PropertyType::UInt32)?;
                present.push("phandle");
            }
        }

        let absent: Vec<String> = self
            .node(key)
            .map(|node| {
                node.properties()
                    .map(|property| property.name().to_owned())
                    .filter(|name| !present.contains(&name.as_str()))
                    .collect()
            })
            .unwrap_or_default();
        for name in absent {
            self.delete_property(key, &name)?;
        }

        let label = keys.get(LABEL_KEY).and_then(Json::as_str);
        self.set_label(key, label)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::backend::SourceBackend;

    fn tree(source: &str) -> Tree<'static> {
        Tree::new(Box::new(SourceBackend::parse(source).unwrap())).unwrap()
    }

    #[test]
    fn reserved_keys() {
        let tree = tree("/ { l: leaf@1 { phandle = <3>; ranges; names = \"a\", \"b\"; }; };");
        let generic = tree.export();
        let leaf = generic.get("/leaf@1").unwrap();
        assert_eq!(leaf[PATH_KEY], "/leaf@1");
        assert_eq!(leaf[NAME_KEY], "leaf@1");
        assert_eq!(leaf[PHANDLE_KEY], 3);
        assert_eq!(leaf[LABEL_KEY], "l");
        assert!(leaf[NUMBER_KEY].as_i64().unwrap() >= 0);
        assert_eq!(leaf["ranges"], true);
        assert_eq!(leaf["names"], json!(["a", "b"]));
        assert_eq!(leaf["__names_type__"], "multi-string");
    }

    #[test]
    fn import_applies_the_mapping() {
        let mut tree = tree("/ { a { x = <1>; y = \"keep\"; }; gone { }; };");
        let mut generic = tree.export();
        generic.remove("/gone");
        let a = generic.get_mut("/a").unwrap();
        a.insert("x".to_owned(), Json::from(2));
        a.insert("y".to_owned(), Json::Bool(false));
        a.insert("flag".to_owned(), Json::Bool(true));
        generic.insert("/a/new", GenericNode::from([("big".to_owned(), json!([1, 2]))]));
        generic
            .get_mut("/a/new")
            .unwrap()
            .insert("__big_type__".to_owned(), json!("uint64"));

        tree.import(&generic).unwrap();
        assert!(!tree.is_dirty());
        assert!(tree.node_by_path("/gone").is_none());
        let a = tree.node_by_path("/a").unwrap();
        assert_eq!(tree.get_property(a, "x").unwrap(), [Value::Int(2)]);
        assert!(tree.get_property(a, "y").is_none());
        assert!(tree.get_property(a, "flag").unwrap().is_empty());
        let new = tree.node_by_path("/a/new").unwrap();
        let big = tree.node(new).unwrap().property("big").unwrap();
        assert_eq!(big.raw().unwrap().len(), 16);
    }

    #[test]
    fn rejects_bad_entries() {
        let mut tree = tree("/ { };");
        let mut generic = GenericTree::new();
        generic.insert("/", GenericNode::from([("x".to_owned(), json!({"nested": 1}))]));
        assert!(matches!(tree.import(&generic), Err(Error::Import { .. })));

        let mut generic = GenericTree::new();
        generic.insert("relative", GenericNode::new());
        assert!(matches!(tree.import(&generic), Err(Error::Import { .. })));
    }

    #[test]
    fn json_round_trip() {
        let tree = tree("/ { a { reg = <0x10 0x20>; }; };");
        let generic = tree.export();
        let text = generic.to_json().unwrap();
        assert_eq!(GenericTree::from_json(&text).unwrap(), generic);
        assert!(text.find("\"/\"").unwrap() < text.find("\"/a\"").unwrap());
    }
}
