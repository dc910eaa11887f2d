use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt, Snafu};

use super::path::{Path, PathElement};

#[derive(Debug, Snafu)]
pub enum FieldsV1Error {
    #[snafu(display("fieldsV1 node is not an object"))]
    NotAnObject,

    #[snafu(display("unrecognized fieldsV1 key {key:?}"))]
    UnrecognizedKey { key: String },

    #[snafu(display("failed to parse fieldsV1 key {key:?}"))]
    ParseKey {
        source: serde_json::Error,
        key: String,
    },
}

/// Associative-list hints used when extracting field sets from unstructured
/// documents.
///
/// Maps a dotted field path (list elements elided), e.g.
/// `spec.template.spec.containers`, to the names of the fields that key the
/// items of the list at that path. Lists without a hint are treated as
/// atomic, which matches the deduced schema server-side apply falls back to
/// for unknown types.
#[derive(Debug, Clone, Default)]
pub struct ListKeys {
    keys: BTreeMap<String, Vec<String>>,
}

impl ListKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: &str, keys: &[&str]) -> Self {
        self.keys
            .insert(path.to_owned(), keys.iter().map(ToString::to_string).collect());
        self
    }

    fn keys_for(&self, path: &str) -> Option<&[String]> {
        self.keys.get(path).map(Vec::as_slice)
    }
}

/// A set of field paths, stored as a tree.
///
/// `members` are the paths terminating at this level, `children` the subtrees
/// below. A path element may be both a member and a child, which is how
/// `fieldsV1` marks ownership of an associative-list item together with
/// ownership of fields inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    members: BTreeSet<PathElement>,
    children: BTreeMap<PathElement, FieldSet>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.children.values().all(Self::is_empty)
    }

    /// The number of leaf members in the whole tree.
    pub fn leaf_count(&self) -> usize {
        self.members.len() + self.children.values().map(Self::leaf_count).sum::<usize>()
    }

    /// Inserts a path, terminating at its last element.
    pub fn insert(&mut self, path: &[PathElement]) {
        match path {
            [] => {}
            [last] => {
                self.members.insert(last.clone());
            }
            [first, rest @ ..] => {
                self.children.entry(first.clone()).or_default().insert(rest);
            }
        }
    }

    /// Leaf membership of the exact path.
    pub fn contains(&self, path: &[PathElement]) -> bool {
        match path {
            [] => false,
            [last] => self.members.contains(last),
            [first, rest @ ..] => self
                .children
                .get(first)
                .is_some_and(|child| child.contains(rest)),
        }
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut result = Self {
            members: self.members.union(&other.members).cloned().collect(),
            children: self.children.clone(),
        };
        for (element, child) in &other.children {
            let merged = match result.children.get(element) {
                Some(existing) => existing.union(child),
                None => child.clone(),
            };
            result.children.insert(element.clone(), merged);
        }
        result
    }

    pub fn intersection(&self, other: &Self) -> Self {
        let mut result = Self {
            members: self.members.intersection(&other.members).cloned().collect(),
            children: BTreeMap::new(),
        };
        for (element, child) in &self.children {
            if let Some(other_child) = other.children.get(element) {
                let common = child.intersection(other_child);
                if !common.is_empty() {
                    result.children.insert(element.clone(), common);
                }
            }
        }
        result
    }

    /// Elements of `self` not in `other`. A leaf member is only removed by a
    /// matching leaf member, subtrees recurse independently.
    pub fn difference(&self, other: &Self) -> Self {
        let mut result = Self {
            members: self.members.difference(&other.members).cloned().collect(),
            children: BTreeMap::new(),
        };
        for (element, child) in &self.children {
            match other.children.get(element) {
                Some(other_child) => {
                    let remaining = child.difference(other_child);
                    if !remaining.is_empty() {
                        result.children.insert(element.clone(), remaining);
                    }
                }
                None => {
                    result.children.insert(element.clone(), child.clone());
                }
            }
        }
        result
    }

    /// All leaf member paths, in set order.
    pub fn leaves(&self) -> Vec<Path> {
        let mut paths = Vec::new();
        self.collect_leaves(&mut Vec::new(), &mut paths);
        paths
    }

    fn collect_leaves(&self, prefix: &mut Vec<PathElement>, paths: &mut Vec<Path>) {
        for member in &self.members {
            let mut path = prefix.clone();
            path.push(member.clone());
            paths.push(Path(path));
        }
        for (element, child) in &self.children {
            prefix.push(element.clone());
            child.collect_leaves(prefix, paths);
            prefix.pop();
        }
    }

    /// Parses the `fieldsV1` encoding of a managed-fields entry
    /// (`f:`/`k:`/`v:`/`i:` keys, `.` membership markers).
    pub fn from_fields_v1(value: &Value) -> Result<Self, FieldsV1Error> {
        let object = value.as_object().context(NotAnObjectSnafu)?;
        Self::from_fields_v1_node(object)
    }

    fn from_fields_v1_node(object: &Map<String, Value>) -> Result<Self, FieldsV1Error> {
        let mut set = Self::new();
        for (key, value) in object {
            if key == "." {
                // Membership of the parent node, handled one level up.
                continue;
            }
            let element = parse_fields_v1_key(key)?;
            let child_object = value.as_object().context(NotAnObjectSnafu)?;
            let is_member = child_object.contains_key(".");
            let child = Self::from_fields_v1_node(child_object)?;
            if child.is_empty() {
                set.members.insert(element);
            } else {
                if is_member {
                    set.members.insert(element.clone());
                }
                set.children.insert(element, child);
            }
        }
        Ok(set)
    }

    /// The inverse of [`FieldSet::from_fields_v1`].
    pub fn to_fields_v1(&self) -> Value {
        let mut object = Map::new();
        for member in &self.members {
            if !self.children.contains_key(member) {
                object.insert(fields_v1_key(member), Value::Object(Map::new()));
            }
        }
        for (element, child) in &self.children {
            let mut child_object = match child.to_fields_v1() {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            if self.members.contains(element) {
                child_object.insert(".".to_owned(), Value::Object(Map::new()));
            }
            object.insert(fields_v1_key(element), Value::Object(child_object));
        }
        Value::Object(object)
    }

    /// The field set an unstructured document claims under server-side
    /// apply: granular mappings, associative lists where `hints` name the
    /// merge keys, atomic leaves everywhere else.
    pub fn extract(value: &Value, hints: &ListKeys) -> Self {
        let mut set = Self::new();
        if let Some(object) = value.as_object() {
            extract_object(object, "", hints, &mut set);
        }
        set
    }
}

fn parse_fields_v1_key(key: &str) -> Result<PathElement, FieldsV1Error> {
    if let Some(name) = key.strip_prefix("f:") {
        return Ok(PathElement::field(name));
    }
    if let Some(raw) = key.strip_prefix("k:") {
        let fields: Map<String, Value> =
            serde_json::from_str(raw).context(ParseKeySnafu { key })?;
        return Ok(PathElement::key(fields.into_iter().collect()));
    }
    if let Some(raw) = key.strip_prefix("v:") {
        let value: Value = serde_json::from_str(raw).context(ParseKeySnafu { key })?;
        return Ok(PathElement::Value(value));
    }
    if let Some(raw) = key.strip_prefix("i:") {
        let index: i64 = raw
            .parse()
            .map_err(|_| UnrecognizedKeySnafu { key }.build())?;
        return Ok(PathElement::Index(index));
    }
    UnrecognizedKeySnafu { key }.fail()
}

fn fields_v1_key(element: &PathElement) -> String {
    match element {
        PathElement::Field(name) => format!("f:{name}"),
        PathElement::Key(fields) => {
            let map: Map<String, Value> = fields
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            format!("k:{}", Value::Object(map))
        }
        PathElement::Value(value) => format!("v:{value}"),
        PathElement::Index(index) => format!("i:{index}"),
    }
}

fn extract_object(object: &Map<String, Value>, prefix: &str, hints: &ListKeys, set: &mut FieldSet) {
    for (name, value) in object {
        let element = PathElement::field(name);
        let dotted = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            Value::Object(child_object) if !child_object.is_empty() => {
                let mut child = FieldSet::new();
                extract_object(child_object, &dotted, hints, &mut child);
                set.children.insert(element, child);
            }
            Value::Array(items) => match hints.keys_for(&dotted) {
                Some(keys) => {
                    let mut list = FieldSet::new();
                    extract_list(items, keys, &dotted, hints, &mut list);
                    set.children.insert(element, list);
                }
                // No merge key known, the whole list is an atomic leaf.
                None => {
                    set.members.insert(element);
                }
            },
            _ => {
                set.members.insert(element);
            }
        }
    }
}

fn extract_list(
    items: &[Value],
    keys: &[String],
    dotted: &str,
    hints: &ListKeys,
    set: &mut FieldSet,
) {
    for (index, item) in items.iter().enumerate() {
        let key_fields: Option<Vec<(String, Value)>> = item.as_object().and_then(|object| {
            keys.iter()
                .map(|key| object.get(key).map(|value| (key.clone(), value.clone())))
                .collect()
        });
        let element = match key_fields {
            Some(fields) => PathElement::key(fields),
            // Item is missing its merge key, fall back to its position.
            None => PathElement::Index(index as i64),
        };
        set.members.insert(element.clone());
        if let Some(item_object) = item.as_object() {
            let mut child = FieldSet::new();
            extract_object(item_object, dotted, hints, &mut child);
            if !child.is_empty() {
                set.children.insert(element, child);
            }
        }
    }
}

/// Resolves a path against an unstructured document.
pub(crate) fn lookup<'a>(value: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut current = value;
    for element in &path.0 {
        current = match element {
            PathElement::Field(name) => current.as_object()?.get(name)?,
            PathElement::Index(index) => current.as_array()?.get(usize::try_from(*index).ok()?)?,
            PathElement::Key(fields) => current.as_array()?.iter().find(|item| {
                fields.iter().all(|(name, expected)| {
                    item.as_object()
                        .and_then(|object| object.get(name))
                        .is_some_and(|actual| actual == expected)
                })
            })?,
            PathElement::Value(expected) => current
                .as_array()?
                .iter()
                .find(|item| *item == expected)?,
        };
    }
    Some(current)
}
