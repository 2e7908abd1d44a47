//! Classification record values and the flattening rule used for persistence.
//!
//! UI collaborators build a nested record (beam ratings live under their
//! `"{filter},{pa}"` key); the output table stores it flat, with nested keys
//! joined by `_`, uppercased, and list entries expanded by index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single typed value in a record or catalogue cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Best-effort typing of a raw catalogue cell.
    pub fn infer(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(i) = raw.parse::<i64>() {
            return FieldValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return FieldValue::Float(f);
        }
        match raw.to_ascii_lowercase().as_str() {
            "true" => FieldValue::Bool(true),
            "false" => FieldValue::Bool(false),
            _ => FieldValue::Text(raw.to_string()),
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            FieldValue::Bool(_) => ColumnKind::Bool,
            FieldValue::Int(_) => ColumnKind::Int,
            FieldValue::Float(_) => ColumnKind::Float,
            FieldValue::Text(_) => ColumnKind::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse operator input as a value of `kind`.
    pub fn parse_as(raw: &str, kind: ColumnKind) -> Option<Self> {
        let raw = raw.trim();
        match kind {
            ColumnKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" | "on" => Some(FieldValue::Bool(true)),
                "false" | "no" | "n" | "0" | "off" => Some(FieldValue::Bool(false)),
                _ => None,
            },
            ColumnKind::Int => raw.parse().ok().map(FieldValue::Int),
            ColumnKind::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(FieldValue::Float),
            ColumnKind::Text => Some(FieldValue::Text(raw.to_string())),
        }
    }

    /// Convert to `kind`, allowing integer → float widening only.
    pub fn coerce(self, kind: ColumnKind) -> Option<Self> {
        match (self, kind) {
            (FieldValue::Int(i), ColumnKind::Float) => Some(FieldValue::Float(i as f64)),
            (v, k) if v.kind() == k => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(x) => write!(f, "{x}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(x: f64) -> Self {
        FieldValue::Float(x)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// Storage type of an output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Bool,
    Int,
    Float,
    Text,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Bool | ColumnKind::Int => "INTEGER",
            ColumnKind::Float => "REAL",
            ColumnKind::Text => "TEXT",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ColumnKind::Bool => "boolean",
            ColumnKind::Int => "integer",
            ColumnKind::Float => "number",
            ColumnKind::Text => "text",
        }
    }
}

/// A node of the in-progress record. Maps keep insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordNode {
    Value(FieldValue),
    Map(Vec<(String, RecordNode)>),
    List(Vec<RecordNode>),
}

impl RecordNode {
    pub fn empty_map() -> Self {
        RecordNode::Map(Vec::new())
    }

    /// Set `path` to `value`, creating intermediate maps. Last write wins.
    /// A scalar sitting where a map is needed is replaced.
    pub fn set_path(&mut self, path: &[&str], value: FieldValue) {
        let Some((head, rest)) = path.split_first() else {
            *self = RecordNode::Value(value);
            return;
        };
        if !matches!(self, RecordNode::Map(_)) {
            *self = RecordNode::empty_map();
        }
        let RecordNode::Map(entries) = self else {
            unreachable!("node was just made a map");
        };
        let idx = match entries.iter().position(|(k, _)| k == head) {
            Some(i) => i,
            None => {
                entries.push((head.to_string(), RecordNode::empty_map()));
                entries.len() - 1
            }
        };
        entries[idx].1.set_path(rest, value);
    }

    pub fn get_path(&self, path: &[&str]) -> Option<&FieldValue> {
        match (self, path.split_first()) {
            (RecordNode::Value(v), None) => Some(v),
            (RecordNode::Map(entries), Some((head, rest))) => entries
                .iter()
                .find(|(k, _)| k == head)
                .and_then(|(_, node)| node.get_path(rest)),
            _ => None,
        }
    }
}

/// The persisted shape of a record: column name → value.
pub type FlatRecord = BTreeMap<String, FieldValue>;

/// Flatten a record tree. Nested keys are joined with `_` and the whole
/// resulting key is uppercased at the leaf; list entries contribute their
/// index as a key component.
pub fn flatten(node: &RecordNode) -> FlatRecord {
    let mut out = FlatRecord::new();
    flatten_into(node, None, &mut out);
    out
}

fn flatten_into(node: &RecordNode, prefix: Option<&str>, out: &mut FlatRecord) {
    let join = |key: &str| match prefix {
        Some(p) => format!("{p}_{key}"),
        None => key.to_string(),
    };
    match node {
        RecordNode::Value(v) => {
            if let Some(key) = prefix {
                out.insert(key.to_uppercase(), v.clone());
            }
        }
        RecordNode::Map(entries) => {
            for (key, child) in entries {
                flatten_into(child, Some(&join(key)), out);
            }
        }
        RecordNode::List(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_into(child, Some(&join(&i.to_string())), out);
            }
        }
    }
}
