use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{
    ConfigFragment, FieldKind, FieldValue, Provenance, Scalar, check_scalar, field,
    split_key_value,
};
use crate::error::DaemonError;

fn malformed(field: &str, reason: impl Into<String>) -> DaemonError {
    DaemonError::MalformedInput {
        origin: Provenance::File,
        field: field.to_string(),
        reason: reason.into(),
    }
}

pub fn read(path: &Path) -> Result<ConfigFragment, DaemonError> {
    let content = fs::read_to_string(path).map_err(|e| {
        malformed(
            "config-file",
            format!("failed to read {}: {e}", path.display()),
        )
    })?;
    parse(&content)
}

/// JSON tree that keeps every member of an object in document order, repeated keys
/// included. `serde_json::Value` keeps only the last of a repeated key.
#[derive(Debug, Clone, PartialEq)]
enum Node {
    Object(Vec<(String, Node)>),
    Value(Value),
}

impl Node {
    fn is_null(&self) -> bool {
        matches!(self, Node::Value(Value::Null))
    }

    fn to_value(&self) -> Value {
        match self {
            Node::Value(value) => value.clone(),
            Node::Object(members) => Value::Object(
                members
                    .iter()
                    .map(|(key, node)| (key.clone(), node.to_value()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct NodeVisitor;

        impl<'de> Visitor<'de> for NodeVisitor {
            type Value = Node;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON value")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Node, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut members = Vec::new();
                while let Some((key, node)) = map.next_entry::<String, Node>()? {
                    members.push((key, node));
                }
                Ok(Node::Object(members))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Node, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(node) = seq.next_element::<Node>()? {
                    items.push(node.to_value());
                }
                Ok(Node::Value(Value::Array(items)))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Node, E> {
                Ok(Node::Value(Value::Bool(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Node, E> {
                Ok(Node::Value(Value::from(v)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Node, E> {
                Ok(Node::Value(Value::from(v)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Node, E> {
                Ok(Node::Value(Value::from(v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Node, E> {
                Ok(Node::Value(Value::String(v.to_string())))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Node, E> {
                Ok(Node::Value(Value::String(v)))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Node, E> {
                Ok(Node::Value(Value::Null))
            }

            fn visit_none<E: de::Error>(self) -> Result<Node, E> {
                Ok(Node::Value(Value::Null))
            }
        }

        deserializer.deserialize_any(NodeVisitor)
    }
}

/// Parses the JSON configuration document. An empty document is an empty fragment;
/// `null` values count as absent and unknown keys are skipped.
///
/// A key repeated with a different value is malformed, except inside `add-runtime`
/// where every entry is kept so the merger reports the clash as a mapping conflict.
pub fn parse(content: &str) -> Result<ConfigFragment, DaemonError> {
    let mut fragment = ConfigFragment::new(Provenance::File);
    if content.trim().is_empty() {
        return Ok(fragment);
    }

    let doc: Node = serde_json::from_str(content)
        .map_err(|e| malformed("config-file", format!("invalid JSON: {e}")))?;
    let Node::Object(doc) = doc else {
        return Err(malformed("config-file", "top-level value must be an object"));
    };

    let mut seen: BTreeMap<&str, &Node> = BTreeMap::new();
    for (key, node) in &doc {
        let Some(spec) = field(key) else {
            debug!(field = %key, "ignoring unknown configuration field");
            continue;
        };
        if !matches!(spec.kind, FieldKind::Mapping) {
            match seen.insert(key.as_str(), node) {
                Some(previous) if previous != node => {
                    return Err(malformed(
                        key,
                        format!("given more than once, as {previous} and as {node}"),
                    ));
                }
                Some(_) => continue,
                None => {}
            }
        }
        if node.is_null() {
            continue;
        }
        match spec.kind {
            FieldKind::Scalar(ty) => {
                let scalar =
                    Scalar::from_json(&node.to_value(), ty).map_err(|r| malformed(key, r))?;
                check_scalar(Provenance::File, key, &scalar)?;
                fragment.set_scalar(spec, scalar);
            }
            FieldKind::Nested(sub_fields) => {
                let Node::Object(members) = node else {
                    return Err(malformed(key, format!("expected an object, got {node}")));
                };
                let mut seen_sub: BTreeMap<&str, &Node> = BTreeMap::new();
                for (sub_key, sub_node) in members {
                    let Some((_, ty)) = sub_fields
                        .iter()
                        .find(|(name, _)| *name == sub_key.as_str())
                    else {
                        debug!(field = %key, sub_field = %sub_key, "ignoring unknown sub-field");
                        continue;
                    };
                    if let Some(previous) = seen_sub.insert(sub_key.as_str(), sub_node) {
                        if previous != sub_node {
                            return Err(malformed(
                                &format!("{key}.{sub_key}"),
                                "given more than once with different values",
                            ));
                        }
                    }
                    if sub_node.is_null() {
                        continue;
                    }
                    let scalar = Scalar::from_json(&sub_node.to_value(), *ty)
                        .map_err(|r| malformed(&format!("{key}.{sub_key}"), r))?;
                    fragment.set_nested(spec, sub_key, scalar);
                }
            }
            FieldKind::Set => {
                let Node::Value(Value::Array(items)) = node else {
                    return Err(malformed(key, format!("expected an array, got {node}")));
                };
                fragment.touch_set(spec);
                for item in items {
                    let Value::String(item) = item else {
                        return Err(malformed(key, format!("expected strings, got {item}")));
                    };
                    if spec.name == super::LABEL {
                        split_key_value(Provenance::File, key, item, false)?;
                    }
                    fragment.add_to_set(spec, item.clone());
                }
            }
            FieldKind::Mapping => {
                let Node::Object(entries) = node else {
                    return Err(malformed(key, format!("expected an object, got {node}")));
                };
                fragment.touch_mapping(spec);
                for (name, entry) in entries {
                    let path = runtime_path(key, name, entry)?;
                    let (name, path) = split_key_value(
                        Provenance::File,
                        key,
                        &format!("{name}={path}"),
                        true,
                    )?;
                    fragment.push_mapping(spec, name, path);
                }
            }
        }
    }
    Ok(fragment)
}

/// An `add-runtime` entry is either a path or `{"path": "..."}`.
fn runtime_path(key: &str, name: &str, entry: &Node) -> Result<String, DaemonError> {
    match entry {
        Node::Value(Value::String(path)) => Ok(path.clone()),
        Node::Object(members) => members
            .iter()
            .rev()
            .find_map(|(member, node)| match (member.as_str(), node) {
                ("path", Node::Value(Value::String(path))) => Some(path.clone()),
                _ => None,
            })
            .ok_or_else(|| malformed(key, format!("runtime `{name}` is missing a string `path`"))),
        other => Err(malformed(
            key,
            format!("runtime `{name}` must be a path or an object, got {other}"),
        )),
    }
}

/// Folds `changes` into the file at `path` without a running daemon: sets are
/// extended, mappings gain entries, scalars and nested objects are replaced.
pub fn update(path: &Path, changes: &ConfigFragment) -> Result<(), DaemonError> {
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    // refuse to rewrite a file the daemon itself would reject
    parse(&existing)?;

    let mut doc = if existing.trim().is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(&existing) {
            Ok(Value::Object(doc)) => doc,
            _ => Map::new(),
        }
    };

    for (name, value) in changes.iter() {
        let merged = match (doc.remove(name), value) {
            (Some(Value::Array(mut items)), FieldValue::Set(added)) => {
                for item in added {
                    let item = Value::String(item.clone());
                    if !items.contains(&item) {
                        items.push(item);
                    }
                }
                Value::Array(items)
            }
            (Some(Value::Object(mut entries)), FieldValue::Mapping(added)) => {
                for (key, path) in added {
                    entries.insert(key.clone(), Value::String(path.clone()));
                }
                Value::Object(entries)
            }
            (_, value) => value.to_json(),
        };
        doc.insert(name.to_string(), merged);
    }

    let rendered = serde_json::to_string_pretty(&Value::Object(doc))
        .context("failed to render configuration file")?;
    write_atomically(path, rendered.as_bytes())?;
    info!(path = %path.display(), "configuration file updated");
    Ok(())
}

fn write_atomically(path: &Path, content: &[u8]) -> Result<(), DaemonError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp)
        .with_context(|| format!("failed to create {}", tmp.display()))?;
    file.write_all(content)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
