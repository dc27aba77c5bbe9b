//! Daemon configuration: the three sources (defaults, file, flags), the per-field
//! merge policy and the effective configuration handed to the supervisor.

pub mod cli;
pub mod defaults;
pub mod effective;
pub mod file;
pub mod merge;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::DaemonError;

pub use cli::DaemonArgs;
pub use effective::EffectiveConfig;
pub use merge::{Conflict, ConflictClass, ConflictReport, merge};

/// Which source produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Default,
    File,
    Cli,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provenance::Default => "default",
            Provenance::File => "file",
            Provenance::Cli => "cli",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Str,
    Bool,
    Int,
}

/// How a field merges across sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(ScalarType),
    /// A structured value whose sub-fields are only ever taken from one source.
    Nested(&'static [(&'static str, ScalarType)]),
    Set,
    Mapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

pub const LISTEN: &str = "listen";
pub const LABEL: &str = "label";
pub const ADD_RUNTIME: &str = "add-runtime";
pub const TLS: &str = "TLS";
pub const CONTAINERD_PATH: &str = "containerd-path";
pub const CGROUP_DRIVER: &str = "cgroup-driver";
pub const CGROUP_PARENT: &str = "cgroup-parent";
pub const ENABLE_CRI: &str = "enable-cri";
pub const DEBUG: &str = "debug";
pub const HOME_DIR: &str = "home-dir";
pub const PIDFILE: &str = "pidfile";
pub const DEFAULT_REGISTRY: &str = "default-registry";
pub const DEFAULT_REGISTRY_NAMESPACE: &str = "default-registry-namespace";
pub const MAX_CONCURRENT_DOWNLOADS: &str = "max-concurrent-downloads";

pub const TLS_CA: &str = "tlscacert";
pub const TLS_CERT: &str = "tlscert";
pub const TLS_KEY: &str = "tlskey";
pub const TLS_VERIFY: &str = "tlsverify";
pub const MANAGER_WHITELIST: &str = "manager-whitelist";

pub const TLS_FIELDS: &[(&str, ScalarType)] = &[
    (TLS_CA, ScalarType::Str),
    (TLS_CERT, ScalarType::Str),
    (TLS_KEY, ScalarType::Str),
    (TLS_VERIFY, ScalarType::Bool),
    (MANAGER_WHITELIST, ScalarType::Str),
];

/// Accepted values of `cgroup-driver`.
pub const CGROUP_DRIVERS: &[&str] = &["cgroupfs", "systemd"];

/// Every configuration field known to the daemon. The file and the flags share these names.
#[rustfmt::skip]
pub const FIELDS: &[FieldSpec] = &[
    FieldSpec { name: LISTEN, kind: FieldKind::Set },
    FieldSpec { name: LABEL, kind: FieldKind::Set },
    FieldSpec { name: ADD_RUNTIME, kind: FieldKind::Mapping },
    FieldSpec { name: TLS, kind: FieldKind::Nested(TLS_FIELDS) },
    FieldSpec { name: CONTAINERD_PATH, kind: FieldKind::Scalar(ScalarType::Str) },
    FieldSpec { name: CGROUP_DRIVER, kind: FieldKind::Scalar(ScalarType::Str) },
    FieldSpec { name: CGROUP_PARENT, kind: FieldKind::Scalar(ScalarType::Str) },
    FieldSpec { name: ENABLE_CRI, kind: FieldKind::Scalar(ScalarType::Bool) },
    FieldSpec { name: DEBUG, kind: FieldKind::Scalar(ScalarType::Bool) },
    FieldSpec { name: HOME_DIR, kind: FieldKind::Scalar(ScalarType::Str) },
    FieldSpec { name: PIDFILE, kind: FieldKind::Scalar(ScalarType::Str) },
    FieldSpec { name: DEFAULT_REGISTRY, kind: FieldKind::Scalar(ScalarType::Str) },
    FieldSpec { name: DEFAULT_REGISTRY_NAMESPACE, kind: FieldKind::Scalar(ScalarType::Str) },
    FieldSpec { name: MAX_CONCURRENT_DOWNLOADS, kind: FieldKind::Scalar(ScalarType::Int) },
];

pub fn field(name: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|spec| spec.name == name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
    Str(String),
    Bool(bool),
    Int(i64),
}

impl Scalar {
    pub fn from_json(value: &Value, ty: ScalarType) -> Result<Scalar, String> {
        match (ty, value) {
            (ScalarType::Str, Value::String(s)) => Ok(Scalar::Str(s.clone())),
            (ScalarType::Bool, Value::Bool(b)) => Ok(Scalar::Bool(*b)),
            (ScalarType::Int, Value::Number(n)) => n
                .as_i64()
                .map(Scalar::Int)
                .ok_or_else(|| format!("expected an integer, got {n}")),
            (ScalarType::Str, other) => Err(format!("expected a string, got {other}")),
            (ScalarType::Bool, other) => Err(format!("expected a boolean, got {other}")),
            (ScalarType::Int, other) => Err(format!("expected an integer, got {other}")),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Str(s) => Value::String(s.clone()),
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::from(*i),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Str(s) => write!(f, "{s:?}"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Scalar(Scalar),
    Nested(BTreeMap<String, Scalar>),
    Set(BTreeSet<String>),
    /// Raw `name -> value` entries in the order a source supplied them. Repeated
    /// keys are kept so the merger can tell an idempotent repeat from a clash.
    Mapping(Vec<(String, String)>),
}

impl FieldValue {
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Scalar(s) => s.to_json(),
            FieldValue::Nested(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            FieldValue::Set(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            FieldValue::Mapping(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Scalar(s) => write!(f, "{s}"),
            FieldValue::Nested(fields) => {
                let parts: Vec<_> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            FieldValue::Set(items) => {
                let parts: Vec<_> = items.iter().map(String::as_str).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            FieldValue::Mapping(entries) => {
                let parts: Vec<_> = entries.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

/// A partial configuration coming from a single source.
///
/// Readers never apply defaults: a field absent from the input is absent here.
#[derive(Debug, Clone)]
pub struct ConfigFragment {
    provenance: Provenance,
    fields: BTreeMap<&'static str, FieldValue>,
}

impl ConfigFragment {
    pub fn new(provenance: Provenance) -> Self {
        ConfigFragment {
            provenance,
            fields: BTreeMap::new(),
        }
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }

    pub fn set_scalar(&mut self, spec: &'static FieldSpec, value: Scalar) {
        self.fields.insert(spec.name, FieldValue::Scalar(value));
    }

    pub fn set_nested(&mut self, spec: &'static FieldSpec, sub_field: &str, value: Scalar) {
        let entry = self
            .fields
            .entry(spec.name)
            .or_insert_with(|| FieldValue::Nested(BTreeMap::new()));
        if let FieldValue::Nested(fields) = entry {
            fields.insert(sub_field.to_string(), value);
        }
    }

    pub fn add_to_set(&mut self, spec: &'static FieldSpec, item: String) {
        let entry = self
            .fields
            .entry(spec.name)
            .or_insert_with(|| FieldValue::Set(BTreeSet::new()));
        if let FieldValue::Set(items) = entry {
            items.insert(item);
        }
    }

    /// Marks a set field as supplied even when it carries no items.
    pub fn touch_set(&mut self, spec: &'static FieldSpec) {
        self.fields
            .entry(spec.name)
            .or_insert_with(|| FieldValue::Set(BTreeSet::new()));
    }

    pub fn push_mapping(&mut self, spec: &'static FieldSpec, key: String, value: String) {
        let entry = self
            .fields
            .entry(spec.name)
            .or_insert_with(|| FieldValue::Mapping(Vec::new()));
        if let FieldValue::Mapping(entries) = entry {
            entries.push((key, value));
        }
    }

    pub fn touch_mapping(&mut self, spec: &'static FieldSpec) {
        self.fields
            .entry(spec.name)
            .or_insert_with(|| FieldValue::Mapping(Vec::new()));
    }
}

/// Looks up a field that is known to exist in [`FIELDS`].
pub(crate) fn spec(name: &'static str) -> &'static FieldSpec {
    // every caller passes one of the constants above
    FIELDS
        .iter()
        .find(|spec| spec.name == name)
        .unwrap_or(&FIELDS[0])
}

/// Splits a `key=value` entry, rejecting empty keys (and empty values when required).
pub(crate) fn split_key_value(
    origin: Provenance,
    field: &str,
    raw: &str,
    value_required: bool,
) -> Result<(String, String), DaemonError> {
    let malformed = |reason: String| DaemonError::MalformedInput {
        origin,
        field: field.to_string(),
        reason,
    };
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| malformed(format!("`{raw}` is not in key=value format")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(malformed(format!("`{raw}` has an empty key")));
    }
    if value_required && value.is_empty() {
        return Err(malformed(format!("`{raw}` has an empty value")));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Rejects scalar values outside a field's accepted set.
pub(crate) fn check_scalar(
    origin: Provenance,
    field: &str,
    value: &Scalar,
) -> Result<(), DaemonError> {
    if field != CGROUP_DRIVER {
        return Ok(());
    }
    match value.as_str() {
        Some(driver) if CGROUP_DRIVERS.contains(&driver) => Ok(()),
        _ => Err(DaemonError::MalformedInput {
            origin,
            field: field.to_string(),
            reason: format!("{value} is not one of {}", CGROUP_DRIVERS.join(", ")),
        }),
    }
}

/// Reads every source named by `args` and merges them into the effective configuration.
pub fn load(args: &DaemonArgs) -> Result<EffectiveConfig, DaemonError> {
    let cli = args.to_fragment()?;
    let file = match args.config_file_path() {
        Some(path) => {
            tracing::debug!(path = %path.display(), "reading configuration file");
            file::read(&path)?
        }
        None => ConfigFragment::new(Provenance::File),
    };
    merge(&defaults::fragment(), &file, &cli).map_err(DaemonError::ConfigConflict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_catalogue_is_unique() {
        let names: BTreeSet<_> = FIELDS.iter().map(|f| f.name).collect();
        assert_eq!(names.len(), FIELDS.len());
        assert!(field("TLS").is_some());
        assert!(field("tls").is_none());
    }

    #[test]
    fn test_split_key_value() {
        let (k, v) = split_key_value(Provenance::Cli, LABEL, "a=b=c", true).unwrap();
        assert_eq!((k.as_str(), v.as_str()), ("a", "b=c"));

        let err = split_key_value(Provenance::Cli, LABEL, "adsf", true).unwrap_err();
        assert!(matches!(err, DaemonError::MalformedInput { ref field, .. } if field == LABEL));

        assert!(split_key_value(Provenance::File, ADD_RUNTIME, "=runc", true).is_err());
        assert!(split_key_value(Provenance::File, LABEL, "empty=", false).is_ok());

        let driver = Scalar::Str("openrc".into());
        let err = check_scalar(Provenance::Cli, CGROUP_DRIVER, &driver).unwrap_err();
        assert!(matches!(err, DaemonError::MalformedInput { ref field, .. } if field == CGROUP_DRIVER));
        assert!(check_scalar(Provenance::Cli, CGROUP_PARENT, &driver).is_ok());
    }

    #[test]
    fn test_fragment_keeps_its_provenance() {
        let mut fragment = ConfigFragment::new(Provenance::File);
        fragment.add_to_set(spec(LABEL), "a=b".into());
        fragment.add_to_set(spec(LABEL), "a=b".into());
        assert_eq!(fragment.provenance(), Provenance::File);
        assert_eq!(
            fragment.get(LABEL),
            Some(&FieldValue::Set(BTreeSet::from(["a=b".to_string()])))
        );
    }

    #[test]
    fn test_scalar_type_checks() {
        assert_eq!(
            Scalar::from_json(&Value::from(3), ScalarType::Int),
            Ok(Scalar::Int(3))
        );
        assert!(Scalar::from_json(&Value::from("3"), ScalarType::Int).is_err());
        assert!(Scalar::from_json(&Value::from(true), ScalarType::Str).is_err());
    }
}
