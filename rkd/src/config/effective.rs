use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};

use super::merge::Resolved;
use super::{
    ADD_RUNTIME, CGROUP_DRIVER, CGROUP_PARENT, CONTAINERD_PATH, DEBUG, DEFAULT_REGISTRY,
    DEFAULT_REGISTRY_NAMESPACE, ENABLE_CRI, FieldValue, HOME_DIR, LABEL, LISTEN,
    MANAGER_WHITELIST, MAX_CONCURRENT_DOWNLOADS, PIDFILE, Provenance, Scalar, TLS, TLS_CA,
    TLS_CERT, TLS_KEY, TLS_VERIFY,
};
use crate::error::DaemonError;
use crate::listener::ListenAddr;
use crate::tls::TlsSettings;

/// The merged configuration the daemon runs with. Immutable once built; every
/// field remembers which source supplied it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveConfig {
    pub listen: Vec<String>,
    pub labels: Vec<String>,
    pub runtimes: BTreeMap<String, String>,
    pub tls: TlsSettings,
    pub containerd_path: String,
    pub cgroup_driver: String,
    pub cgroup_parent: String,
    pub enable_cri: bool,
    pub debug: bool,
    pub home_dir: PathBuf,
    pub pidfile: PathBuf,
    pub default_registry: String,
    pub default_registry_namespace: String,
    pub max_concurrent_downloads: i64,
    #[serde(skip)]
    resolved: BTreeMap<&'static str, Resolved>,
}

impl EffectiveConfig {
    pub(crate) fn from_resolved(resolved: BTreeMap<&'static str, Resolved>) -> Self {
        let scalar = |name: &str| match resolved.get(name).map(|r| &r.value) {
            Some(FieldValue::Scalar(s)) => Some(s.clone()),
            _ => None,
        };
        let string = |name: &str| {
            scalar(name)
                .and_then(|s| s.as_str().map(str::to_string))
                .unwrap_or_default()
        };
        let set = |name: &str| match resolved.get(name).map(|r| &r.value) {
            Some(FieldValue::Set(items)) => items.iter().cloned().collect(),
            _ => Vec::new(),
        };

        let runtimes = match resolved.get(ADD_RUNTIME).map(|r| &r.value) {
            Some(FieldValue::Mapping(entries)) => entries.iter().cloned().collect(),
            _ => BTreeMap::new(),
        };

        let tls = match resolved.get(TLS).map(|r| &r.value) {
            Some(FieldValue::Nested(fields)) => {
                let path = |key: &str| {
                    fields
                        .get(key)
                        .and_then(Scalar::as_str)
                        .filter(|s| !s.is_empty())
                        .map(PathBuf::from)
                };
                TlsSettings {
                    ca: path(TLS_CA),
                    cert: path(TLS_CERT),
                    key: path(TLS_KEY),
                    verify: fields
                        .get(TLS_VERIFY)
                        .and_then(Scalar::as_bool)
                        .unwrap_or(false),
                    manager_whitelist: fields
                        .get(MANAGER_WHITELIST)
                        .and_then(Scalar::as_str)
                        .map(str::to_string),
                }
            }
            _ => TlsSettings::default(),
        };

        EffectiveConfig {
            listen: set(LISTEN),
            labels: set(LABEL),
            runtimes,
            tls,
            containerd_path: string(CONTAINERD_PATH),
            cgroup_driver: string(CGROUP_DRIVER),
            cgroup_parent: string(CGROUP_PARENT),
            enable_cri: scalar(ENABLE_CRI).and_then(|s| s.as_bool()).unwrap_or(false),
            debug: scalar(DEBUG).and_then(|s| s.as_bool()).unwrap_or(false),
            home_dir: PathBuf::from(string(HOME_DIR)),
            pidfile: PathBuf::from(string(PIDFILE)),
            default_registry: string(DEFAULT_REGISTRY),
            default_registry_namespace: string(DEFAULT_REGISTRY_NAMESPACE),
            max_concurrent_downloads: scalar(MAX_CONCURRENT_DOWNLOADS)
                .and_then(|s| s.as_int())
                .unwrap_or(0),
            resolved,
        }
    }

    /// Which source supplied `field`.
    pub fn provenance(&self, field: &str) -> Option<Provenance> {
        self.resolved.get(field).map(|r| r.provenance)
    }

    pub fn value(&self, field: &str) -> Option<&FieldValue> {
        self.resolved.get(field).map(|r| &r.value)
    }

    /// Renders the configuration as a file the file reader accepts unchanged.
    pub fn to_document(&self) -> Value {
        let fields: Map<String, Value> = self
            .resolved
            .iter()
            .map(|(name, r)| (name.to_string(), r.value.to_json()))
            .collect();
        Value::Object(fields)
    }

    pub fn listen_addrs(&self) -> Result<Vec<ListenAddr>, DaemonError> {
        let origin = self.provenance(LISTEN).unwrap_or(Provenance::Default);
        let malformed = |reason: String| DaemonError::MalformedInput {
            origin,
            field: LISTEN.to_string(),
            reason,
        };
        if self.listen.is_empty() {
            return Err(malformed("at least one listen address is required".into()));
        }
        self.listen
            .iter()
            .map(|raw| ListenAddr::parse(raw).map_err(malformed))
            .collect()
    }
}
