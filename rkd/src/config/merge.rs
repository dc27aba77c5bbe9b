use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use super::{ConfigFragment, EffectiveConfig, FIELDS, FieldKind, FieldSpec, FieldValue, Provenance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictClass {
    ScalarConflict,
    NestedObjectConflict,
    MappingConflict,
}

impl fmt::Display for ConflictClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictClass::ScalarConflict => "scalar-conflict",
            ConflictClass::NestedObjectConflict => "nested-object-conflict",
            ConflictClass::MappingConflict => "mapping-conflict",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub field: String,
    pub first: (Provenance, String),
    pub second: (Provenance, String),
    pub class: ConflictClass,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` ({}): {} value {} vs {} value {}",
            self.field, self.class, self.first.0, self.first.1, self.second.0, self.second.1
        )
    }
}

/// Every conflict found in one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictReport {
    entries: Vec<Conflict>,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Conflict] {
        &self.entries
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.entries.iter().any(|c| c.field == field)
    }

    fn push(&mut self, conflict: Conflict) {
        self.entries.push(conflict);
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<_> = self.entries.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join("; "))
    }
}

/// The winning value of one field and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: FieldValue,
    pub provenance: Provenance,
}

struct Layers<'a> {
    default: &'a ConfigFragment,
    file: &'a ConfigFragment,
    cli: &'a ConfigFragment,
}

type MergeRule = fn(&FieldSpec, &Layers<'_>, &mut ConflictReport) -> Option<Resolved>;

fn rule_for(kind: &FieldKind) -> MergeRule {
    match kind {
        FieldKind::Scalar(_) => merge_scalar,
        FieldKind::Nested(_) => merge_nested,
        FieldKind::Set => merge_set,
        FieldKind::Mapping => merge_mapping,
    }
}

/// Merges the three sources with precedence default < file < cli.
///
/// A value supplied by both the file and the flags is never silently resolved by
/// precedence: every such clash ends up in the returned report.
pub fn merge(
    default: &ConfigFragment,
    file: &ConfigFragment,
    cli: &ConfigFragment,
) -> Result<EffectiveConfig, ConflictReport> {
    debug_assert_eq!(file.provenance(), Provenance::File);
    debug_assert_eq!(cli.provenance(), Provenance::Cli);

    let layers = Layers { default, file, cli };
    let mut report = ConflictReport::default();
    let mut resolved = BTreeMap::new();
    for spec in FIELDS {
        if let Some(value) = rule_for(&spec.kind)(spec, &layers, &mut report) {
            resolved.insert(spec.name, value);
        }
    }

    if !report.is_empty() {
        return Err(report);
    }
    Ok(EffectiveConfig::from_resolved(resolved))
}

fn resolved(value: &FieldValue, provenance: Provenance) -> Resolved {
    Resolved {
        value: value.clone(),
        provenance,
    }
}

fn merge_scalar(
    spec: &FieldSpec,
    layers: &Layers<'_>,
    report: &mut ConflictReport,
) -> Option<Resolved> {
    match (layers.file.get(spec.name), layers.cli.get(spec.name)) {
        (Some(file), Some(cli)) if file != cli => {
            report.push(Conflict {
                field: spec.name.to_string(),
                first: (Provenance::File, file.to_string()),
                second: (Provenance::Cli, cli.to_string()),
                class: ConflictClass::ScalarConflict,
            });
            None
        }
        (_, Some(cli)) => Some(resolved(cli, Provenance::Cli)),
        (Some(file), None) => Some(resolved(file, Provenance::File)),
        (None, None) => layers
            .default
            .get(spec.name)
            .map(|v| resolved(v, Provenance::Default)),
    }
}

// The sub-fields of a nested object depend on each other, so one source owns the
// whole object. Any overlap is a conflict, even on disjoint sub-fields.
fn merge_nested(
    spec: &FieldSpec,
    layers: &Layers<'_>,
    report: &mut ConflictReport,
) -> Option<Resolved> {
    fn supplied<'a>(fragment: &'a ConfigFragment, name: &str) -> Option<&'a FieldValue> {
        match fragment.get(name) {
            Some(FieldValue::Nested(fields)) if fields.is_empty() => None,
            other => other,
        }
    }
    match (supplied(layers.file, spec.name), supplied(layers.cli, spec.name)) {
        (Some(file), Some(cli)) => {
            report.push(Conflict {
                field: spec.name.to_string(),
                first: (Provenance::File, file.to_string()),
                second: (Provenance::Cli, cli.to_string()),
                class: ConflictClass::NestedObjectConflict,
            });
            None
        }
        (None, Some(cli)) => Some(resolved(cli, Provenance::Cli)),
        (Some(file), None) => Some(resolved(file, Provenance::File)),
        (None, None) => layers
            .default
            .get(spec.name)
            .map(|v| resolved(v, Provenance::Default)),
    }
}

fn merge_set(spec: &FieldSpec, layers: &Layers<'_>, _: &mut ConflictReport) -> Option<Resolved> {
    let set_of = |fragment: &ConfigFragment| match fragment.get(spec.name) {
        Some(FieldValue::Set(items)) => Some(items.clone()),
        _ => None,
    };
    match (set_of(layers.file), set_of(layers.cli)) {
        (None, None) => layers
            .default
            .get(spec.name)
            .map(|v| resolved(v, Provenance::Default)),
        (file, cli) => {
            let provenance = if cli.is_some() {
                Provenance::Cli
            } else {
                Provenance::File
            };
            let union: BTreeSet<String> = file.into_iter().chain(cli).flatten().collect();
            Some(Resolved {
                value: FieldValue::Set(union),
                provenance,
            })
        }
    }
}

/// Collapses the raw entries of one source, reporting a key repeated with different values.
fn collapse_mapping(
    spec: &FieldSpec,
    fragment: &ConfigFragment,
    report: &mut ConflictReport,
) -> Option<BTreeMap<String, String>> {
    let Some(FieldValue::Mapping(entries)) = fragment.get(spec.name) else {
        return None;
    };
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in entries {
        match map.get(key) {
            Some(existing) if existing != value => report.push(Conflict {
                field: spec.name.to_string(),
                first: (fragment.provenance(), format!("{key}={existing}")),
                second: (fragment.provenance(), format!("{key}={value}")),
                class: ConflictClass::MappingConflict,
            }),
            Some(_) => {}
            None => {
                map.insert(key.clone(), value.clone());
            }
        }
    }
    Some(map)
}

fn merge_mapping(
    spec: &FieldSpec,
    layers: &Layers<'_>,
    report: &mut ConflictReport,
) -> Option<Resolved> {
    let file = collapse_mapping(spec, layers.file, report);
    let cli = collapse_mapping(spec, layers.cli, report);

    let (union, provenance) = match (file, cli) {
        (None, None) => {
            let default = collapse_mapping(spec, layers.default, report)?;
            (default, Provenance::Default)
        }
        (Some(file), None) => (file, Provenance::File),
        (None, Some(cli)) => (cli, Provenance::Cli),
        (Some(mut file), Some(cli)) => {
            for (key, value) in cli {
                match file.get(&key) {
                    Some(existing) if existing != &value => report.push(Conflict {
                        field: spec.name.to_string(),
                        first: (Provenance::File, format!("{key}={existing}")),
                        second: (Provenance::Cli, format!("{key}={value}")),
                        class: ConflictClass::MappingConflict,
                    }),
                    _ => {
                        file.insert(key, value);
                    }
                }
            }
            (file, Provenance::Cli)
        }
    };
    Some(Resolved {
        value: FieldValue::Mapping(union.into_iter().collect()),
        provenance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ADD_RUNTIME, CONTAINERD_PATH, LABEL, LISTEN, Scalar, TLS, TLS_CERT, TLS_VERIFY,
        defaults, spec,
    };

    fn file() -> ConfigFragment {
        ConfigFragment::new(Provenance::File)
    }

    fn cli() -> ConfigFragment {
        ConfigFragment::new(Provenance::Cli)
    }

    #[test]
    fn test_defaults_only() {
        let config = merge(&defaults::fragment(), &file(), &cli()).unwrap();
        assert_eq!(config.listen, vec![defaults::DEFAULT_LISTEN.to_string()]);
        assert_eq!(config.provenance(CONTAINERD_PATH), Some(Provenance::Default));
        assert_eq!(config.runtimes.get("runc").map(String::as_str), Some("runc"));
        assert!(!config.tls.is_enabled());
    }

    #[test]
    fn test_scalar_conflict_names_field() {
        let mut f = file();
        f.set_scalar(spec(CONTAINERD_PATH), Scalar::Str("abc".into()));
        let mut c = cli();
        c.set_scalar(spec(CONTAINERD_PATH), Scalar::Str("def".into()));

        let report = merge(&defaults::fragment(), &f, &c).unwrap_err();
        assert_eq!(report.entries().len(), 1);
        assert!(report.contains_field(CONTAINERD_PATH));
        assert_eq!(report.entries()[0].class, ConflictClass::ScalarConflict);
    }

    #[test]
    fn test_equal_scalars_do_not_conflict() {
        let mut f = file();
        f.set_scalar(spec(CONTAINERD_PATH), Scalar::Str("abc".into()));
        let mut c = cli();
        c.set_scalar(spec(CONTAINERD_PATH), Scalar::Str("abc".into()));

        let config = merge(&defaults::fragment(), &f, &c).unwrap();
        assert_eq!(config.containerd_path, "abc");
        assert_eq!(config.provenance(CONTAINERD_PATH), Some(Provenance::Cli));
    }

    #[test]
    fn test_single_source_wins_over_default() {
        let mut f = file();
        f.set_scalar(spec(CONTAINERD_PATH), Scalar::Str("/opt/containerd".into()));
        let config = merge(&defaults::fragment(), &f, &cli()).unwrap();
        assert_eq!(config.containerd_path, "/opt/containerd");
        assert_eq!(config.provenance(CONTAINERD_PATH), Some(Provenance::File));
    }

    #[test]
    fn test_label_union() {
        let mut f = file();
        f.add_to_set(spec(LABEL), "a=a".into());
        f.add_to_set(spec(LABEL), "b=b".into());
        let mut c = cli();
        c.add_to_set(spec(LABEL), "c=d".into());
        c.add_to_set(spec(LABEL), "a=a".into());

        let config = merge(&defaults::fragment(), &f, &c).unwrap();
        assert_eq!(config.labels, vec!["a=a", "b=b", "c=d"]);
    }

    #[test]
    fn test_listen_default_is_replaced_not_extended() {
        let mut c = cli();
        c.add_to_set(spec(LISTEN), "tcp://127.0.0.1:2376".into());
        let config = merge(&defaults::fragment(), &file(), &c).unwrap();
        assert_eq!(config.listen, vec!["tcp://127.0.0.1:2376"]);
    }

    #[test]
    fn test_nested_overlap_conflicts_on_disjoint_sub_fields() {
        let mut f = file();
        f.set_nested(spec(TLS), TLS_VERIFY, Scalar::Bool(true));
        let mut c = cli();
        c.set_nested(spec(TLS), TLS_CERT, Scalar::Str("/cert.pem".into()));

        let report = merge(&defaults::fragment(), &f, &c).unwrap_err();
        assert!(report.contains_field(TLS));
        assert_eq!(report.entries()[0].class, ConflictClass::NestedObjectConflict);
    }

    #[test]
    fn test_empty_nested_object_is_not_supplied() {
        let f = crate::config::file::parse(r#"{"TLS": {}}"#).unwrap();
        let mut c = cli();
        c.set_nested(spec(TLS), TLS_CERT, Scalar::Str("/cert.pem".into()));

        let config = merge(&defaults::fragment(), &f, &c).unwrap();
        assert_eq!(config.provenance(TLS), Some(Provenance::Cli));
    }

    #[test]
    fn test_mapping_rules() {
        // repeat with equal value collapses
        let mut c = cli();
        c.push_mapping(spec(ADD_RUNTIME), "runa".into(), "runa".into());
        c.push_mapping(spec(ADD_RUNTIME), "runa".into(), "runa".into());
        let config = merge(&defaults::fragment(), &file(), &c).unwrap();
        assert_eq!(config.runtimes.len(), 1);
        assert!(!config.runtimes.contains_key("runc"));

        // repeat with another value within one source
        let mut c = cli();
        c.push_mapping(spec(ADD_RUNTIME), "runa".into(), "x".into());
        c.push_mapping(spec(ADD_RUNTIME), "runa".into(), "y".into());
        let report = merge(&defaults::fragment(), &file(), &c).unwrap_err();
        assert_eq!(report.entries()[0].class, ConflictClass::MappingConflict);
        assert_eq!(report.entries()[0].first.0, Provenance::Cli);

        // same key across sources
        let mut f = file();
        f.push_mapping(spec(ADD_RUNTIME), "runa".into(), "/a".into());
        f.push_mapping(spec(ADD_RUNTIME), "runb".into(), "/b".into());
        let mut c = cli();
        c.push_mapping(spec(ADD_RUNTIME), "runa".into(), "/other".into());
        let report = merge(&defaults::fragment(), &f, &c).unwrap_err();
        assert!(report.contains_field(ADD_RUNTIME));

        // disjoint keys union
        let mut c = cli();
        c.push_mapping(spec(ADD_RUNTIME), "runc2".into(), "/c".into());
        let config = merge(&defaults::fragment(), &f, &c).unwrap();
        assert_eq!(config.runtimes.len(), 3);
    }

    #[test]
    fn test_all_conflicts_are_reported_together() {
        let mut f = file();
        f.set_scalar(spec(CONTAINERD_PATH), Scalar::Str("abc".into()));
        f.set_nested(spec(TLS), TLS_VERIFY, Scalar::Bool(true));
        let mut c = cli();
        c.set_scalar(spec(CONTAINERD_PATH), Scalar::Str("def".into()));
        c.set_nested(spec(TLS), TLS_VERIFY, Scalar::Bool(true));

        let report = merge(&defaults::fragment(), &f, &c).unwrap_err();
        assert_eq!(report.entries().len(), 2);
        let rendered = report.to_string();
        assert!(rendered.contains(CONTAINERD_PATH) && rendered.contains(TLS));
    }
}
