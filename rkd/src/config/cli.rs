use std::path::{Path, PathBuf};

use clap::Args;

use super::defaults::DEFAULT_CONFIG_FILE;
use super::{
    ADD_RUNTIME, CGROUP_DRIVER, CGROUP_PARENT, CONTAINERD_PATH, ConfigFragment, DEBUG,
    DEFAULT_REGISTRY, DEFAULT_REGISTRY_NAMESPACE, ENABLE_CRI, HOME_DIR, LABEL, LISTEN,
    MANAGER_WHITELIST, MAX_CONCURRENT_DOWNLOADS, PIDFILE, Provenance, Scalar, TLS, TLS_CA,
    TLS_CERT, TLS_KEY, TLS_VERIFY, check_scalar, spec, split_key_value,
};
use crate::error::DaemonError;

/// Daemon flags. Nothing here carries a default: an absent flag stays absent so the
/// merger can tell "not given" from "given the default value".
#[derive(Args, Debug, Clone, Default)]
pub struct DaemonArgs {
    /// Configuration file (falls back to /etc/rkd/config.json when that exists)
    #[arg(long = "config-file", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Address to listen on, e.g. unix:///var/run/rkd.sock or tcp://0.0.0.0:2376
    #[arg(short = 'l', long = "listen", value_name = "ADDR")]
    pub listen: Vec<String>,

    /// Daemon label in key=value form
    #[arg(long = "label", value_name = "KEY=VALUE")]
    pub labels: Vec<String>,

    /// Register an additional OCI runtime
    #[arg(long = "add-runtime", value_name = "NAME=PATH")]
    pub runtimes: Vec<String>,

    /// Trust certs signed only by this CA
    #[arg(long, value_name = "PATH")]
    pub tlscacert: Option<String>,

    /// Path to the TLS certificate file
    #[arg(long, value_name = "PATH")]
    pub tlscert: Option<String>,

    /// Path to the TLS key file
    #[arg(long, value_name = "PATH")]
    pub tlskey: Option<String>,

    /// Require and verify client certificates
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub tlsverify: Option<bool>,

    /// Common name of the manager allowed to connect over TLS
    #[arg(long = "manager-whitelist", value_name = "NAME")]
    pub manager_whitelist: Option<String>,

    /// Path of the containerd binary
    #[arg(long = "containerd-path", value_name = "PATH")]
    pub containerd_path: Option<String>,

    /// Cgroup driver, cgroupfs or systemd
    #[arg(
        long = "cgroup-driver",
        value_name = "DRIVER",
        value_parser = ["cgroupfs", "systemd"]
    )]
    pub cgroup_driver: Option<String>,

    /// Parent cgroup of all containers
    #[arg(long = "cgroup-parent", value_name = "CGROUP")]
    pub cgroup_parent: Option<String>,

    /// Serve the CRI endpoint
    #[arg(long = "enable-cri", num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub enable_cri: Option<bool>,

    /// Enable debug logging
    #[arg(short = 'D', long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub debug: Option<bool>,

    /// Root directory of daemon state
    #[arg(long = "home-dir", value_name = "PATH")]
    pub home_dir: Option<String>,

    /// File holding the daemon pid
    #[arg(long, value_name = "PATH")]
    pub pidfile: Option<String>,

    /// Registry used for unqualified image names
    #[arg(long = "default-registry", value_name = "HOST")]
    pub default_registry: Option<String>,

    /// Namespace used for unqualified image names
    #[arg(long = "default-registry-namespace", value_name = "NAMESPACE")]
    pub default_registry_namespace: Option<String>,

    /// Maximum concurrent image layer downloads
    #[arg(long = "max-concurrent-downloads", value_name = "N")]
    pub max_concurrent_downloads: Option<i64>,
}

impl DaemonArgs {
    /// The file to read, if any.
    pub fn config_file_path(&self) -> Option<PathBuf> {
        match &self.config_file {
            Some(path) => Some(path.clone()),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                fallback.is_file().then(|| fallback.to_path_buf())
            }
        }
    }

    pub fn to_fragment(&self) -> Result<ConfigFragment, DaemonError> {
        let mut fragment = ConfigFragment::new(Provenance::Cli);

        for addr in &self.listen {
            fragment.add_to_set(spec(LISTEN), addr.clone());
        }
        for label in &self.labels {
            split_key_value(Provenance::Cli, LABEL, label, false)?;
            fragment.add_to_set(spec(LABEL), label.clone());
        }
        for runtime in &self.runtimes {
            let (name, path) = split_key_value(Provenance::Cli, ADD_RUNTIME, runtime, true)?;
            fragment.push_mapping(spec(ADD_RUNTIME), name, path);
        }

        let tls = [
            (TLS_CA, self.tlscacert.clone().map(Scalar::Str)),
            (TLS_CERT, self.tlscert.clone().map(Scalar::Str)),
            (TLS_KEY, self.tlskey.clone().map(Scalar::Str)),
            (TLS_VERIFY, self.tlsverify.map(Scalar::Bool)),
            (MANAGER_WHITELIST, self.manager_whitelist.clone().map(Scalar::Str)),
        ];
        for (sub_field, value) in tls {
            if let Some(value) = value {
                fragment.set_nested(spec(TLS), sub_field, value);
            }
        }

        let scalars = [
            (CONTAINERD_PATH, self.containerd_path.clone().map(Scalar::Str)),
            (CGROUP_DRIVER, self.cgroup_driver.clone().map(Scalar::Str)),
            (CGROUP_PARENT, self.cgroup_parent.clone().map(Scalar::Str)),
            (ENABLE_CRI, self.enable_cri.map(Scalar::Bool)),
            (DEBUG, self.debug.map(Scalar::Bool)),
            (HOME_DIR, self.home_dir.clone().map(Scalar::Str)),
            (PIDFILE, self.pidfile.clone().map(Scalar::Str)),
            (DEFAULT_REGISTRY, self.default_registry.clone().map(Scalar::Str)),
            (
                DEFAULT_REGISTRY_NAMESPACE,
                self.default_registry_namespace.clone().map(Scalar::Str),
            ),
            (
                MAX_CONCURRENT_DOWNLOADS,
                self.max_concurrent_downloads.map(Scalar::Int),
            ),
        ];
        for (name, value) in scalars {
            if let Some(value) = value {
                check_scalar(Provenance::Cli, name, &value)?;
                fragment.set_scalar(spec(name), value);
            }
        }

        Ok(fragment)
    }
}
