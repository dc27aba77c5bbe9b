use super::{
    ADD_RUNTIME, CGROUP_DRIVER, CGROUP_PARENT, CONTAINERD_PATH, ConfigFragment, DEBUG,
    DEFAULT_REGISTRY, DEFAULT_REGISTRY_NAMESPACE, ENABLE_CRI, HOME_DIR, LISTEN,
    MAX_CONCURRENT_DOWNLOADS, PIDFILE, Provenance, Scalar, spec,
};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/rkd/config.json";
pub const DEFAULT_LISTEN: &str = "unix:///var/run/rkd.sock";
pub const DEFAULT_HOME_DIR: &str = "/var/lib/rkd";
pub const DEFAULT_PIDFILE: &str = "/var/run/rkd.pid";
pub const DEFAULT_RUNTIME: (&str, &str) = ("runc", "runc");

/// The lowest-precedence fragment. TLS is off unless asked for.
pub fn fragment() -> ConfigFragment {
    let mut fragment = ConfigFragment::new(Provenance::Default);
    fragment.add_to_set(spec(LISTEN), DEFAULT_LISTEN.to_string());
    fragment.touch_set(spec(super::LABEL));
    fragment.push_mapping(
        spec(ADD_RUNTIME),
        DEFAULT_RUNTIME.0.to_string(),
        DEFAULT_RUNTIME.1.to_string(),
    );

    let str_defaults = [
        (CONTAINERD_PATH, "containerd"),
        (CGROUP_DRIVER, "cgroupfs"),
        (CGROUP_PARENT, "default"),
        (HOME_DIR, DEFAULT_HOME_DIR),
        (PIDFILE, DEFAULT_PIDFILE),
        (DEFAULT_REGISTRY, "registry.hub.docker.com"),
        (DEFAULT_REGISTRY_NAMESPACE, "library"),
    ];
    for (name, value) in str_defaults {
        fragment.set_scalar(spec(name), Scalar::Str(value.to_string()));
    }
    fragment.set_scalar(spec(ENABLE_CRI), Scalar::Bool(false));
    fragment.set_scalar(spec(DEBUG), Scalar::Bool(false));
    fragment.set_scalar(spec(MAX_CONCURRENT_DOWNLOADS), Scalar::Int(3));
    fragment
}
