use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::DaemonError;

/// A daemon endpoint, `unix:///abs/path` or `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl ListenAddr {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if let Some(path) = raw.strip_prefix("unix://") {
            if !path.starts_with('/') {
                return Err(format!("`{raw}`: unix socket path must be absolute"));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if let Some(rest) = raw.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| format!("`{raw}`: expected tcp://host:port"))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return Err(format!("`{raw}`: missing host"));
            }
            let port = port
                .parse::<u16>()
                .map_err(|e| format!("`{raw}`: invalid port: {e}"))?;
            return Ok(ListenAddr::Tcp {
                host: host.to_string(),
                port,
            });
        }
        Err(format!(
            "`{raw}`: unsupported address, expected unix:///path or tcp://host:port"
        ))
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, ListenAddr::Tcp { .. })
    }

    /// Host a client dials: wildcard binds are reached over loopback.
    pub fn connect_host(&self) -> Option<&str> {
        match self {
            ListenAddr::Tcp { host, .. } => Some(match host.as_str() {
                "0.0.0.0" => "127.0.0.1",
                "::" => "::1",
                other => other,
            }),
            ListenAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
            ListenAddr::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{host}]:{port}")
            }
            ListenAddr::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

pub enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl BoundListener {
    /// Removes the socket file of a Unix listener.
    pub fn cleanup(path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!(path = %path.display(), error = %e, "failed to remove socket file"),
        }
    }
}

/// Binds `addr` exclusively.
pub async fn bind(addr: &ListenAddr) -> Result<BoundListener, DaemonError> {
    let bind_error = |source: io::Error| {
        if source.kind() == io::ErrorKind::AddrInUse {
            DaemonError::AddressInUse {
                address: addr.to_string(),
            }
        } else {
            DaemonError::Bind {
                address: addr.to_string(),
                source,
            }
        }
    };

    match addr {
        ListenAddr::Tcp { host, port } => {
            let listener = TcpListener::bind((host.as_str(), *port))
                .await
                .map_err(bind_error)?;
            Ok(BoundListener::Tcp(listener))
        }
        ListenAddr::Unix(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(bind_error)?;
            }
            if fs::symlink_metadata(path).is_ok() {
                if UnixStream::connect(path).await.is_ok() {
                    return Err(DaemonError::AddressInUse {
                        address: addr.to_string(),
                    });
                }
                info!(path = %path.display(), "removing stale socket file");
                fs::remove_file(path).map_err(bind_error)?;
            }
            let listener = UnixListener::bind(path).map_err(bind_error)?;
            fs::set_permissions(path, fs::Permissions::from_mode(0o660)).map_err(bind_error)?;
            Ok(BoundListener::Unix(listener, path.clone()))
        }
    }
}

/// True once something accepts a connection on `addr`.
pub async fn answers(addr: &ListenAddr, limit: Duration) -> bool {
    let attempt = async {
        match addr {
            ListenAddr::Tcp { port, .. } => {
                let host = addr.connect_host().unwrap_or("127.0.0.1");
                TcpStream::connect((host, *port)).await.is_ok()
            }
            ListenAddr::Unix(path) => UnixStream::connect(path).await.is_ok(),
        }
    };
    timeout(limit, attempt).await.unwrap_or(false)
}
