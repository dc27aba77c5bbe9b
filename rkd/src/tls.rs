use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::config::{MANAGER_WHITELIST, TLS_CA, TLS_CERT, TLS_KEY, TLS_VERIFY};
use crate::error::DaemonError;
use crate::listener::ListenAddr;

/// TLS part of the effective configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub verify: bool,
    pub manager_whitelist: Option<String>,
}

impl TlsSettings {
    pub fn is_enabled(&self) -> bool {
        self.cert.is_some() || self.key.is_some() || self.ca.is_some() || self.verify
    }

    /// Checks that the CA, certificate, key and verify flag make sense together.
    pub fn validate(&self) -> Result<(), DaemonError> {
        let inconsistent = |field: &str, reason: &str| {
            Err(DaemonError::InconsistentTls {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };
        match (&self.cert, &self.key) {
            (Some(_), None) => return inconsistent(TLS_KEY, "tlscert is set without tlskey"),
            (None, Some(_)) => return inconsistent(TLS_CERT, "tlskey is set without tlscert"),
            _ => {}
        }
        if self.verify && self.ca.is_none() {
            return inconsistent(TLS_CA, "tlsverify requires tlscacert");
        }
        if self.verify && self.cert.is_none() {
            return inconsistent(TLS_CERT, "tlsverify requires tlscert and tlskey");
        }
        if self.ca.is_some() && !self.verify {
            return inconsistent(TLS_VERIFY, "tlscacert is only used together with tlsverify");
        }
        if self.manager_whitelist.is_some() && !self.verify {
            return inconsistent(
                MANAGER_WHITELIST,
                "manager-whitelist requires tlsverify",
            );
        }
        Ok(())
    }
}

pub fn init_crypto() {
    // a provider may already be installed by an earlier call
    let _ = CryptoProvider::install_default(rustls::crypto::ring::default_provider());
}

fn bad_certificate(path: &Path, reason: impl Into<String>) -> DaemonError {
    DaemonError::BadCertificate {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, DaemonError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| bad_certificate(path, format!("failed to read certificates: {e}")))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| bad_certificate(path, format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(bad_certificate(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, DaemonError> {
    PrivateKeyDer::from_pem_file(path)
        .map_err(|e| bad_certificate(path, format!("failed to load private key: {e}")))
}

/// Loads a CA bundle. Unreadable files and bundles without a usable
/// certificate are both reported as a failure to append certificates.
fn load_roots(path: &Path) -> Result<RootCertStore, DaemonError> {
    let certs: Vec<_> = CertificateDer::pem_file_iter(path)
        .map_err(|e| bad_certificate(path, format!("failed to append certificates: {e}")))?
        .filter_map(Result::ok)
        .collect();
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(bad_certificate(
            path,
            format!("failed to append certificates ({ignored} unusable)"),
        ));
    }
    Ok(roots)
}

/// Builds the acceptor for TCP listeners, or `None` when TLS is off.
pub fn server_acceptor(settings: &TlsSettings) -> Result<Option<TlsAcceptor>, DaemonError> {
    let (Some(cert), Some(key)) = (&settings.cert, &settings.key) else {
        return Ok(None);
    };
    init_crypto();

    let certs = load_certs(cert)?;
    let key_der = load_key(key)?;
    let builder = ServerConfig::builder();
    let builder = match (&settings.ca, settings.verify) {
        (Some(ca), true) => {
            let roots = load_roots(ca)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| bad_certificate(ca, e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        _ => builder.with_no_client_auth(),
    };
    let config = builder
        .with_single_cert(certs, key_der)
        .map_err(|e| bad_certificate(cert, e.to_string()))?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

/// TCP listener terminating TLS before handing connections to axum.
pub struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsListener {
    pub fn new(inner: TcpListener, acceptor: TlsAcceptor) -> Self {
        TlsListener {
            inner,
            acceptor,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = tokio_rustls::server::TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, peer) = match self.inner.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            match timeout(self.handshake_timeout, self.acceptor.accept(stream)).await {
                Ok(Ok(tls)) => return (tls, peer),
                Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake failed"),
                Err(_) => debug!(%peer, "TLS handshake timed out"),
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// Client-side TLS material for `rkd ping`.
#[derive(Debug, Clone, Default)]
pub struct ClientTls {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl ClientTls {
    pub fn is_set(&self) -> bool {
        self.ca.is_some() || self.cert.is_some() || self.key.is_some()
    }

    /// The CA bundle is only read here, when a connection is about to be made.
    pub fn client_config(&self) -> Result<ClientConfig, DaemonError> {
        init_crypto();
        let roots = match &self.ca {
            Some(ca) => load_roots(ca)?,
            None => RootCertStore::empty(),
        };
        let builder = ClientConfig::builder().with_root_certificates(roots);
        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .map_err(|e| bad_certificate(cert, e.to_string())),
            _ => Ok(builder.with_no_client_auth()),
        }
    }
}

const PING_REQUEST: &[u8] = b"GET /_ping HTTP/1.1\r\nHost: rkd\r\nConnection: close\r\n\r\n";

async fn exchange<S>(mut stream: S) -> io::Result<(u16, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(PING_REQUEST).await?;
    stream.flush().await?;

    let mut buf = Vec::new();
    match stream.read_to_end(&mut buf).await {
        Ok(_) => {}
        // peers that close without close_notify
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && !buf.is_empty() => {}
        Err(e) => return Err(e),
    }

    let response = String::from_utf8_lossy(&buf);
    let status = response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed HTTP response"))?;
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

/// Connects to a daemon like a client would and returns the `/_ping` body.
pub async fn ping(
    addr: &ListenAddr,
    tls: Option<&ClientTls>,
    limit: Duration,
) -> Result<String, DaemonError> {
    let handshake_failed = |reason: String| DaemonError::HandshakeFailed {
        address: addr.to_string(),
        reason,
    };

    let attempt = async {
        let reply: Result<(u16, String), DaemonError> = match (addr, tls) {
            (ListenAddr::Unix(path), _) => Ok(exchange(UnixStream::connect(path).await?).await?),
            (ListenAddr::Tcp { port, .. }, None) => {
                let host = addr.connect_host().unwrap_or("127.0.0.1");
                Ok(exchange(TcpStream::connect((host, *port)).await?).await?)
            }
            (ListenAddr::Tcp { port, .. }, Some(tls)) => {
                let config = tls.client_config()?;
                let host = addr.connect_host().unwrap_or("127.0.0.1");
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|e| handshake_failed(e.to_string()))?;
                let tcp = TcpStream::connect((host, *port)).await?;
                let stream = TlsConnector::from(Arc::new(config))
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| handshake_failed(e.to_string()))?;
                // with TLS 1.3 a rejected client certificate surfaces on first read
                exchange(stream)
                    .await
                    .map_err(|e| handshake_failed(e.to_string()))
            }
        };
        reply
    };

    let (status, body) = timeout(limit, attempt)
        .await
        .map_err(|_| DaemonError::Other(anyhow!("no reply from {addr} within {limit:?}")))??;
    if status != 200 {
        return Err(DaemonError::Other(anyhow!(
            "{addr} answered /_ping with status {status}"
        )));
    }
    Ok(body)
}
