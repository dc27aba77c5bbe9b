//! `rkd daemon`: the process the supervisor launches.
//!
//! Holds the pidfile lock, binds every listen address and serves the status
//! router until SIGTERM or SIGINT.

pub mod pidfile;
pub mod status;

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::Router;
use futures::future::join_all;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EffectiveConfig;
use crate::error::DaemonError;
use crate::listener::{self, BoundListener};
use crate::tls::{self, TlsListener};
use self::pidfile::PidFile;

pub async fn run(config: EffectiveConfig) -> Result<(), DaemonError> {
    run_until(config, shutdown_signal()).await
}

/// Runs the daemon until `shutdown` resolves.
pub async fn run_until(
    config: EffectiveConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<(), DaemonError> {
    config.tls.validate()?;
    let endpoints = config.listen_addrs()?;
    let acceptor = tls::server_acceptor(&config.tls)?;

    let pidfile = PidFile::acquire(&config.pidfile)?;
    info!(pid = std::process::id(), pidfile = %pidfile.path().display(), "daemon starting");

    let mut bound = Vec::with_capacity(endpoints.len());
    for endpoint in &endpoints {
        let listener = match listener::bind(endpoint).await {
            Ok(listener) => listener,
            Err(e) => {
                cleanup(&bound);
                return Err(e);
            }
        };
        let tls = acceptor.is_some() && endpoint.is_tcp();
        info!(address = %endpoint, tls, "listening");
        bound.push(listener);
    }

    let socket_paths: Vec<_> = bound
        .iter()
        .filter_map(|l| match l {
            BoundListener::Unix(_, path) => Some(path.clone()),
            BoundListener::Tcp(_) => None,
        })
        .collect();

    let router = status::router(Arc::new(config));
    let token = CancellationToken::new();
    let servers: Vec<_> = bound
        .into_iter()
        .map(|listener| {
            tokio::spawn(serve(
                listener,
                router.clone(),
                acceptor.clone(),
                token.clone(),
            ))
        })
        .collect();

    shutdown.await;
    info!("shutting down");
    token.cancel();

    for result in join_all(servers).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "listener failed"),
            Err(e) => error!(error = %e, "listener task panicked"),
        }
    }
    for path in &socket_paths {
        BoundListener::cleanup(path);
    }
    drop(pidfile);
    info!("daemon stopped");
    Ok(())
}

fn cleanup(bound: &[BoundListener]) {
    for listener in bound {
        if let BoundListener::Unix(_, path) = listener {
            BoundListener::cleanup(path);
        }
    }
}

async fn serve(
    listener: BoundListener,
    router: Router,
    acceptor: Option<TlsAcceptor>,
    token: CancellationToken,
) -> io::Result<()> {
    let shutdown = token.cancelled_owned();
    match (listener, acceptor) {
        (BoundListener::Tcp(listener), Some(acceptor)) => {
            axum::serve(TlsListener::new(listener, acceptor), router)
                .with_graceful_shutdown(shutdown)
                .await
        }
        (BoundListener::Tcp(listener), None) => {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
        }
        (BoundListener::Unix(listener, _), _) => {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
