//! Status listener.
//!
//! # Responsibilities
//! - Answer the connectivity checks (`/generate_204`, `/generate_200`)
//! - Bind the public port, retrying while it is taken
//! - Serve over TLS when the config carries key and certificate

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::EffectiveConfig;
use crate::lifecycle::ShutdownSignal;

const BIND_RETRY: Duration = Duration::from_secs(1);
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// PEM material for the TLS listener.
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert: String,
    pub key: String,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlsMaterial(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub enum ListenMode {
    Plain,
    Tls(TlsMaterial),
    /// TLS requested without key or certificate; nothing is served.
    TlsMissing,
}

impl ListenMode {
    pub fn from_config(config: &EffectiveConfig) -> Self {
        if !config.tls_enabled {
            return ListenMode::Plain;
        }
        match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => ListenMode::Tls(TlsMaterial {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => ListenMode::TlsMissing,
        }
    }
}

/// The connectivity check endpoints.
pub fn status_router() -> Router {
    Router::new()
        .route("/generate_204", get(|| async { StatusCode::NO_CONTENT }))
        .route("/generate_200", get(|| async { StatusCode::OK }))
        .route("/generate_200/{*rest}", get(|| async { StatusCode::OK }))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr`, waiting out "address in use" one second at a time.
pub async fn bind_with_retry(addr: SocketAddr) -> io::Result<TcpListener> {
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                tracing::error!(%addr, "[Main] Listening Port Failed: Address in use, retrying...");
                tokio::time::sleep(BIND_RETRY).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Public-port listener serving [`status_router`].
#[derive(Debug, Clone)]
pub struct StatusServer {
    addr: SocketAddr,
    mode: ListenMode,
}

impl StatusServer {
    pub fn new(addr: SocketAddr, mode: ListenMode) -> Self {
        Self { addr, mode }
    }

    pub fn from_config(config: &EffectiveConfig) -> Self {
        Self::new(
            SocketAddr::from(([0, 0, 0, 0], config.port)),
            ListenMode::from_config(config),
        )
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> io::Result<()> {
        let tls = match self.mode {
            ListenMode::Plain => None,
            ListenMode::Tls(material) => {
                tracing::info!("[Main] Https Enabled");
                Some(material)
            }
            ListenMode::TlsMissing => {
                tracing::error!("[Main] Https Missing: tls_cert,tls_key");
                return Ok(());
            }
        };

        let listener = tokio::select! {
            bound = bind_with_retry(self.addr) => bound?,
            _ = shutdown.wait() => return Ok(()),
        };
        let local_addr = listener.local_addr()?;
        tracing::info!(address = %local_addr, "[Main] Listening on Port {}", local_addr.port());

        match tls {
            None => {
                axum::serve(listener, status_router())
                    .with_graceful_shutdown(async move { shutdown.wait().await })
                    .await?;
            }
            Some(material) => {
                let rustls = RustlsConfig::from_pem(material.cert.into_bytes(), material.key.into_bytes()).await?;
                let handle = axum_server::Handle::new();
                let signal = handle.clone();
                tokio::spawn(async move {
                    shutdown.wait().await;
                    signal.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
                });

                axum_server::from_tcp_rustls(listener.into_std()?, rustls)
                    .handle(handle)
                    .serve(status_router().into_make_service())
                    .await?;
            }
        }

        tracing::info!("Status listener stopped");
        Ok(())
    }
}
