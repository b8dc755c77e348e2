use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::ConnectInfo, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tower::util::ServiceExt;
use tracing::{debug, info, warn};

use crate::config::TlsConfig;

/// Build a rustls server configuration from the configured PEM key pair.
pub fn load_server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(&config.cert_file).with_context(
            || format!("Failed to open TLS certificate file: {}", config.cert_file),
        )?))
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("Failed to parse TLS certificates: {}", config.cert_file))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", config.cert_file);
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(&config.key_file).with_context(
            || format!("Failed to open TLS key file: {}", config.key_file),
        )?))
        .with_context(|| format!("Failed to parse TLS key: {}", config.key_file))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", config.key_file))?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS key pair")?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(server_config))
}

/// Serve the router over TLS. Each accepted connection is handshaked and
/// driven on its own task; the client source address is injected so the rate
/// limiter and handlers still see it. The accept loop stops when the
/// shutdown token fires; established connections drain on their own tasks.
pub async fn serve(
    listener: TcpListener,
    server_config: Arc<ServerConfig>,
    app: Router,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(server_config);

    info!("TLS listener ready");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("TLS listener stopped accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |mut request: hyper::Request<hyper::body::Incoming>| {
                request.extensions_mut().insert(ConnectInfo(peer_addr));
                app.clone().oneshot(request)
            });

            if let Err(e) = ConnectionBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                .await
            {
                debug!(peer = %peer_addr, error = %e, "connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_file_fails() {
        let config = TlsConfig {
            enabled: true,
            cert_file: "/nonexistent/cert.pem".to_string(),
            key_file: "/nonexistent/key.pem".to_string(),
        };
        assert!(load_server_config(&config).is_err());
    }
}
