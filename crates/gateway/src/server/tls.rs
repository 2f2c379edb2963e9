//! HTTPS accept loop

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http::HttpResponse;
use super::ServeError;
use crate::certs::KeypairReloader;

/// rustls configuration that asks the reloader for a certificate on every
/// handshake
pub fn server_config(reloader: Arc<KeypairReloader>) -> Result<Arc<ServerConfig>, ServeError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(reloader);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServeError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })
}

/// Accept TLS connections and serve HTTP/1.1 until `shutdown` fires.
///
/// A failed handshake only drops that connection.
pub async fn serve<H, Fut>(
    name: &'static str,
    listener: TcpListener,
    tls: Arc<ServerConfig>,
    handler: H,
    shutdown: CancellationToken,
) where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse, Infallible>> + Send + 'static,
{
    let acceptor = TlsAcceptor::from(tls);
    if let Ok(addr) = listener.local_addr() {
        info!(listener = name, address = %addr, "HTTPS listening");
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(listener = name, "Listener stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(listener = name, error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let acceptor = acceptor.clone();
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!(listener = name, peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let connection = http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service_fn(handler));
            tokio::pin!(connection);

            tokio::select! {
                result = connection.as_mut() => {
                    if let Err(e) = result {
                        debug!(listener = name, peer = %peer, error = %e, "Connection error");
                    }
                }
                _ = shutdown.cancelled() => {
                    connection.as_mut().graceful_shutdown();
                    let _ = connection.await;
                }
            }
        });
    }
}
