//! TLS serving boundary
//!
//! Two HTTPS listeners share the [`KeypairReloader`](crate::certs::KeypairReloader)
//! as their certificate resolver:
//!
//! - the application listener issues client certificates
//! - the admin listener answers ping, healthcheck and metrics

pub mod http;
pub mod tls;

use std::net::SocketAddr;

use thiserror::Error;

pub use self::http::{handle_admin, handle_app, HttpResponse, REQUEST_ID_HEADER};
pub use self::tls::{bind, serve, server_config};

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}
