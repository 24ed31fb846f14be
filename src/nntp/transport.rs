//! Plain and TLS byte streams
//!
//! Workers only ever see a [`BoxedStream`]; whether it is a TCP socket, a TLS
//! session or an in-memory duplex makes no difference to scheduling.

use crate::error::{Error, Result};
use rustls::pki_types::ServerName;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Any bidirectional byte stream a worker can drive
pub trait NntpStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> NntpStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased connection stream
pub type BoxedStream = Box<dyn NntpStream>;

static TLS_CONFIG: OnceLock<std::result::Result<Arc<rustls::ClientConfig>, String>> =
    OnceLock::new();

fn tls_config() -> Result<Arc<rustls::ClientConfig>> {
    TLS_CONFIG
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map(|builder| {
                Arc::new(
                    builder
                        .with_root_certificates(roots)
                        .with_no_client_auth(),
                )
            })
            .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(|e| Error::Transport(format!("TLS setup failed: {}", e)))
}

/// Open a connection to `host:port`, wrapping it in TLS when `secure`
pub async fn connect(host: &str, port: u16, secure: bool) -> Result<BoxedStream> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::Transport(format!("connect to {}:{} failed: {}", host, port, e)))?;

    if let Err(e) = tcp.set_nodelay(true) {
        tracing::debug!(host = %host, error = %e, "Failed to set TCP_NODELAY");
    }

    if !secure {
        return Ok(Box::new(tcp));
    }

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Transport(format!("invalid TLS server name {}: {}", host, e)))?;

    let stream = TlsConnector::from(tls_config()?)
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Transport(format!("TLS handshake with {} failed: {}", host, e)))?;

    Ok(Box::new(stream))
}
