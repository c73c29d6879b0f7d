//! rustls client side of the encrypted transport.

use crate::config;
use crate::errors::TransportError;
use std::net::TcpStream;
use std::time::Duration;

pub(crate) type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

mod provider {
    use crate::errors::TransportError;
    use rustls::ClientConfig;
    use std::sync::{Arc, OnceLock};

    static CLIENT_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    fn build() -> Result<ClientConfig, TransportError> {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|err| TransportError::TlsHandshakeFailed(err.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(config)
    }

    /// Shared client configuration, built on first use.
    pub(crate) fn client_config() -> Result<Arc<ClientConfig>, TransportError> {
        if let Some(config) = CLIENT_CONFIG.get() {
            return Ok(config.clone());
        }
        let built = Arc::new(build()?);
        Ok(CLIENT_CONFIG.get_or_init(|| built).clone())
    }
}

/// Bound on the handshake: the connect timeout, else the process-wide
/// streaming timeout.
fn handshake_window(timeout: Option<Duration>) -> Duration {
    timeout
        .unwrap_or_else(|| config::global().timeout())
        .max(Duration::from_millis(1))
}

/// Runs the TLS handshake over an already connected TCP stream.
///
/// The handshake completes before this returns so certificate failures
/// surface from `connect` rather than from the first read. A peer that stops
/// answering fails the handshake once [`handshake_window`] passes without
/// progress.
pub(crate) fn handshake(
    mut tcp: TcpStream,
    hostname: &str,
    timeout: Option<Duration>,
) -> Result<TlsStream, TransportError> {
    use rustls::pki_types::ServerName;

    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|err| TransportError::TlsHandshakeFailed(format!("{hostname}: {err}")))?;
    let mut connection = rustls::ClientConnection::new(provider::client_config()?, server_name)
        .map_err(|err| TransportError::TlsHandshakeFailed(err.to_string()))?;

    let window = handshake_window(timeout);
    tcp.set_read_timeout(Some(window))?;
    tcp.set_write_timeout(Some(window))?;
    while connection.is_handshaking() {
        connection
            .complete_io(&mut tcp)
            .map_err(|err| TransportError::TlsHandshakeFailed(format!("{hostname}: {err}")))?;
    }
    tcp.set_read_timeout(None)?;
    tcp.set_write_timeout(None)?;

    debug!("tls handshake with {} complete", hostname);
    Ok(rustls::StreamOwned::new(connection, tcp))
}
