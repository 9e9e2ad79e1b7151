//! Live output channel of an interactive exec.
//!
//! LXD exposes the combined stdout/stderr of an interactive exec as a
//! WebSocket at `/1.0/operations/{id}/websocket?secret={fd0}`. The transport
//! consumes it through [`ExecChannel`], which reduces the socket to the few
//! events it acts on.

use super::{LxdError, Result};
use crate::config::LxdConfig;
use async_trait::async_trait;
use futures::StreamExt;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// Events surfaced by an exec output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel connected. Always the first event.
    Opened,
    /// Output bytes. An empty frame marks the end of the output.
    Data(Vec<u8>),
    /// Peer closed the channel
    Closed(Option<String>),
    /// Transport-level error. The channel may still produce events.
    Error(String),
}

/// A connected output channel.
#[async_trait]
pub trait ExecChannel: Send {
    /// Next event, or `None` once the channel is exhausted.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    /// Close the channel. Closing an already closed channel succeeds.
    async fn close(&mut self) -> Result<()>;
}

/// Opens [`ExecChannel`]s.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn ExecChannel>>;
}

/// Stream URL for an exec operation: the API URL with its scheme switched
/// to `ws`/`wss` and the operation websocket path appended.
pub fn stream_url(api: &Url, operation_id: &str, secret: &str) -> Result<Url> {
    let mut url = super::client::endpoint_url(api, &["operations", operation_id, "websocket"])?;

    let scheme = match api.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(LxdError::InvalidEndpoint(format!(
                "no stream scheme for {}",
                other
            )));
        }
    };

    url.set_scheme(scheme)
        .map_err(|_| LxdError::InvalidEndpoint(api.to_string()))?;
    url.query_pairs_mut().append_pair("secret", secret);
    Ok(url)
}

/// [`ChannelConnector`] over WebSockets, authenticating with the same client
/// certificate as the REST client.
#[derive(Clone)]
pub struct WebSocketConnector {
    tls: Arc<ClientConfig>,
}

impl WebSocketConnector {
    /// Build a connector from configuration.
    ///
    /// The client key may be PKCS#8, PKCS#1 (RSA) or SEC1 (EC) PEM, the
    /// formats the REST client accepts.
    ///
    /// # Errors
    ///
    /// Returns error if the client certificate exists but cannot be read or
    /// parsed, or the TLS configuration is rejected.
    pub fn from_config(config: &LxdConfig) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder =
            ClientConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

        let builder = if config.verify_ssl {
            let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        };

        let tls = match load_identity(&config.client_cert, &config.client_key)? {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
            None => builder.with_no_client_auth(),
        };

        Ok(Self { tls: Arc::new(tls) })
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn ExecChannel>> {
        debug!("Connecting exec stream {}", url.path());

        let (stream, _) = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            Some(Connector::Rustls(self.tls.clone())),
        )
        .await?;

        Ok(Box::new(WebSocketChannel {
            stream,
            opened: false,
            finished: false,
        }))
    }
}

fn load_identity(
    cert: &Path,
    key: &Path,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
    if !cert.exists() || !key.exists() {
        return Ok(None);
    }

    let invalid = |path: &Path, e: rustls::pki_types::pem::Error| LxdError::Identity {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let certs = CertificateDer::pem_file_iter(cert)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| invalid(cert, e))?;
    if certs.is_empty() {
        return Err(LxdError::Identity {
            path: cert.to_path_buf(),
            message: "no certificate found".to_string(),
        });
    }

    let key_der = PrivateKeyDer::from_pem_file(key).map_err(|e| invalid(key, e))?;
    Ok(Some((certs, key_der)))
}

/// Server verifier for `verify_ssl = false`: LXD servers usually present
/// self-signed certificates. Handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    opened: bool,
    finished: bool,
}

#[async_trait]
impl ExecChannel for WebSocketChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if !self.opened {
            self.opened = true;
            return Some(ChannelEvent::Opened);
        }

        if self.finished {
            return None;
        }

        loop {
            let Some(message) = self.stream.next().await else {
                self.finished = true;
                return None;
            };

            match message {
                Ok(Message::Binary(payload)) => return Some(ChannelEvent::Data(payload.to_vec())),
                Ok(Message::Text(payload)) => {
                    return Some(ChannelEvent::Data(payload.as_bytes().to_vec()));
                }
                Ok(Message::Close(frame)) => {
                    self.finished = true;
                    return Some(ChannelEvent::Closed(
                        frame.map(|frame| frame.reason.to_string()),
                    ));
                }
                // Ping/pong are answered by tungstenite itself.
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.finished = true;
                    return Some(ChannelEvent::Closed(None));
                }
                Err(e) => return Some(ChannelEvent::Error(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => {
                warn!("Failed to close exec stream cleanly: {}", e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lxd::LxdClient;
    use tempfile::TempDir;

    const CLIENT_CERT: &str = include_str!("../../tests/fixtures/client_ec.crt");
    const SEC1_KEY: &str = include_str!("../../tests/fixtures/client_ec.key");
    const PKCS8_KEY: &str = include_str!("../../tests/fixtures/client_ec_pkcs8.key");

    fn config_with_identity(dir: &TempDir, key: &str) -> LxdConfig {
        let mut config = LxdConfig::new("https://lxd.local:8443").unwrap();
        config.client_cert = dir.path().join("client.crt");
        config.client_key = dir.path().join("client.key");
        std::fs::write(&config.client_cert, CLIENT_CERT).unwrap();
        std::fs::write(&config.client_key, key).unwrap();
        config
    }

    #[test]
    fn test_ec_key_accepted_by_both_clients() {
        let dir = TempDir::new().unwrap();
        let config = config_with_identity(&dir, SEC1_KEY);

        assert!(LxdClient::from_config(&config).is_ok());
        assert!(WebSocketConnector::from_config(&config).is_ok());
    }

    #[test]
    fn test_pkcs8_key_accepted_by_both_clients() {
        let dir = TempDir::new().unwrap();
        let config = config_with_identity(&dir, PKCS8_KEY);

        assert!(LxdClient::from_config(&config).is_ok());
        assert!(WebSocketConnector::from_config(&config).is_ok());
    }

    #[test]
    fn test_connector_with_verification() {
        let dir = TempDir::new().unwrap();
        let mut config = config_with_identity(&dir, SEC1_KEY);
        config.verify_ssl = true;

        assert!(WebSocketConnector::from_config(&config).is_ok());
    }

    #[test]
    fn test_connector_rejects_garbage_key() {
        let dir = TempDir::new().unwrap();
        let config = config_with_identity(&dir, "not a key\n");

        let err = WebSocketConnector::from_config(&config).err().unwrap();
        assert!(matches!(err, LxdError::Identity { ref path, .. } if path == &config.client_key));
    }

    #[test]
    fn test_connector_without_identity() {
        let mut config = LxdConfig::new("https://lxd.local:8443").unwrap();
        config.client_cert = "/nonexistent/client.crt".into();
        config.client_key = "/nonexistent/client.key".into();

        assert!(WebSocketConnector::from_config(&config).is_ok());
    }

    #[test]
    fn test_stream_url_secure() {
        let api = Url::parse("https://lxd.local:8443").unwrap();
        let url = stream_url(&api, "op-1", "s3cret").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://lxd.local:8443/1.0/operations/op-1/websocket?secret=s3cret"
        );
    }

    #[test]
    fn test_stream_url_plain() {
        let api = Url::parse("http://127.0.0.1:8443/").unwrap();
        let url = stream_url(&api, "op-2", "abc").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:8443/1.0/operations/op-2/websocket?secret=abc"
        );
    }

    #[test]
    fn test_stream_url_encodes_secret() {
        let api = Url::parse("https://lxd.local:8443").unwrap();
        let url = stream_url(&api, "op", "a&b=c").unwrap();
        assert_eq!(url.query(), Some("secret=a%26b%3Dc"));
    }
}
