//! Byte transport for outgoing federation streams.
//!
//! Wraps a TCP socket (optionally upgraded to TLS via STARTTLS) and frames
//! received bytes into [`StreamEvent`]s. Sends are bounded by the configured
//! send timeout; a timed-out send fails the session rather than blocking it.

use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use crate::config::S2sConfig;
use crate::error::XmppError;
use crate::parser::{element_to_wire, ns, StreamEvent, StreamFramer};

/// The underlying socket, before or after STARTTLS.
enum StreamSocket {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// A connected, framing transport for one outgoing stream.
pub struct Transport {
    socket: StreamSocket,
    framer: StreamFramer,
    send_timeout: Duration,
    peer: SocketAddr,
}

impl Transport {
    /// Connect to the first reachable candidate.
    ///
    /// Candidates are tried in order; each attempt is bounded by
    /// `connect_timeout`. An optional local address is bound before
    /// connecting.
    #[instrument(skip(candidates), fields(candidates = candidates.len()))]
    pub async fn connect(
        candidates: &[SocketAddr],
        local_address: Option<IpAddr>,
        connect_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<Self, XmppError> {
        let mut last_error: Option<XmppError> = None;

        for addr in candidates {
            match timeout(connect_timeout, open_socket(*addr, local_address)).await {
                Ok(Ok(stream)) => {
                    debug!(peer = %addr, "connected");
                    return Ok(Self {
                        socket: StreamSocket::Tcp(stream),
                        framer: StreamFramer::new(),
                        send_timeout,
                        peer: *addr,
                    });
                }
                Ok(Err(error)) => {
                    debug!(peer = %addr, error = %error, "connect failed");
                    last_error = Some(XmppError::Io(error));
                }
                Err(_) => {
                    debug!(peer = %addr, "connect timed out");
                    last_error = Some(XmppError::timeout(format!("connect to {}", addr)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| XmppError::dns("no connect candidates")))
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the stream has been upgraded to TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.socket, StreamSocket::Tls(_))
    }

    /// Send raw bytes, bounded by the send timeout.
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<(), XmppError> {
        let write = async {
            match &mut self.socket {
                StreamSocket::Tcp(stream) => {
                    stream.write_all(data).await?;
                    stream.flush().await
                }
                StreamSocket::Tls(stream) => {
                    stream.write_all(data).await?;
                    stream.flush().await
                }
            }
        };
        match timeout(self.send_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(XmppError::Io(error)),
            Err(_) => Err(XmppError::timeout("socket send")),
        }
    }

    /// Serialize and send a stanza, dropping the redundant stream-default
    /// namespace declaration.
    pub async fn send_element(&mut self, element: &minidom::Element) -> Result<(), XmppError> {
        let wire = element_to_wire(element, ns::JABBER_SERVER);
        self.send_raw(wire.as_bytes()).await
    }

    /// Read the next framed event; `None` means the peer closed the socket.
    pub async fn read_event(&mut self) -> Result<Option<StreamEvent>, XmppError> {
        loop {
            if let Some(event) = self.framer.next_event()? {
                return Ok(Some(event));
            }

            let mut buf = [0u8; 4096];
            let n = match &mut self.socket {
                StreamSocket::Tcp(stream) => stream.read(&mut buf).await?,
                StreamSocket::Tls(stream) => stream.read(&mut buf).await?,
            };
            if n == 0 {
                return Ok(None);
            }
            self.framer.feed(&buf[..n]);
        }
    }

    /// Restart XML framing; used after STARTTLS and after SASL success.
    pub fn reset_framer(&mut self) {
        self.framer.reset();
    }

    /// Upgrade the plaintext socket via TLS. Consumes the transport and
    /// returns it TLS-wrapped with fresh framing state.
    pub async fn upgrade_tls(
        self,
        connector: &TlsConnector,
        server_name: &str,
    ) -> Result<Self, XmppError> {
        let stream = match self.socket {
            StreamSocket::Tcp(stream) => stream,
            StreamSocket::Tls(_) => {
                return Err(XmppError::stream("stream is already TLS"));
            }
        };

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| XmppError::config(format!("invalid TLS server name: {}", e)))?;
        let tls = connector
            .connect(name, stream)
            .await
            .map_err(XmppError::Io)?;

        Ok(Self {
            socket: StreamSocket::Tls(Box::new(tls)),
            framer: StreamFramer::new(),
            send_timeout: self.send_timeout,
            peer: self.peer,
        })
    }

    /// Close the socket, ignoring shutdown errors on an already-dead peer.
    pub async fn close(mut self) {
        let _ = self.send_raw(b"</stream:stream>").await;
        let result = match &mut self.socket {
            StreamSocket::Tcp(stream) => stream.shutdown().await,
            StreamSocket::Tls(stream) => stream.shutdown().await,
        };
        if let Err(error) = result {
            debug!(error = %error, "socket shutdown failed");
        }
    }
}

async fn open_socket(
    addr: SocketAddr,
    local_address: Option<IpAddr>,
) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(local) = local_address {
        // Only bind when the families line up; a v4 local address cannot
        // source a v6 connection.
        if local.is_ipv4() == addr.is_ipv4() {
            socket.bind(SocketAddr::new(local, 0))?;
        }
    }
    socket.connect(addr).await
}

/// Build the TLS connector for outgoing streams from the S2S configuration.
///
/// Presents the local domain's certificate for SASL EXTERNAL when one is
/// configured; uses the bundled web PKI roots unless verification is
/// disabled.
pub fn build_tls_connector(
    config: &S2sConfig,
    local_domain: &str,
) -> Result<TlsConnector, XmppError> {
    let client_cert = match config.certfile_for(local_domain) {
        Some(path) => Some(load_cert_and_key(path)?),
        None => None,
    };

    let builder = ClientConfig::builder();
    let client_config = if config.insecure_skip_verify {
        warn!("TLS certificate verification disabled for outgoing S2S");
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()));
        match client_cert {
            Some((chain, key)) => builder
                .with_client_auth_cert(chain, key)
                .map_err(XmppError::Tls)?,
            None => builder.with_no_client_auth(),
        }
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let builder = builder.with_root_certificates(roots);
        match client_cert {
            Some((chain, key)) => builder
                .with_client_auth_cert(chain, key)
                .map_err(XmppError::Tls)?,
            None => builder.with_no_client_auth(),
        }
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

type CertAndKey = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn load_cert_and_key(path: &std::path::Path) -> Result<CertAndKey, XmppError> {
    let file = std::fs::File::open(path)
        .map_err(|e| XmppError::config(format!("failed to open certfile {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let mut chain = Vec::new();
    let mut key: Option<PrivateKeyDer<'static>> = None;
    for item in rustls_pemfile::read_all(&mut reader) {
        match item.map_err(|e| XmppError::config(format!("bad PEM in {:?}: {}", path, e)))? {
            rustls_pemfile::Item::X509Certificate(cert) => chain.push(cert),
            rustls_pemfile::Item::Pkcs8Key(k) if key.is_none() => {
                key = Some(PrivateKeyDer::Pkcs8(k))
            }
            rustls_pemfile::Item::Pkcs1Key(k) if key.is_none() => {
                key = Some(PrivateKeyDer::Pkcs1(k))
            }
            rustls_pemfile::Item::Sec1Key(k) if key.is_none() => {
                key = Some(PrivateKeyDer::Sec1(k))
            }
            _ => {}
        }
    }

    let key =
        key.ok_or_else(|| XmppError::config(format!("no private key in certfile {:?}", path)))?;
    if chain.is_empty() {
        return Err(XmppError::config(format!(
            "no certificates in certfile {:?}",
            path
        )));
    }
    Ok((chain, key))
}

/// Verifier that accepts any server certificate while still checking
/// handshake signatures. Federation peers routinely present self-signed
/// certificates and rely on dialback for authentication.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: rustls::crypto::CryptoProvider,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
