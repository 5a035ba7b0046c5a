//! QUIC/TLS 1.3 connection management for the Veil overlay.
//!
//! This module provides a QUIC transport layer using [`quinn`] with TLS 1.3.
//! Endpoints present self-signed certificates and clients accept any server
//! certificate: TLS gives link encryption only, while a relay proves its
//! identity through the circuit handshake bound to its registered static key.
//!
//! ## ALPN
//!
//! The ALPN protocol identifier is `veil/1`.
//!
//! ## Exchanges
//!
//! Every protocol exchange uses its own bidirectional stream: the initiator
//! writes one framed envelope and finishes its send side, the responder
//! answers with at most one framed envelope and finishes. See [`request`],
//! [`exchange`] and [`push`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, Incoming, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::messages::Packet;
use crate::wire::{self, MAX_ENVELOPE_SIZE};
use crate::TransportError;

/// ALPN protocol identifier for Veil protocol version 1.
pub const ALPN_VEIL_V1: &[u8] = b"veil/1";

/// TLS server name used for every connection.
pub const SERVER_NAME: &str = "veil-node";

/// Default QUIC idle timeout in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u32 = 30_000;

/// Default maximum number of concurrent bidirectional streams.
pub const DEFAULT_MAX_BI_STREAMS: u32 = 128;

/// Configuration for a QUIC node.
#[derive(Clone)]
pub struct QuicConfig {
    /// Local address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum idle timeout in milliseconds.
    pub idle_timeout_ms: u32,
    /// Maximum concurrent bidirectional streams per connection.
    pub max_bi_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_bi_streams: DEFAULT_MAX_BI_STREAMS,
        }
    }
}

impl QuicConfig {
    /// Default configuration bound to `bind_addr`.
    pub fn bind(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }
}

/// A QUIC endpoint that can listen for and initiate connections.
///
/// Relays and the directory run a server-capable endpoint (see
/// [`QuicNode::new`]); a relay's outgoing connections leave from the same
/// socket, so the address a peer observes is the relay's listening address.
/// Onion clients only dial out and use [`QuicNode::client`].
pub struct QuicNode {
    endpoint: Endpoint,
    local_addr: SocketAddr,
}

impl QuicNode {
    /// Create a server-capable QUIC node bound to the configured address.
    ///
    /// Generates a fresh self-signed TLS certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if TLS configuration fails.
    /// Returns [`TransportError::Io`] if the socket cannot be bound.
    pub fn new(config: QuicConfig) -> Result<Self, TransportError> {
        let server_config = build_server_config(config.idle_timeout_ms, config.max_bi_streams)?;
        let client_config = build_client_config(config.idle_timeout_ms)?;

        let mut endpoint = Endpoint::server(server_config, config.bind_addr)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        Self::from_endpoint(endpoint, "QUIC node started")
    }

    /// Create a client-only QUIC node bound to `bind_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if TLS configuration fails.
    /// Returns [`TransportError::Io`] if the socket cannot be bound.
    pub fn client(bind_addr: SocketAddr) -> Result<Self, TransportError> {
        let client_config = build_client_config(DEFAULT_IDLE_TIMEOUT_MS)?;
        let mut endpoint =
            Endpoint::client(bind_addr).map_err(|e| TransportError::Io(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        Self::from_endpoint(endpoint, "QUIC client started")
    }

    fn from_endpoint(endpoint: Endpoint, message: &'static str) -> Result<Self, TransportError> {
        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        tracing::info!(%local_addr, "{message}");
        Ok(Self {
            endpoint,
            local_addr,
        })
    }

    /// Get the local socket address this node is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next incoming QUIC connection.
    ///
    /// Returns `None` if the endpoint has been closed.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Initiate a QUIC connection to a remote peer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the connection cannot be established.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Connection, TransportError> {
        let connecting = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let connection = connecting
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::debug!(
            remote = %connection.remote_address(),
            "QUIC connection established"
        );

        Ok(connection)
    }

    /// Connect to `addr`, giving up after `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if the handshake does not finish in time.
    pub async fn connect_within(
        &self,
        addr: SocketAddr,
        limit: Duration,
    ) -> Result<Connection, TransportError> {
        within(limit, self.connect(addr)).await
    }

    /// Open a new bidirectional stream on an existing connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the stream cannot be opened.
    pub async fn open_bi(
        connection: &Connection,
    ) -> Result<(SendStream, RecvStream), TransportError> {
        connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    /// Accept the next bidirectional stream on an existing connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the connection is closed.
    pub async fn accept_bi(
        connection: &Connection,
    ) -> Result<(SendStream, RecvStream), TransportError> {
        connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    /// Send a complete message (length-prefixed) on a send stream.
    ///
    /// Wire format: `[length:4 LE][data:length]`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the write fails.
    pub async fn send_message(stream: &mut SendStream, data: &[u8]) -> Result<(), TransportError> {
        let framed = wire::frame(data)?;
        stream
            .write_all(&framed)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    /// Receive a complete message (length-prefixed) from a receive stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the read fails.
    /// Returns [`TransportError::MalformedPacket`] if the length exceeds `max_size`.
    pub async fn recv_message(
        stream: &mut RecvStream,
        max_size: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > max_size {
            return Err(TransportError::MalformedPacket(format!(
                "message length {len} exceeds maximum {max_size}"
            )));
        }

        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(buf)
    }

    /// Encode and send one packet.
    pub async fn send_packet(
        stream: &mut SendStream,
        packet: &Packet,
    ) -> Result<(), TransportError> {
        let body = wire::encode(packet)?;
        Self::send_message(stream, &body).await
    }

    /// Receive and decode one packet.
    pub async fn recv_packet(stream: &mut RecvStream) -> Result<Packet, TransportError> {
        let body = Self::recv_message(stream, MAX_ENVELOPE_SIZE).await?;
        wire::decode(&body)
    }

    /// Gracefully close the endpoint.
    ///
    /// All active connections will be closed with the given error code and reason.
    pub fn close(&self, error_code: u32, reason: &[u8]) {
        self.endpoint
            .close(quinn::VarInt::from_u32(error_code), reason);
    }

    /// Get a reference to the underlying Quinn endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Send `packet` on a fresh stream and wait for the single reply.
///
/// The whole exchange (stream open, write, read) is bounded by `limit`.
///
/// # Errors
///
/// Returns [`TransportError::Timeout`] when `limit` elapses,
/// [`TransportError::ProtocolViolation`] when the peer finishes the stream
/// without replying, and the usual connection, I/O and decode errors
/// otherwise.
pub async fn request(
    connection: &Connection,
    packet: &Packet,
    limit: Duration,
) -> Result<Packet, TransportError> {
    exchange(connection, packet, limit).await?.ok_or_else(|| {
        let (kind, command) = packet.kind();
        TransportError::ProtocolViolation(format!("no reply to {kind}/{command}"))
    })
}

/// Like [`request`], but an empty reply stream yields `Ok(None)`.
///
/// Responders answer with zero or one envelope and then finish their send
/// side, so the reply is read to the end and de-framed.
pub async fn exchange(
    connection: &Connection,
    packet: &Packet,
    limit: Duration,
) -> Result<Option<Packet>, TransportError> {
    within(limit, async {
        let (mut send, mut recv) = QuicNode::open_bi(connection).await?;
        QuicNode::send_packet(&mut send, packet).await?;
        send.finish()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let raw = recv
            .read_to_end(wire::HEADER_SIZE + MAX_ENVELOPE_SIZE)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let mut decoder = wire::FrameDecoder::new();
        decoder.push(&raw);
        let reply = match decoder.next_frame()? {
            Some(body) => Some(wire::decode(&body)?),
            None if raw.is_empty() => None,
            None => {
                return Err(TransportError::MalformedPacket(format!(
                    "truncated reply: {} bytes",
                    raw.len()
                )))
            }
        };
        if decoder.buffered() > 0 {
            return Err(TransportError::ProtocolViolation(
                "more than one reply on a stream".into(),
            ));
        }
        Ok(reply)
    })
    .await
}

/// Send `packet` on a fresh stream without expecting a reply.
///
/// # Errors
///
/// Returns [`TransportError::Timeout`] when `limit` elapses before the
/// packet is written.
pub async fn push(
    connection: &Connection,
    packet: &Packet,
    limit: Duration,
) -> Result<(), TransportError> {
    within(limit, async {
        let (mut send, _recv) = QuicNode::open_bi(connection).await?;
        QuicNode::send_packet(&mut send, packet).await?;
        send.finish()
            .map_err(|e| TransportError::Io(e.to_string()))
    })
    .await
}

/// Run `fut`, failing with [`TransportError::Timeout`] after `limit`.
pub async fn within<T, F>(limit: Duration, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(
            u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        )),
    }
}

// ---------------------------------------------------------------------------
// TLS / certificate helpers
// ---------------------------------------------------------------------------

/// Generate a self-signed TLS certificate and private key for QUIC.
///
/// # Errors
///
/// Returns [`TransportError::Tls`] if certificate generation fails.
fn generate_self_signed_cert(
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), TransportError> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .map_err(|e| TransportError::Tls(format!("key generation failed: {e}")))?;

    let params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .map_err(|e| TransportError::Tls(format!("cert params failed: {e}")))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::Tls(format!("self-signed cert generation failed: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok((cert_der, key_der))
}

fn transport_config(
    idle_timeout_ms: u32,
    max_bi_streams: u32,
) -> Result<quinn::TransportConfig, TransportError> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(Duration::from_millis(u64::from(idle_timeout_ms)))
            .map_err(|e| TransportError::Tls(format!("idle timeout config failed: {e}")))?,
    ));
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(max_bi_streams));
    // Circuits hold their connections between cells.
    transport.keep_alive_interval(Some(Duration::from_millis(u64::from(idle_timeout_ms / 3))));
    Ok(transport)
}

/// Build a Quinn [`ServerConfig`] with self-signed TLS and the Veil ALPN.
fn build_server_config(
    idle_timeout_ms: u32,
    max_bi_streams: u32,
) -> Result<ServerConfig, TransportError> {
    let (cert_der, key_der) = generate_self_signed_cert()?;

    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("server TLS version config failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TransportError::Tls(format!("server TLS config failed: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_VEIL_V1.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC server crypto config failed: {e}")))?,
    ));
    server_config.transport_config(Arc::new(transport_config(idle_timeout_ms, max_bi_streams)?));

    Ok(server_config)
}

/// Build a Quinn [`ClientConfig`] that accepts any server certificate.
fn build_client_config(idle_timeout_ms: u32) -> Result<ClientConfig, TransportError> {
    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("client TLS version config failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    tls_config.alpn_protocols = vec![ALPN_VEIL_V1.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC client crypto config failed: {e}")))?,
    ));
    client_config.transport_config(Arc::new(transport_config(
        idle_timeout_ms,
        DEFAULT_MAX_BI_STREAMS,
    )?));

    Ok(client_config)
}

/// TLS certificate verifier that accepts any server certificate.
///
/// Relay identity is established by the circuit handshake against the
/// directory-registered static key, not by the TLS certificate.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
