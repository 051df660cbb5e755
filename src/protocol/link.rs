//! Link connections to relays
//!
//! Maintains one TLS connection per first-hop relay and presents a framed
//! send-cell / receive-cell channel above it. Handles the link handshake:
//! VERSIONS negotiation, CERTS chain verification, AUTH_CHALLENGE (ignored
//! by clients), and the NETINFO exchange.
//!
//! TLS policy: TLS 1.2 minimum, ECDHE with AEAD suites only. Standard CA
//! validation is disabled; instead the CERTS cell binds the TLS certificate
//! to the relay's Ed25519 identity from the consensus.
//!
//! Each link runs exactly one reader task and one writer task; the writer
//! is fed from a bounded queue shared by all circuits on the link.

use rand::Rng;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{CipherSuite, DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{Result, TorError};
use crate::protocol::cell::{raw_command_is_variable_length, Cell, CellCommand};
use crate::protocol::certs::CertsCell;
use crate::protocol::crypto::constant_time_eq;
use crate::protocol::relay::Relay;

/// Link protocol versions we speak
const SUPPORTED_VERSIONS: [u16; 3] = [3, 4, 5];

/// Handshake deadline
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP connect deadline
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cells queued toward the writer before senders block
const WRITER_QUEUE: usize = 128;

/// Cells queued toward one circuit before the link reader blocks
const CIRCUIT_QUEUE: usize = 64;

/// Clock skew above which we log a warning
const SKEW_WARN_SECS: i64 = 300;

/// AEAD-only cipher suite allow-list; CBC suites are forbidden.
const ALLOWED_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

/// Certificate verifier for relay connections.
///
/// Relays present self-signed throwaway certificates; trust comes from the
/// CERTS cell chain, which ties the TLS certificate digest to the relay's
/// Ed25519 identity. Here we only require that a certificate is present and
/// structurally parseable, and we verify the TLS-level signatures.
#[derive(Debug)]
struct RelayCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for RelayCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.is_empty() {
            return Err(rustls::Error::NoCertificatesPresented);
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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

/// Build the restricted TLS client configuration.
fn tls_config() -> Result<Arc<rustls::ClientConfig>> {
    let base = rustls::crypto::ring::default_provider();
    let cipher_suites: Vec<_> = base
        .cipher_suites
        .iter()
        .filter(|s| ALLOWED_SUITES.contains(&s.suite()))
        .cloned()
        .collect();
    if cipher_suites.is_empty() {
        return Err(TorError::Tls("no allowed cipher suites available".into()));
    }
    let provider = Arc::new(CryptoProvider {
        cipher_suites,
        ..base
    });

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| TorError::Tls(format!("protocol versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(RelayCertVerifier { provider }))
        .with_no_client_auth();

    Ok(Arc::new(config))
}

type CircuitRegistry = Arc<Mutex<HashMap<u32, mpsc::Sender<Cell>>>>;

/// An open, handshaken link to a relay.
pub struct Link {
    /// Relay RSA fingerprint (hex)
    pub fingerprint: String,

    /// Negotiated link protocol version
    pub version: u16,

    /// Remote clock minus ours, from NETINFO
    pub clock_skew: i64,

    cell_tx: mpsc::Sender<Cell>,
    registry: CircuitRegistry,
    closed: Arc<AtomicBool>,
}

impl Link {
    /// Dial a relay and run the full link handshake.
    pub async fn connect(relay: &Relay) -> Result<Arc<Link>> {
        let addr = relay.socket_addr();
        log::info!(
            "opening link to {} ({}) at {}",
            relay.nickname,
            &relay.fingerprint[..8],
            addr
        );

        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TorError::Timeout(format!("TCP connect to {}", addr)))?
            .map_err(|e| TorError::LinkDown(format!("connect {}: {}", addr, e)))?;
        tcp.set_nodelay(true).ok();

        let connector = TlsConnector::from(tls_config()?);
        let server_name = ServerName::from(relay.address);
        let mut tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| TorError::Timeout("TLS handshake".into()))?
            .map_err(|e| TorError::Tls(e.to_string()))?;

        // The CERTS chain must bind to the certificate actually presented
        // over TLS.
        let tls_digest: [u8; 32] = {
            let (_, session) = tls.get_ref();
            let peer_cert = session
                .peer_certificates()
                .and_then(|c| c.first())
                .ok_or_else(|| TorError::Tls("no peer certificate".into()))?;
            Sha256::digest(peer_cert.as_ref()).into()
        };

        let handshake = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            link_handshake(
                &mut tls,
                &relay.nickname,
                relay.address,
                relay.ed25519_identity.as_ref(),
                Some(tls_digest),
            ),
        )
        .await
        .map_err(|_| TorError::Timeout("link handshake".into()))??;

        log::info!(
            "link open to {}: version {}, clock skew {}s",
            relay.nickname,
            handshake.version,
            handshake.clock_skew
        );

        let (read_half, write_half) = tokio::io::split(tls);
        let (cell_tx, cell_rx) = mpsc::channel(WRITER_QUEUE);
        let registry: CircuitRegistry = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(writer_task(write_half, cell_rx, closed.clone()));
        tokio::spawn(reader_task(read_half, registry.clone(), closed.clone()));

        Ok(Arc::new(Link {
            fingerprint: relay.fingerprint.clone(),
            version: handshake.version,
            clock_skew: handshake.clock_skew,
            cell_tx,
            registry,
            closed,
        }))
    }

    /// Whether the link has failed or been shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue a cell toward the relay. Blocks when the writer queue is full
    /// (backpressure onto circuits).
    pub async fn send_cell(&self, cell: Cell) -> Result<()> {
        if self.is_closed() {
            return Err(TorError::LinkDown("link closed".into()));
        }
        self.cell_tx
            .send(cell)
            .await
            .map_err(|_| TorError::LinkDown("link writer gone".into()))
    }

    /// Best-effort, non-blocking send for teardown paths (Drop impls).
    pub fn try_send_cell(&self, cell: Cell) {
        let _ = self.cell_tx.try_send(cell);
    }

    /// Allocate an unused client-side CircID (MSB set, nonzero) and
    /// register its inbound cell queue.
    pub fn register_new_circuit(&self) -> (u32, mpsc::Receiver<Cell>) {
        let mut registry = self.registry.lock().expect("lock poisoned");
        let mut rng = rand::thread_rng();
        let circ_id = loop {
            let candidate: u32 = rng.gen::<u32>() | 0x8000_0000;
            if !registry.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = mpsc::channel(CIRCUIT_QUEUE);
        registry.insert(circ_id, tx);
        (circ_id, rx)
    }

    /// Remove a circuit's inbound route.
    pub fn unregister_circuit(&self, circ_id: u32) {
        self.registry.lock().expect("lock poisoned").remove(&circ_id);
    }

    /// Drop all circuit routes and stop accepting sends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.registry.lock().expect("lock poisoned").clear();
    }
}

#[derive(Debug)]
struct HandshakeOutcome {
    version: u16,
    clock_skew: i64,
}

/// Run the in-protocol link handshake over a fresh TLS stream.
///
/// `tls_cert_digest` is the SHA-256 of the peer's TLS certificate when the
/// transport can supply it; the CERTS chain must certify exactly that
/// digest.
async fn link_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    tls: &mut S,
    relay_name: &str,
    relay_address: std::net::IpAddr,
    expected_ed_identity: Option<&[u8; 32]>,
    tls_cert_digest: Option<[u8; 32]>,
) -> Result<HandshakeOutcome> {
    // 1. VERSIONS exchange. The VERSIONS cell itself uses the 2-byte CircID
    // framing of link protocol <4.
    let mut versions_payload = Vec::with_capacity(SUPPORTED_VERSIONS.len() * 2);
    for v in SUPPORTED_VERSIONS {
        versions_payload.extend_from_slice(&v.to_be_bytes());
    }
    let mut versions_cell = Vec::new();
    versions_cell.extend_from_slice(&[0x00, 0x00]); // CircID = 0, 2 bytes
    versions_cell.push(CellCommand::Versions as u8);
    versions_cell.extend_from_slice(&(versions_payload.len() as u16).to_be_bytes());
    versions_cell.extend_from_slice(&versions_payload);
    tls.write_all(&versions_cell).await?;
    tls.flush().await?;

    // Peer VERSIONS, same short framing
    let mut header = [0u8; 5];
    tls.read_exact(&mut header).await?;
    if header[2] != CellCommand::Versions as u8 {
        return Err(TorError::Protocol(format!(
            "expected VERSIONS, got command {}",
            header[2]
        )));
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut peer_versions_raw = vec![0u8; len];
    tls.read_exact(&mut peer_versions_raw).await?;

    let peer_versions: Vec<u16> = peer_versions_raw
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    let version = SUPPORTED_VERSIONS
        .iter()
        .rev()
        .find(|v| peer_versions.contains(v))
        .copied()
        .ok_or_else(|| TorError::Protocol("no common link protocol version".into()))?;
    if version < 4 {
        return Err(TorError::Protocol(format!(
            "negotiated link version {} lacks 4-byte CircIDs",
            version
        )));
    }

    // 2..5. CERTS, AUTH_CHALLENGE, then the peer's NETINFO, all in 4-byte
    // CircID framing now.
    let mut saw_certs = false;
    let clock_skew;
    loop {
        let cell = read_cell_async(tls).await?;
        let Some(cell) = cell else {
            continue; // unknown command: logged and dropped
        };
        match cell.command {
            CellCommand::Certs => {
                let certs = CertsCell::parse(&cell.payload)?;
                let verified =
                    certs.verify_link_chain(expected_ed_identity, SystemTime::now())?;

                // Bind the chain to the actual TLS certificate.
                if let Some(tls_digest) = tls_cert_digest.as_ref() {
                    if !constant_time_eq(tls_digest, &verified.link_cert_digest) {
                        return Err(TorError::Crypto(
                            "TLS certificate not bound by CERTS chain".into(),
                        ));
                    }
                }
                saw_certs = true;
            }
            CellCommand::AuthChallenge => {
                // Clients do not authenticate; ignored.
            }
            CellCommand::Netinfo => {
                if !saw_certs {
                    return Err(TorError::Protocol("NETINFO before CERTS".into()));
                }
                if cell.payload.len() < 4 {
                    return Err(TorError::Protocol("short NETINFO".into()));
                }
                let remote_ts = u32::from_be_bytes([
                    cell.payload[0],
                    cell.payload[1],
                    cell.payload[2],
                    cell.payload[3],
                ]) as i64;
                let local_ts = unix_now_i64();
                clock_skew = remote_ts - local_ts;
                if clock_skew.abs() > SKEW_WARN_SECS {
                    log::warn!(
                        "relay {} clock skew {}s exceeds {}s",
                        relay_name,
                        clock_skew,
                        SKEW_WARN_SECS
                    );
                }
                break;
            }
            CellCommand::Padding | CellCommand::Vpadding => {}
            other => {
                return Err(TorError::UnexpectedCell {
                    expected: "CERTS/AUTH_CHALLENGE/NETINFO".into(),
                    got: format!("{:?}", other),
                });
            }
        }
    }

    // 6. Our NETINFO: bounds-checked timestamp, the relay's address as the
    // "other" address, one own-address entry.
    let timestamp: u32 = unix_now_i64()
        .try_into()
        .map_err(|_| TorError::Internal("system clock outside u32 range".into()))?;
    let mut netinfo = Vec::new();
    netinfo.extend_from_slice(&timestamp.to_be_bytes());
    push_netinfo_addr(&mut netinfo, relay_address);
    netinfo.push(1); // one own address
    push_netinfo_addr(&mut netinfo, std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));

    let netinfo_cell = Cell::new(0, CellCommand::Netinfo, netinfo);
    tls.write_all(&netinfo_cell.encode()?).await?;
    tls.flush().await?;

    Ok(HandshakeOutcome {
        version,
        clock_skew,
    })
}

fn unix_now_i64() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn push_netinfo_addr(buf: &mut Vec<u8>, addr: std::net::IpAddr) {
    match addr {
        std::net::IpAddr::V4(v4) => {
            buf.push(0x04);
            buf.push(4);
            buf.extend_from_slice(&v4.octets());
        }
        std::net::IpAddr::V6(v6) => {
            buf.push(0x06);
            buf.push(16);
            buf.extend_from_slice(&v6.octets());
        }
    }
}

/// Read exactly one cell from the stream. Unknown commands are logged and
/// dropped (returning `None`), never forwarded.
async fn read_cell_async<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<Cell>> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let circ_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let raw_cmd = header[4];

    let payload = if raw_command_is_variable_length(raw_cmd) {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        payload
    } else {
        let mut payload = vec![0u8; Cell::PAYLOAD_SIZE];
        stream.read_exact(&mut payload).await?;
        payload
    };

    match CellCommand::from_u8(raw_cmd) {
        Some(command) => Ok(Some(Cell::new(circ_id, command, payload))),
        None => {
            log::warn!(
                "dropping cell with unknown command {} on circ {}",
                raw_cmd,
                circ_id
            );
            Ok(None)
        }
    }
}

async fn writer_task<S: AsyncWrite + Unpin>(
    mut write_half: WriteHalf<S>,
    mut cell_rx: mpsc::Receiver<Cell>,
    closed: Arc<AtomicBool>,
) {
    while let Some(cell) = cell_rx.recv().await {
        let bytes = match cell.encode() {
            Ok(b) => b,
            Err(e) => {
                log::error!("dropping unencodable cell: {}", e);
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&bytes).await {
            log::warn!("link writer failed: {}", e);
            break;
        }
        if let Err(e) = write_half.flush().await {
            log::warn!("link flush failed: {}", e);
            break;
        }
    }
    closed.store(true, Ordering::SeqCst);
}

async fn reader_task<S: AsyncRead + Unpin>(
    mut read_half: ReadHalf<S>,
    registry: CircuitRegistry,
    closed: Arc<AtomicBool>,
) {
    loop {
        let cell = match read_cell_async(&mut read_half).await {
            Ok(Some(cell)) => cell,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("link reader closing: {}", e);
                break;
            }
        };

        match cell.command {
            CellCommand::Padding | CellCommand::Vpadding | CellCommand::PaddingNegotiate => {
                continue;
            }
            _ => {}
        }

        let route = {
            let registry = registry.lock().expect("lock poisoned");
            registry.get(&cell.circ_id).cloned()
        };
        match route {
            Some(tx) => {
                // Bounded queue: a slow circuit applies backpressure here.
                if tx.send(cell).await.is_err() {
                    // Circuit gone; drop quietly.
                }
            }
            None => {
                log::debug!(
                    "dropping {:?} for unknown circ {}",
                    cell.command,
                    cell.circ_id
                );
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping the registry senders makes every circuit see EOF.
    registry.lock().expect("lock poisoned").clear();
}

/// Keeps one shared link per relay.
pub struct LinkManager {
    links: tokio::sync::Mutex<HashMap<String, Arc<Link>>>,
}

impl LinkManager {
    pub fn new() -> Self {
        Self {
            links: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Return the open link to `relay`, dialing one if needed.
    pub async fn get_or_connect(&self, relay: &Relay) -> Result<Arc<Link>> {
        let mut links = self.links.lock().await;
        if let Some(link) = links.get(&relay.fingerprint) {
            if !link.is_closed() {
                return Ok(link.clone());
            }
            links.remove(&relay.fingerprint);
        }
        let link = Link::connect(relay).await?;
        links.insert(relay.fingerprint.clone(), link.clone());
        Ok(link)
    }

    /// Close every link (shutdown path).
    pub async fn close_all(&self) {
        let mut links = self.links.lock().await;
        for (_, link) in links.drain() {
            link.close();
        }
    }
}

impl Default for LinkManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_config_builds() {
        let config = tls_config().unwrap();
        // TLS 1.3 and 1.2 enabled, nothing older
        assert!(config.crypto_provider().cipher_suites.len() >= 3);
        for suite in &config.crypto_provider().cipher_suites {
            assert!(ALLOWED_SUITES.contains(&suite.suite()));
        }
    }

    #[test]
    fn test_netinfo_addr_encoding() {
        let mut buf = Vec::new();
        push_netinfo_addr(&mut buf, "10.1.2.3".parse().unwrap());
        assert_eq!(buf, vec![0x04, 4, 10, 1, 2, 3]);

        let mut buf6 = Vec::new();
        push_netinfo_addr(&mut buf6, "::1".parse().unwrap());
        assert_eq!(buf6[0], 0x06);
        assert_eq!(buf6[1], 16);
        assert_eq!(buf6.len(), 18);
    }

    #[tokio::test]
    async fn test_read_cell_async_roundtrip() {
        let cell = Cell::new(0x8000_0042, CellCommand::Relay, vec![7u8; 509]);
        let bytes = cell.encode().unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let parsed = read_cell_async(&mut cursor).await.unwrap().unwrap();
        assert_eq!(parsed, cell);
    }

    #[tokio::test]
    async fn test_read_cell_async_drops_unknown() {
        let mut bytes = vec![0, 0, 0, 1, 200]; // unknown variable command
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&[1, 2]);
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(read_cell_async(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn test_version_preference() {
        // highest common version wins
        let peer = [3u16, 4];
        let negotiated = SUPPORTED_VERSIONS
            .iter()
            .rev()
            .find(|v| peer.contains(v))
            .copied();
        assert_eq!(negotiated, Some(4));
    }

    mod handshake {
        use super::super::*;
        use crate::protocol::certs::test_support::make_cert;
        use ed25519_dalek::SigningKey;
        use rand::rngs::OsRng;
        use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

        struct ResponderKeys {
            certs_payload: Vec<u8>,
            identity: [u8; 32],
            tls_digest: [u8; 32],
        }

        fn responder_keys() -> ResponderKeys {
            let identity = SigningKey::generate(&mut OsRng);
            let signing = SigningKey::generate(&mut OsRng);
            let tls_digest = [0xC5u8; 32];
            let exp = {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap()
                    .as_secs();
                (now / 3600 + 24 * 30) as u32
            };

            let signing_cert = make_cert(
                4,
                signing.verifying_key().as_bytes(),
                crate::protocol::certs::KEY_TYPE_ED25519,
                &identity,
                true,
                exp,
            );
            let link_cert = make_cert(
                5,
                &tls_digest,
                crate::protocol::certs::KEY_TYPE_SHA256_OF_X509,
                &signing,
                false,
                exp,
            );

            let mut certs_payload = vec![2u8];
            for (cert_type, body) in [(4u8, &signing_cert), (5u8, &link_cert)] {
                certs_payload.push(cert_type);
                certs_payload.extend_from_slice(&(body.len() as u16).to_be_bytes());
                certs_payload.extend_from_slice(body);
            }

            ResponderKeys {
                certs_payload,
                identity: *identity.verifying_key().as_bytes(),
                tls_digest,
            }
        }

        /// Scripted responder side: VERSIONS, CERTS, AUTH_CHALLENGE,
        /// NETINFO, then read the client's NETINFO.
        async fn run_responder(mut relay_side: DuplexStream, certs_payload: Vec<u8>) {
            let mut head = [0u8; 5];
            relay_side.read_exact(&mut head).await.unwrap();
            assert_eq!(head[2], CellCommand::Versions as u8);
            let len = u16::from_be_bytes([head[3], head[4]]) as usize;
            let mut versions = vec![0u8; len];
            relay_side.read_exact(&mut versions).await.unwrap();

            // Offer versions 3 and 4; 4 should win.
            relay_side
                .write_all(&[0, 0, CellCommand::Versions as u8, 0, 4, 0, 3, 0, 4])
                .await
                .unwrap();

            let mut certs_cell = vec![0, 0, 0, 0, CellCommand::Certs as u8];
            certs_cell.extend_from_slice(&(certs_payload.len() as u16).to_be_bytes());
            certs_cell.extend_from_slice(&certs_payload);
            relay_side.write_all(&certs_cell).await.unwrap();

            let mut challenge = vec![0, 0, 0, 0, CellCommand::AuthChallenge as u8];
            challenge.extend_from_slice(&38u16.to_be_bytes());
            challenge.extend_from_slice(&[0u8; 38]);
            relay_side.write_all(&challenge).await.unwrap();

            let ts = unix_now_i64() as u32;
            let mut payload = ts.to_be_bytes().to_vec();
            payload.extend_from_slice(&[0x04, 4, 127, 0, 0, 1]);
            payload.push(1);
            payload.extend_from_slice(&[0x04, 4, 127, 0, 0, 1]);
            let netinfo = Cell::new(0, CellCommand::Netinfo, payload).encode().unwrap();
            relay_side.write_all(&netinfo).await.unwrap();

            let mut client_netinfo = vec![0u8; Cell::SIZE];
            relay_side.read_exact(&mut client_netinfo).await.unwrap();
            assert_eq!(client_netinfo[4], CellCommand::Netinfo as u8);
        }

        #[tokio::test]
        async fn test_full_handshake() {
            let keys = responder_keys();
            let (mut client_side, relay_side) = tokio::io::duplex(64 * 1024);

            let certs_payload = keys.certs_payload.clone();
            let responder = tokio::spawn(run_responder(relay_side, certs_payload));

            let outcome = link_handshake(
                &mut client_side,
                "mock",
                "192.0.2.9".parse().unwrap(),
                Some(&keys.identity),
                Some(keys.tls_digest),
            )
            .await
            .unwrap();

            assert_eq!(outcome.version, 4);
            assert!(outcome.clock_skew.abs() < 5);
            responder.await.unwrap();
        }

        #[tokio::test]
        async fn test_handshake_rejects_wrong_identity() {
            let keys = responder_keys();
            let (mut client_side, relay_side) = tokio::io::duplex(64 * 1024);
            let _responder = tokio::spawn(run_responder(relay_side, keys.certs_payload.clone()));

            let wrong_identity = [0xEEu8; 32];
            let err = link_handshake(
                &mut client_side,
                "mock",
                "192.0.2.9".parse().unwrap(),
                Some(&wrong_identity),
                Some(keys.tls_digest),
            )
            .await
            .unwrap_err();
            assert!(err.is_fatal_for_circuit());
        }

        #[tokio::test]
        async fn test_handshake_rejects_unbound_tls_cert() {
            let keys = responder_keys();
            let (mut client_side, relay_side) = tokio::io::duplex(64 * 1024);
            let _responder = tokio::spawn(run_responder(relay_side, keys.certs_payload.clone()));

            let err = link_handshake(
                &mut client_side,
                "mock",
                "192.0.2.9".parse().unwrap(),
                Some(&keys.identity),
                Some([0x00u8; 32]), // not the digest the chain certifies
            )
            .await
            .unwrap_err();
            assert!(err.is_fatal_for_circuit());
        }
    }
}
