//! Directory client
//!
//! Bootstraps the client's view of the network by fetching the
//! microdescriptor consensus from the hardcoded directory authorities over
//! plain HTTP on their DirPorts. The bootstrap fetch is unencrypted by
//! design (the chicken-and-egg of having no circuits yet); authenticity
//! comes from the authority signature quorum, not the transport.
//!
//! Also fetches authority key certificates (to map signing-key digests to
//! RSA keys) and relay microdescriptors (ntor keys, ed25519 identities,
//! exit policies, families).

use base64::engine::general_purpose::{STANDARD as BASE64, STANDARD_NO_PAD as BASE64_NO_PAD};
use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::RsaPublicKey;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, TorError};
use crate::protocol::consensus::{
    Consensus, ConsensusParser, ConsensusVerifier, DIRECTORY_AUTHORITIES,
};
use crate::protocol::relay::PortPolicy;

/// Consensus fetch path (microdesc flavor)
const CONSENSUS_PATH: &str = "/tor/status-vote/current/consensus-microdesc";

/// Authority key certificates
const KEYS_PATH: &str = "/tor/keys/all";

/// Microdescriptor batch path prefix
const MICRODESC_PATH: &str = "/tor/micro/d/";

/// Microdescriptors fetched per request
const MICRODESC_BATCH: usize = 92;

/// Backoff between full authority sweeps
const SWEEP_BACKOFF: [Duration; 3] = [
    Duration::from_secs(0),
    Duration::from_secs(5),
    Duration::from_secs(15),
];

/// Per-request timeouts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Capability trait: anything that can hand out a consensus snapshot.
///
/// Readers get an immutable `Arc` snapshot; refresh swaps the snapshot
/// atomically.
pub trait ConsensusSource: Send + Sync {
    fn current(&self) -> Option<Arc<Consensus>>;
}

/// Directory client holding the cached consensus.
pub struct DirectoryClient {
    verifier: ConsensusVerifier,
    cached: RwLock<Option<Arc<Consensus>>>,
    /// signing-key digest (hex, uppercase) -> RSA signing key
    signing_keys: RwLock<HashMap<String, RsaPublicKey>>,
}

impl DirectoryClient {
    pub fn new() -> Self {
        Self {
            verifier: ConsensusVerifier::new(),
            cached: RwLock::new(None),
            signing_keys: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch and validate a consensus, retrying the authority list with
    /// backoff. Returns the cached copy when it is still inside its
    /// valid-after window.
    pub async fn fetch_consensus(&self) -> Result<Arc<Consensus>> {
        if let Some(cached) = self.cached.read().expect("lock poisoned").clone() {
            if cached.is_fresh(now_unix()) {
                return Ok(cached);
            }
        }

        let mut last_error = TorError::Directory("no authorities tried".into());

        for (sweep, backoff) in SWEEP_BACKOFF.iter().enumerate() {
            if !backoff.is_zero() {
                log::info!("directory sweep {} backing off {:?}", sweep + 1, backoff);
                tokio::time::sleep(*backoff).await;
            }

            let mut order: Vec<usize> = (0..DIRECTORY_AUTHORITIES.len()).collect();
            shuffle(&mut order);

            for idx in order {
                let authority = &DIRECTORY_AUTHORITIES[idx];
                log::info!(
                    "fetching consensus from {} ({})",
                    authority.name,
                    authority.address
                );
                match self.try_fetch_from(authority.address).await {
                    Ok(consensus) => {
                        let consensus = Arc::new(consensus);
                        *self.cached.write().expect("lock poisoned") = Some(consensus.clone());
                        return Ok(consensus);
                    }
                    Err(e) => {
                        log::warn!("authority {} failed: {}", authority.name, e);
                        last_error = e;
                    }
                }
            }
        }

        Err(TorError::AllAuthoritiesFailed(last_error.to_string()))
    }

    /// One complete fetch + validate cycle against a single authority.
    async fn try_fetch_from(&self, addr: &str) -> Result<Consensus> {
        let body = http_get(addr, CONSENSUS_PATH).await?;
        let text = String::from_utf8(body)
            .map_err(|_| TorError::Directory("consensus is not UTF-8".into()))?;

        let mut consensus = ConsensusParser::parse(&text)?;

        let now = now_unix();
        if now > consensus.valid_until {
            return Err(TorError::ConsensusStale);
        }
        if now < consensus.valid_after {
            log::warn!(
                "consensus valid-after is {}s in the future; clock skew?",
                consensus.valid_after - now
            );
        }

        self.ensure_signing_keys(addr).await?;
        {
            let keys = self.signing_keys.read().expect("lock poisoned");
            self.verifier.verify_quorum(&text, &keys)?;
        }

        self.attach_microdescriptors(addr, &mut consensus).await?;

        log::info!(
            "consensus valid: {} relays, {} usable",
            consensus.relays.len(),
            consensus.usable_relays().count()
        );
        Ok(consensus)
    }

    /// Fetch authority key certificates once and build the signing-key map.
    async fn ensure_signing_keys(&self, addr: &str) -> Result<()> {
        if !self.signing_keys.read().expect("lock poisoned").is_empty() {
            return Ok(());
        }
        let body = http_get(addr, KEYS_PATH).await?;
        let text = String::from_utf8(body)
            .map_err(|_| TorError::Directory("key certs are not UTF-8".into()))?;
        let keys = parse_key_certificates(&text)?;
        if keys.is_empty() {
            return Err(TorError::Directory("no usable key certificates".into()));
        }
        log::info!("loaded {} authority signing keys", keys.len());
        *self.signing_keys.write().expect("lock poisoned") = keys;
        Ok(())
    }

    /// Fetch microdescriptors in batches and merge their fields into the
    /// consensus relays.
    async fn attach_microdescriptors(&self, addr: &str, consensus: &mut Consensus) -> Result<()> {
        let digests: Vec<String> = consensus
            .relays
            .iter()
            .filter_map(|r| r.microdesc_digest.clone())
            .collect();

        let mut by_digest: HashMap<String, Microdesc> = HashMap::new();
        for chunk in digests.chunks(MICRODESC_BATCH) {
            let path = format!("{}{}", MICRODESC_PATH, chunk.join("-"));
            let body = match http_get(addr, &path).await {
                Ok(b) => b,
                Err(e) => {
                    log::warn!("microdescriptor batch failed: {}", e);
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&body).into_owned();
            for (digest, md) in parse_microdescriptors(&text) {
                by_digest.insert(digest, md);
            }
        }

        let mut attached = 0usize;
        for relay in &mut consensus.relays {
            let Some(digest) = relay.microdesc_digest.as_deref() else {
                continue;
            };
            if let Some(md) = by_digest.get(digest) {
                relay.ntor_onion_key = md.ntor_onion_key;
                relay.ed25519_identity = md.ed25519_identity;
                relay.exit_policy = md.exit_policy.clone();
                relay.family = md.family.clone();
                attached += 1;
            }
        }

        if attached == 0 {
            return Err(TorError::Directory(
                "no microdescriptors could be attached".into(),
            ));
        }
        log::info!(
            "attached {}/{} microdescriptors",
            attached,
            consensus.relays.len()
        );
        Ok(())
    }
}

impl Default for DirectoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsensusSource for DirectoryClient {
    fn current(&self) -> Option<Arc<Consensus>> {
        self.cached.read().expect("lock poisoned").clone()
    }
}

/// Fields extracted from one microdescriptor.
#[derive(Debug, Default, Clone)]
struct Microdesc {
    ntor_onion_key: Option<[u8; 32]>,
    ed25519_identity: Option<[u8; 32]>,
    exit_policy: Option<PortPolicy>,
    family: Vec<String>,
}

/// Split a microdescriptor download into documents keyed by their SHA-256
/// digest (base64, no padding), the form the consensus `m` lines use.
fn parse_microdescriptors(text: &str) -> Vec<(String, Microdesc)> {
    let mut out = Vec::new();

    // Each microdescriptor starts at an "onion-key" line.
    let mut starts: Vec<usize> = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.starts_with("onion-key") {
            starts.push(offset);
        }
        offset += line.len();
    }

    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(text.len());
        let doc = &text[start..end];

        let digest = BASE64_NO_PAD.encode(Sha256::digest(doc.as_bytes()));

        let mut md = Microdesc::default();
        for line in doc.lines() {
            if let Some(rest) = line.strip_prefix("ntor-onion-key ") {
                md.ntor_onion_key = decode_key32(rest);
            } else if let Some(rest) = line.strip_prefix("id ed25519 ") {
                md.ed25519_identity = decode_key32(rest);
            } else if let Some(rest) = line.strip_prefix("p ") {
                md.exit_policy = PortPolicy::parse(rest).ok();
            } else if let Some(rest) = line.strip_prefix("family ") {
                md.family = rest
                    .split_whitespace()
                    .filter_map(|m| m.strip_prefix('$'))
                    .map(|fp| fp.to_uppercase())
                    .collect();
            }
        }
        out.push((digest, md));
    }
    out
}

fn decode_key32(b64: &str) -> Option<[u8; 32]> {
    let mut padded = b64.trim().to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let bytes = BASE64.decode(padded).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

/// Parse `dir-key-certificate-version 3` documents and return a map of
/// signing-key digest (hex uppercase SHA-1 of the key DER) to RSA key.
fn parse_key_certificates(text: &str) -> Result<HashMap<String, RsaPublicKey>> {
    let mut keys = HashMap::new();

    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        if !line.starts_with("dir-signing-key") {
            continue;
        }
        // Expect a PEM block next
        let mut b64 = String::new();
        let mut in_block = false;
        for next in lines.by_ref() {
            let next = next.trim();
            if next.starts_with("-----BEGIN") {
                in_block = true;
            } else if next.starts_with("-----END") {
                break;
            } else if in_block {
                b64.push_str(next);
            }
        }
        let Ok(der) = BASE64.decode(&b64) else {
            log::warn!("skipping unparseable dir-signing-key block");
            continue;
        };
        let digest = hex::encode_upper(Sha1::digest(&der));
        match RsaPublicKey::from_pkcs1_der(&der) {
            Ok(key) => {
                keys.insert(digest, key);
            }
            Err(e) => log::warn!("bad RSA signing key in certificate: {}", e),
        }
    }

    Ok(keys)
}

/// Plain HTTP/1.0 GET against `host:port`, returning the response body.
pub async fn http_get(addr: &str, path: &str) -> Result<Vec<u8>> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TorError::Timeout(format!("connect to {}", addr)))??;

    tokio::time::timeout(RESPONSE_TIMEOUT, http_get_on(stream, addr, path))
        .await
        .map_err(|_| TorError::Timeout(format!("response from {}", addr)))?
}

async fn http_get_on(mut stream: TcpStream, host: &str, path: &str) -> Result<Vec<u8>> {
    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nAccept-Encoding: identity\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;

    parse_http_response(&response)
}

/// Minimal HTTP/1.x response parsing: status line check + body split.
fn parse_http_response(response: &[u8]) -> Result<Vec<u8>> {
    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| TorError::Directory("malformed HTTP response".into()))?;

    let header = String::from_utf8_lossy(&response[..header_end]);
    let status_line = header
        .lines()
        .next()
        .ok_or_else(|| TorError::Directory("empty HTTP response".into()))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TorError::Directory(format!("bad status line '{}'", status_line)))?;

    if status != 200 {
        return Err(TorError::Directory(format!("HTTP status {}", status)));
    }

    Ok(response[header_end + 4..].to_vec())
}

fn shuffle(indices: &mut [usize]) {
    use rand::seq::SliceRandom;
    let mut rng = rand::thread_rng();
    indices.shuffle(&mut rng);
}
