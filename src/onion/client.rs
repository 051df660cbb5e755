//! Onion-service client
//!
//! Connecting to `xxxxx.onion:port`:
//! 1. parse the address and derive the blinded key for the current period
//! 2. compute the HSDir ring and fetch the descriptor over a BEGIN_DIR
//!    circuit whose last hop is the HSDir
//! 3. establish a rendezvous point, send INTRODUCE1 through an
//!    introduction point, and complete hs-ntor on RENDEZVOUS2
//! 4. append the service as a virtual hop on the rendezvous circuit;
//!    streams to the service then run over that circuit

use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use rand::seq::SliceRandom;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Result, TorError};
use crate::isolation::IsolationKey;
use crate::onion::address::OnionAddress;
use crate::onion::descriptor::{parse_descriptor, IntroPoint, LinkSpecifier, OnionDescriptor};
use crate::onion::hs_ntor::HsNtorClient;
use crate::onion::keys::{
    blind_pubkey, current_and_previous_periods, responsible_hsdirs, subcredential,
};
use crate::path::LastHop;
use crate::pool::CircuitFactory;
use crate::protocol::{
    CircuitHandle, CircuitPurpose, Consensus, ConsensusSource, Relay, RelayCommand, TorStream,
};

/// Introduction attempts before giving up on a service
const MAX_INTRO_ATTEMPTS: usize = 3;

/// Deadline for each control-cell exchange
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the service to show up at the rendezvous point
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(60);

/// Descriptor response size cap
const MAX_DESCRIPTOR_LEN: usize = 64 * 1024;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct CachedDescriptor {
    descriptor: OnionDescriptor,
    fetched_at: u64,
}

/// Client side of the v3 rendezvous protocol.
pub struct OnionClient {
    consensus: Arc<dyn ConsensusSource>,
    factory: Arc<dyn CircuitFactory>,
    stream_timeout: Duration,
    /// identity pubkey -> last good descriptor (revision counters must
    /// never move backward)
    cache: Mutex<HashMap<[u8; 32], CachedDescriptor>>,
}

impl OnionClient {
    pub fn new(
        consensus: Arc<dyn ConsensusSource>,
        factory: Arc<dyn CircuitFactory>,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            consensus,
            factory,
            stream_timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to an onion service: returns a circuit whose final (virtual)
    /// hop is the service itself, ready for BEGIN cells.
    pub async fn connect(
        &self,
        address: &OnionAddress,
        isolation: &IsolationKey,
    ) -> Result<CircuitHandle> {
        let consensus = self
            .consensus
            .current()
            .ok_or_else(|| TorError::Directory("no consensus for onion lookup".into()))?;

        let period_length = consensus.hsdir_interval_minutes();
        let (current, previous) = current_and_previous_periods(now_unix(), period_length);

        // The current period is authoritative; near a boundary the
        // previous period's ring may still hold the descriptor.
        let mut last_error = TorError::DescriptorUnavailable;
        for period in [current, previous] {
            let blinded = blind_pubkey(&address.pubkey, period, period_length)?;
            let subcred = subcredential(&address.pubkey, &blinded);
            match self
                .fetch_descriptor(&consensus, address, &blinded, &subcred, period)
                .await
            {
                Ok(descriptor) => {
                    return self
                        .introduce_and_rendezvous(&consensus, &descriptor, &subcred, isolation)
                        .await;
                }
                Err(e) => {
                    log::info!("descriptor fetch for period {} failed: {}", period, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Walk the HSDir ring until one returns a verifiable descriptor.
    async fn fetch_descriptor(
        &self,
        consensus: &Consensus,
        address: &OnionAddress,
        blinded: &[u8; 32],
        subcred: &[u8; 32],
        period: u64,
    ) -> Result<OnionDescriptor> {
        let hsdirs = responsible_hsdirs(consensus, blinded, period)?;
        log::debug!(
            "hsdir ring for {}: {} candidates",
            address.encode(),
            hsdirs.len()
        );

        let mut last_error = TorError::DescriptorUnavailable;
        for hsdir in hsdirs {
            match self.fetch_from_hsdir(&hsdir, blinded, subcred).await {
                Ok(descriptor) => {
                    // Revision counters must increase monotonically.
                    let mut cache = self.cache.lock().expect("lock poisoned");
                    if let Some(cached) = cache.get(&address.pubkey) {
                        if cached.descriptor.revision_counter > descriptor.revision_counter {
                            log::warn!(
                                "HSDir {} served a rolled-back descriptor ({} < {})",
                                hsdir.nickname,
                                descriptor.revision_counter,
                                cached.descriptor.revision_counter
                            );
                            last_error = TorError::DescriptorInvalid(
                                "revision counter moved backward".into(),
                            );
                            continue;
                        }
                    }
                    cache.insert(
                        address.pubkey,
                        CachedDescriptor {
                            descriptor: descriptor.clone(),
                            fetched_at: now_unix(),
                        },
                    );
                    return Ok(descriptor);
                }
                Err(e) => {
                    log::debug!("HSDir {} failed: {}", hsdir.nickname, e);
                    last_error = e;
                }
            }
        }

        // A still-fresh cached descriptor outlives transient HSDir trouble.
        if let Some(cached) = self.cache.lock().expect("lock poisoned").get(&address.pubkey) {
            if cached.descriptor.expires_at(cached.fetched_at) > now_unix() {
                log::info!("using cached descriptor for {}", address.encode());
                return Ok(cached.descriptor.clone());
            }
        }
        Err(last_error)
    }

    async fn fetch_from_hsdir(
        &self,
        hsdir: &Relay,
        blinded: &[u8; 32],
        subcred: &[u8; 32],
    ) -> Result<OnionDescriptor> {
        let circuit = self
            .factory
            .build(
                IsolationKey::none(),
                LastHop::Relay {
                    fingerprint: hsdir.fingerprint.clone(),
                },
                CircuitPurpose::OnionClient,
            )
            .await?;

        let result = self.http_fetch_descriptor(&circuit, blinded).await;
        circuit.close().await;
        let text = result?;

        parse_descriptor(&text, blinded, subcred)
    }

    async fn http_fetch_descriptor(
        &self,
        circuit: &CircuitHandle,
        blinded: &[u8; 32],
    ) -> Result<String> {
        let mut stream = TorStream::open_dir(circuit, self.stream_timeout).await?;
        let request = format!(
            "GET /tor/hs/3/{} HTTP/1.0\r\nHost: dir\r\n\r\n",
            BASE64_URL.encode(blinded)
        );
        stream.write_all(request.as_bytes()).await?;

        let response = stream.read_to_end(MAX_DESCRIPTOR_LEN).await?;
        stream.close(crate::protocol::END_REASON_DONE).await;

        let text = String::from_utf8_lossy(&response);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return Err(TorError::Directory("malformed HSDir response".into()));
        };
        let status: u16 = text
            .lines()
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if status != 200 {
            return Err(TorError::Directory(format!("HSDir returned {}", status)));
        }
        Ok(text[header_end + 4..].to_string())
    }

    /// Set up the rendezvous, introduce, and wait for the service.
    async fn introduce_and_rendezvous(
        &self,
        consensus: &Consensus,
        descriptor: &OnionDescriptor,
        subcred: &[u8; 32],
        isolation: &IsolationKey,
    ) -> Result<CircuitHandle> {
        // Rendezvous circuit first; its last hop is ours to choose.
        let rend_circuit = self
            .factory
            .build(
                isolation.clone(),
                LastHop::Rendezvous,
                CircuitPurpose::OnionRend,
            )
            .await?;
        let rend_relay = rend_circuit
            .path
            .last()
            .and_then(|fp| consensus.relays.iter().find(|r| &r.fingerprint == fp))
            .cloned()
            .ok_or_else(|| TorError::Internal("rendezvous relay not in consensus".into()))?;

        let mut cookie = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut cookie);
        let established = rend_circuit
            .watch_control(vec![RelayCommand::RendezvousEstablished])
            .await?;
        rend_circuit
            .send_control(RelayCommand::EstablishRendezvous, cookie.to_vec())
            .await?;
        rend_circuit
            .await_control(established, CONTROL_TIMEOUT)
            .await?;
        log::debug!("rendezvous established at {}", rend_relay.nickname);

        // Introduction points are tried in uniform random order.
        let mut intro_points: Vec<&IntroPoint> = descriptor.intro_points.iter().collect();
        intro_points.shuffle(&mut rand::thread_rng());

        let mut last_error = TorError::NoIntroPointsLeft;
        for intro_point in intro_points.into_iter().take(MAX_INTRO_ATTEMPTS) {
            match self
                .attempt_introduction(
                    consensus,
                    intro_point,
                    &rend_relay,
                    &cookie,
                    subcred,
                    isolation,
                    &rend_circuit,
                )
                .await
            {
                Ok(()) => return Ok(rend_circuit),
                Err(e) => {
                    log::info!("introduction attempt failed: {}", e);
                    if e.is_fatal_for_circuit() {
                        // The rendezvous circuit saw bad crypto: abandon it.
                        rend_circuit.close().await;
                        return Err(e);
                    }
                    last_error = e;
                }
            }
        }

        rend_circuit.close().await;
        Err(last_error)
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_introduction(
        &self,
        consensus: &Consensus,
        intro_point: &IntroPoint,
        rend_relay: &Relay,
        cookie: &[u8; 20],
        subcred: &[u8; 32],
        isolation: &IsolationKey,
        rend_circuit: &CircuitHandle,
    ) -> Result<()> {
        let legacy_id = LinkSpecifier::legacy_id(&intro_point.link_specifiers)
            .ok_or_else(|| TorError::DescriptorInvalid("intro point lacks identity".into()))?;
        let intro_fp = hex::encode_upper(legacy_id);
        if !consensus.relays.iter().any(|r| r.fingerprint == intro_fp) {
            return Err(TorError::NoPathAvailable(
                "introduction point not in consensus".into(),
            ));
        }

        let intro_circuit = self
            .factory
            .build(
                isolation.clone(),
                LastHop::Relay {
                    fingerprint: intro_fp,
                },
                CircuitPurpose::OnionIntro,
            )
            .await?;

        let handshake = HsNtorClient::start(intro_point.auth_key, intro_point.enc_key, *subcred);
        let body = build_introduce1(intro_point, rend_relay, cookie, &handshake)?;

        // The service may reach the rendezvous point before the ACK gets
        // back to us; watch for RENDEZVOUS2 before introducing.
        let rendezvous2 = rend_circuit
            .watch_control(vec![RelayCommand::Rendezvous2])
            .await?;

        let outcome = async {
            let acked = intro_circuit
                .watch_control(vec![RelayCommand::IntroduceAck])
                .await?;
            intro_circuit
                .send_control(RelayCommand::Introduce1, body)
                .await?;
            let ack = intro_circuit.await_control(acked, CONTROL_TIMEOUT).await?;
            let status = match ack.data.as_slice() {
                [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
                _ => 0xFFFF,
            };
            if status != 0 {
                return Err(TorError::IntroFailure { status });
            }
            Ok(())
        }
        .await;
        intro_circuit.close().await;
        outcome?;

        // The service connects to the rendezvous point and we complete the
        // handshake from its RENDEZVOUS2.
        let rend2 = rend_circuit
            .await_control(rendezvous2, RENDEZVOUS_TIMEOUT)
            .await?;
        let keys = handshake.finish_rendezvous2(&rend2.data)?;
        rend_circuit.append_virtual_hop(keys).await?;
        log::info!(
            "rendezvous complete on circuit {} (virtual hop appended)",
            rend_circuit.circ_id
        );
        Ok(())
    }
}

/// Assemble the INTRODUCE1 body.
///
/// Plaintext prefix: LEGACY_KEY_ID(20, zero) | AUTH_KEY_TYPE(1)=2 |
/// AUTH_KEY_LEN(2) | AUTH_KEY | N_EXTENSIONS(1)=0, followed by the sealed
/// section `X | CIPHERTEXT | MAC` whose plaintext carries the rendezvous
/// cookie, the rendezvous point's onion key and link specifiers.
fn build_introduce1(
    intro_point: &IntroPoint,
    rend_relay: &Relay,
    cookie: &[u8; 20],
    handshake: &HsNtorClient,
) -> Result<Vec<u8>> {
    let mut header = Vec::with_capacity(20 + 1 + 2 + 32 + 1);
    header.extend_from_slice(&[0u8; 20]); // legacy key id: none
    header.push(0x02); // auth key type: ed25519
    header.extend_from_slice(&32u16.to_be_bytes());
    header.extend_from_slice(&intro_point.auth_key);
    header.push(0); // no extensions

    let rend_ntor = rend_relay
        .ntor_onion_key
        .ok_or_else(|| TorError::Internal("rendezvous relay lacks ntor key".into()))?;
    let rend_fp = rend_relay.fingerprint_bytes()?;

    let mut plaintext = Vec::new();
    plaintext.extend_from_slice(cookie);
    plaintext.push(0); // no extensions
    plaintext.push(0x01); // onion key type: ntor
    plaintext.extend_from_slice(&32u16.to_be_bytes());
    plaintext.extend_from_slice(&rend_ntor);

    // Link specifiers for the rendezvous point
    let mut specs: Vec<(u8, Vec<u8>)> = Vec::new();
    if let std::net::IpAddr::V4(v4) = rend_relay.address {
        let mut spec = v4.octets().to_vec();
        spec.extend_from_slice(&rend_relay.or_port.to_be_bytes());
        specs.push((0x00, spec));
    }
    specs.push((0x02, rend_fp.to_vec()));
    if let Some(ed) = rend_relay.ed25519_identity {
        specs.push((0x03, ed.to_vec()));
    }
    plaintext.push(specs.len() as u8);
    for (spec_type, spec) in specs {
        plaintext.push(spec_type);
        plaintext.push(spec.len() as u8);
        plaintext.extend_from_slice(&spec);
    }

    let sealed = handshake.seal_introduce1(&header, &plaintext)?;

    let mut body = header;
    body.extend_from_slice(&sealed);
    Ok(body)
}
