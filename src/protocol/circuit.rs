//! Circuit engine
//!
//! Builds circuits hop by hop (CREATE2 / EXTEND2 with the ntor handshake),
//! routes relay cells through the per-hop onion crypto, enforces SENDME
//! flow control, and owns stream dispatch.
//!
//! Every circuit is driven by exactly one reactor task that owns the hop
//! cipher and digest state; external callers talk to it through a
//! [`CircuitHandle`] command channel. No hop state is ever shared across
//! tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use x25519_dalek::PublicKey;

use crate::error::{destroy_reason_name, Result, TorError};
use crate::isolation::IsolationKey;
use crate::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use crate::protocol::crypto::{CircuitKeys, HopCrypto};
use crate::protocol::flow_control::{CircuitFlowControl, StreamFlowControl};
use crate::protocol::link::Link;
use crate::protocol::ntor::{self, NtorHandshake};
use crate::protocol::relay::Relay;

/// RELAY_EARLY cells permitted per circuit (bounds path length)
const RELAY_EARLY_BUDGET: u8 = 8;

/// Deadline for a single CREATED2/EXTENDED2 step
const HOP_STEP_TIMEOUT: Duration = Duration::from_secs(20);

/// Inbound data cells buffered per stream. Must cover the full initial
/// stream window plus replenishment slack so a window-legal cell always
/// has a slot; see `flush_stream_sendmes`.
const STREAM_QUEUE: usize = 600;

/// What a circuit was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPurpose {
    General,
    OnionClient,
    OnionIntro,
    OnionRend,
}

/// Circuit lifecycle states. Terminal is `Closed`; no resurrection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    New,
    Pending,
    Building,
    Open,
    Closing,
    Closed,
}

/// One hop of a circuit: relay identity plus the cipher/digest state tying
/// it to us. Owned exclusively by the circuit; destroyed with it.
pub struct Hop {
    /// RSA identity fingerprint
    pub fingerprint: [u8; 20],
    /// Ed25519 identity when known (virtual hops have none)
    pub ed_identity: Option<[u8; 32]>,
    crypto: HopCrypto,
}

impl Hop {
    pub fn new(fingerprint: [u8; 20], ed_identity: Option<[u8; 32]>, keys: &CircuitKeys) -> Self {
        Self {
            fingerprint,
            ed_identity,
            crypto: HopCrypto::new(keys),
        }
    }
}

/// Onion-encrypt an outbound relay cell addressed to `dest_hop`.
///
/// The digest is stamped with the destination hop's rolling forward digest
/// over the digest-zeroed payload, then each hop's forward layer is applied
/// from the destination backward to the first hop.
pub fn encrypt_outbound(
    hops: &mut [Hop],
    dest_hop: usize,
    relay_cell: &RelayCell,
) -> Result<Vec<u8>> {
    let mut payload = relay_cell.encode()?;
    debug_assert_eq!(payload.len(), Cell::PAYLOAD_SIZE);
    payload[5..9].copy_from_slice(&[0, 0, 0, 0]);

    hops[dest_hop].crypto.stamp_forward_digest(&mut payload);
    for hop in hops[..=dest_hop].iter_mut().rev() {
        hop.crypto.encrypt_forward(&mut payload);
    }
    Ok(payload)
}

/// Peel an inbound RELAY payload and find the hop that sent it.
///
/// Layers are removed in hop order; after each, a zero `recognized` field
/// plus a matching rolling digest identifies the source hop. If no hop
/// claims the cell the circuit must be destroyed.
pub fn decrypt_inbound(hops: &mut [Hop], payload: &[u8]) -> Result<(usize, RelayCell)> {
    let mut working = payload.to_vec();
    for (idx, hop) in hops.iter_mut().enumerate() {
        hop.crypto.decrypt_backward(&mut working);

        let recognized = u16::from_be_bytes([working[1], working[2]]);
        if recognized == 0 && hop.crypto.verify_backward_digest(&working) {
            let relay_cell = RelayCell::decode(&working)?;
            return Ok((idx, relay_cell));
        }
    }
    Err(TorError::Protocol(
        "relay cell not recognized by any hop".into(),
    ))
}

/// Target of a stream open request.
#[derive(Debug, Clone)]
pub enum StreamTarget {
    /// BEGIN to host:port through the exit
    Exit { host: String, port: u16 },
    /// BEGIN_DIR to the final hop's directory service
    Dir,
}

/// Inbound events delivered to a stream's reader.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Vec<u8>),
    /// END with reason, or circuit teardown
    End(u8),
}

/// What the reactor hands back on a successful stream open.
pub struct StreamAttachment {
    pub stream_id: u16,
    pub events: mpsc::Receiver<StreamEvent>,
}

enum CircuitCmd {
    OpenStream {
        target: StreamTarget,
        reply: oneshot::Sender<Result<StreamAttachment>>,
    },
    StreamSend {
        stream_id: u16,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseStream {
        stream_id: u16,
        reason: u8,
    },
    SendControl {
        command: RelayCommand,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    AwaitControl {
        accept: Vec<RelayCommand>,
        reply: oneshot::Sender<Result<RelayCell>>,
    },
    AppendVirtualHop {
        keys: Box<CircuitKeys>,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Shared, cloneable handle to an open circuit.
#[derive(Clone)]
pub struct CircuitHandle {
    pub circ_id: u32,
    pub purpose: CircuitPurpose,
    pub isolation: IsolationKey,
    /// Hex fingerprints of the relay path, first hop first
    pub path: Vec<String>,
    created_at: Instant,
    dirty_since: Arc<Mutex<Option<Instant>>>,
    cmd_tx: mpsc::Sender<CircuitCmd>,
    closed: Arc<AtomicBool>,
}

impl CircuitHandle {
    /// Detached handle with no reactor behind it, for pool bookkeeping
    /// tests.
    #[cfg(test)]
    pub(crate) fn detached(circ_id: u32, isolation: IsolationKey, path: Vec<String>) -> Self {
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        Self {
            circ_id,
            purpose: CircuitPurpose::General,
            isolation,
            path,
            created_at: Instant::now(),
            dirty_since: Arc::new(Mutex::new(None)),
            cmd_tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Force-close a detached test handle.
    #[cfg(test)]
    pub(crate) fn test_force_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Mark dirty as if a stream attached, for eviction tests.
    #[cfg(test)]
    pub(crate) fn test_mark_dirty(&self) {
        self.mark_dirty();
    }

    /// Whether the circuit is still usable.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the first stream was attached, if any.
    pub fn dirty_age(&self) -> Option<Duration> {
        self.dirty_since
            .lock()
            .expect("lock poisoned")
            .map(|t| t.elapsed())
    }

    fn mark_dirty(&self) {
        let mut dirty = self.dirty_since.lock().expect("lock poisoned");
        if dirty.is_none() {
            *dirty = Some(Instant::now());
        }
    }

    async fn send_cmd(&self, cmd: CircuitCmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| TorError::CircuitClosed)
    }

    /// Open a stream on this circuit and wait for CONNECTED.
    pub async fn open_stream(
        &self,
        target: StreamTarget,
        timeout: Duration,
    ) -> Result<StreamAttachment> {
        self.mark_dirty();
        let (reply, rx) = oneshot::channel();
        self.send_cmd(CircuitCmd::OpenStream { target, reply }).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TorError::CircuitClosed),
            Err(_) => Err(TorError::Timeout("stream open".into())),
        }
    }

    /// Send one DATA cell worth of bytes. Blocks while windows are closed.
    pub async fn stream_send(&self, stream_id: u16, data: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(CircuitCmd::StreamSend {
            stream_id,
            data,
            reply,
        })
        .await?;
        rx.await.map_err(|_| TorError::CircuitClosed)?
    }

    /// Close one stream with an END reason.
    pub async fn close_stream(&self, stream_id: u16, reason: u8) {
        let _ = self
            .send_cmd(CircuitCmd::CloseStream { stream_id, reason })
            .await;
    }

    /// Send a circuit-scoped relay command (onion-service signalling).
    pub async fn send_control(&self, command: RelayCommand, body: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(CircuitCmd::SendControl {
            command,
            body,
            reply,
        })
        .await?;
        rx.await.map_err(|_| TorError::CircuitClosed)?
    }

    /// Register interest in a circuit-scoped relay reply. The waiter must
    /// be parked before the triggering request goes out, otherwise a fast
    /// peer's reply would arrive unclaimed and tear the circuit down.
    pub async fn watch_control(
        &self,
        accept: Vec<RelayCommand>,
    ) -> Result<oneshot::Receiver<Result<RelayCell>>> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(CircuitCmd::AwaitControl { accept, reply }).await?;
        Ok(rx)
    }

    /// Await a previously watched control reply.
    pub async fn await_control(
        &self,
        watch: oneshot::Receiver<Result<RelayCell>>,
        timeout: Duration,
    ) -> Result<RelayCell> {
        match tokio::time::timeout(timeout, watch).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TorError::CircuitClosed),
            Err(_) => Err(TorError::Timeout("control cell wait".into())),
        }
    }

    /// Append a virtual hop (the onion service end of a rendezvous).
    pub async fn append_virtual_hop(&self, keys: CircuitKeys) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(CircuitCmd::AppendVirtualHop {
            keys: Box::new(keys),
            reply,
        })
        .await?;
        rx.await.map_err(|_| TorError::CircuitClosed)?
    }

    /// Close the circuit (sends DESTROY). Idempotent.
    pub async fn close(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let (reply, rx) = oneshot::channel();
        if self
            .send_cmd(CircuitCmd::Close { reply: Some(reply) })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Builds circuits over an established link.
pub struct CircuitBuilder;

impl CircuitBuilder {
    /// Build a circuit through `path` (first hop first) on `link`,
    /// returning an open circuit handle. The caller bounds the whole
    /// operation with its own deadline.
    pub async fn build(
        link: Arc<Link>,
        path: &[Relay],
        purpose: CircuitPurpose,
        isolation: IsolationKey,
    ) -> Result<CircuitHandle> {
        if path.is_empty() {
            return Err(TorError::Internal("empty path".into()));
        }

        let (circ_id, mut incoming) = link.register_new_circuit();
        let mut pending = PendingCircuit {
            circ_id,
            link: link.clone(),
            hops: Vec::with_capacity(path.len()),
            relay_early_remaining: RELAY_EARLY_BUDGET,
            state: CircuitState::New,
            armed: true,
        };

        log::debug!("building circuit {} ({} hops)", circ_id, path.len());

        // First hop: CREATE2 / CREATED2
        pending.create_first_hop(&mut incoming, &path[0]).await?;

        // Remaining hops: EXTEND2 / EXTENDED2 through the built prefix
        for relay in &path[1..] {
            pending.extend_to(&mut incoming, relay).await?;
        }

        log::info!(
            "circuit {} open: {}",
            circ_id,
            path.iter()
                .map(|r| r.nickname.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        Ok(pending.into_reactor(incoming, purpose, isolation, path))
    }
}

/// Circuit under construction. Sends DESTROY if dropped before completion
/// (cancelled build).
struct PendingCircuit {
    circ_id: u32,
    link: Arc<Link>,
    hops: Vec<Hop>,
    relay_early_remaining: u8,
    state: CircuitState,
    armed: bool,
}

impl Drop for PendingCircuit {
    fn drop(&mut self) {
        if self.armed {
            self.link.try_send_cell(Cell::destroy(self.circ_id, 0));
            self.link.unregister_circuit(self.circ_id);
        }
    }
}

impl PendingCircuit {
    async fn next_cell(&self, incoming: &mut mpsc::Receiver<Cell>) -> Result<Cell> {
        loop {
            let cell = tokio::time::timeout(HOP_STEP_TIMEOUT, incoming.recv())
                .await
                .map_err(|_| TorError::BuildTimeout)?
                .ok_or_else(|| TorError::LinkDown("link dropped during build".into()))?;
            match cell.command {
                CellCommand::Padding | CellCommand::Vpadding => continue,
                CellCommand::Destroy => {
                    let reason = cell.payload.first().copied().unwrap_or(0);
                    return Err(TorError::CircuitDestroyed { reason });
                }
                _ => return Ok(cell),
            }
        }
    }

    async fn create_first_hop(
        &mut self,
        incoming: &mut mpsc::Receiver<Cell>,
        relay: &Relay,
    ) -> Result<()> {
        let fingerprint = relay.fingerprint_bytes()?;
        let ntor_key = relay
            .ntor_onion_key
            .ok_or_else(|| TorError::Internal(format!("{} has no ntor key", relay.nickname)))?;

        let handshake = NtorHandshake::start(fingerprint, PublicKey::from(ntor_key))?;
        let payload = ntor::create2_payload(&handshake.onionskin());
        self.state = CircuitState::Pending;
        self.link
            .send_cell(Cell::new(self.circ_id, CellCommand::Create2, payload))
            .await?;

        let reply = self.next_cell(incoming).await?;
        if reply.command != CellCommand::Created2 {
            return Err(TorError::UnexpectedCell {
                expected: "CREATED2".into(),
                got: format!("{:?}", reply.command),
            });
        }
        let hdata = ntor::parse_created2(&reply.payload)?;
        let (keys, _kh) = handshake.finish(hdata)?;

        self.hops
            .push(Hop::new(fingerprint, relay.ed25519_identity, &keys));
        Ok(())
    }

    async fn extend_to(
        &mut self,
        incoming: &mut mpsc::Receiver<Cell>,
        relay: &Relay,
    ) -> Result<()> {
        if self.relay_early_remaining == 0 {
            return Err(TorError::Protocol("RELAY_EARLY budget exhausted".into()));
        }

        let fingerprint = relay.fingerprint_bytes()?;
        let ntor_key = relay
            .ntor_onion_key
            .ok_or_else(|| TorError::Internal(format!("{} has no ntor key", relay.nickname)))?;
        let handshake = NtorHandshake::start(fingerprint, PublicKey::from(ntor_key))?;
        self.state = CircuitState::Building;

        let body = build_extend2_body(relay, &fingerprint, &handshake.onionskin());
        let relay_cell = RelayCell::new(RelayCommand::Extend2, 0, body)?;

        let dest = self.hops.len() - 1;
        let payload = encrypt_outbound(&mut self.hops, dest, &relay_cell)?;
        self.relay_early_remaining -= 1;
        self.link
            .send_cell(Cell::relay_early(self.circ_id, payload))
            .await?;

        let reply = self.next_cell(incoming).await?;
        if reply.command != CellCommand::Relay && reply.command != CellCommand::RelayEarly {
            return Err(TorError::UnexpectedCell {
                expected: "RELAY (EXTENDED2)".into(),
                got: format!("{:?}", reply.command),
            });
        }
        let (source_hop, relay_reply) = decrypt_inbound(&mut self.hops, &reply.payload)?;
        if source_hop != dest {
            return Err(TorError::Protocol(
                "EXTENDED2 arrived from the wrong hop".into(),
            ));
        }
        if relay_reply.command != RelayCommand::Extended2 {
            if relay_reply.command == RelayCommand::Truncated {
                let reason = relay_reply.data.first().copied().unwrap_or(0);
                return Err(TorError::ExtendRefused(format!(
                    "TRUNCATED reason {} ({})",
                    reason,
                    destroy_reason_name(reason)
                )));
            }
            return Err(TorError::UnexpectedCell {
                expected: "EXTENDED2".into(),
                got: format!("{:?}", relay_reply.command),
            });
        }

        let hdata = ntor::parse_extended2(&relay_reply.data)?;
        let (keys, _kh) = handshake.finish(hdata)?;
        self.hops
            .push(Hop::new(fingerprint, relay.ed25519_identity, &keys));
        Ok(())
    }

    fn into_reactor(
        mut self,
        incoming: mpsc::Receiver<Cell>,
        purpose: CircuitPurpose,
        isolation: IsolationKey,
        path: &[Relay],
    ) -> CircuitHandle {
        self.armed = false;
        self.state = CircuitState::Open;
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let closed = Arc::new(AtomicBool::new(false));

        let reactor = CircuitReactor {
            circ_id: self.circ_id,
            link: self.link.clone(),
            hops: std::mem::take(&mut self.hops),
            state: self.state,
            flow: CircuitFlowControl::new(),
            streams: HashMap::new(),
            pending_receivers: HashMap::new(),
            next_stream_id: 1,
            blocked_sends: VecDeque::new(),
            control_waiters: VecDeque::new(),
            closed: closed.clone(),
        };
        tokio::spawn(reactor.run(incoming, cmd_rx));

        CircuitHandle {
            circ_id: self.circ_id,
            purpose,
            isolation,
            path: path.iter().map(|r| r.fingerprint.clone()).collect(),
            created_at: Instant::now(),
            dirty_since: Arc::new(Mutex::new(None)),
            cmd_tx,
            closed,
        }
    }
}

/// EXTEND2 body: link specifiers for the target relay, then the ntor
/// handshake block.
fn build_extend2_body(relay: &Relay, fingerprint: &[u8; 20], onionskin: &[u8]) -> Vec<u8> {
    let mut specs: Vec<(u8, Vec<u8>)> = Vec::new();

    if let std::net::IpAddr::V4(v4) = relay.address {
        let mut spec = v4.octets().to_vec();
        spec.extend_from_slice(&relay.or_port.to_be_bytes());
        specs.push((0x00, spec)); // TLS-over-TCP, IPv4
    }
    specs.push((0x02, fingerprint.to_vec())); // legacy identity
    if let Some(ed) = relay.ed25519_identity {
        specs.push((0x03, ed.to_vec())); // ed25519 identity
    }
    if let Some(v6) = relay.ipv6_address {
        if let std::net::IpAddr::V6(addr) = v6.ip() {
            let mut spec = addr.octets().to_vec();
            spec.extend_from_slice(&v6.port().to_be_bytes());
            specs.push((0x01, spec)); // TLS-over-TCP, IPv6
        }
    }

    let mut body = Vec::new();
    body.push(specs.len() as u8);
    for (spec_type, spec) in specs {
        body.push(spec_type);
        body.push(spec.len() as u8);
        body.extend_from_slice(&spec);
    }
    body.extend_from_slice(&ntor::HANDSHAKE_TYPE_NTOR.to_be_bytes());
    body.extend_from_slice(&(onionskin.len() as u16).to_be_bytes());
    body.extend_from_slice(onionskin);
    body
}

struct StreamState {
    events: mpsc::Sender<StreamEvent>,
    connect_reply: Option<oneshot::Sender<Result<StreamAttachment>>>,
    flow: StreamFlowControl,
    /// Stream SENDMEs earned but withheld while the reader lags
    sendmes_owed: u32,
}

struct BlockedSend {
    stream_id: u16,
    data: Vec<u8>,
    reply: oneshot::Sender<Result<()>>,
}

/// The single task that owns a circuit's dispatch.
struct CircuitReactor {
    circ_id: u32,
    link: Arc<Link>,
    hops: Vec<Hop>,
    state: CircuitState,
    flow: CircuitFlowControl,
    streams: HashMap<u16, StreamState>,
    /// Event receivers parked between BEGIN and CONNECTED
    pending_receivers: HashMap<u16, mpsc::Receiver<StreamEvent>>,
    next_stream_id: u16,
    blocked_sends: VecDeque<BlockedSend>,
    control_waiters: VecDeque<(Vec<RelayCommand>, oneshot::Sender<Result<RelayCell>>)>,
    closed: Arc<AtomicBool>,
}

impl CircuitReactor {
    async fn run(
        mut self,
        mut incoming: mpsc::Receiver<Cell>,
        mut commands: mpsc::Receiver<CircuitCmd>,
    ) {
        // Withheld SENDMEs are retried here once the reader catches up;
        // without this tick a fully stalled peer would never be
        // re-authorized after the application drains its buffer.
        let mut flush_tick = tokio::time::interval(Duration::from_millis(100));
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = flush_tick.tick() => {
                    let stream_ids: Vec<u16> = self
                        .streams
                        .iter()
                        .filter(|(_, s)| s.sendmes_owed > 0)
                        .map(|(id, _)| *id)
                        .collect();
                    for stream_id in stream_ids {
                        if let Err(e) = self.flush_stream_sendmes(stream_id).await {
                            log::warn!("circuit {}: {}", self.circ_id, e);
                            self.teardown(Some(0), &e.to_string()).await;
                            return;
                        }
                    }
                }
                cell = incoming.recv() => {
                    match cell {
                        Some(cell) => {
                            if let Err(e) = self.handle_cell(cell).await {
                                log::warn!("circuit {}: {}", self.circ_id, e);
                                let reason = if e.is_fatal_for_circuit() { 1 } else { 0 };
                                self.teardown(Some(reason), &e.to_string()).await;
                                return;
                            }
                            if self.state == CircuitState::Closed {
                                return;
                            }
                        }
                        None => {
                            self.teardown(None, "link closed").await;
                            return;
                        }
                    }
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_cmd(cmd).await {
                                return;
                            }
                        }
                        None => {
                            // All handles dropped: close quietly.
                            self.teardown(Some(0), "handles dropped").await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Returns true when the reactor should exit.
    async fn handle_cmd(&mut self, cmd: CircuitCmd) -> bool {
        match cmd {
            CircuitCmd::OpenStream { target, reply } => {
                match self.start_stream(target).await {
                    Ok(stream_id) => {
                        // Reply is parked until CONNECTED arrives.
                        if let Some(stream) = self.streams.get_mut(&stream_id) {
                            stream.connect_reply = Some(reply);
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            CircuitCmd::StreamSend {
                stream_id,
                data,
                reply,
            } => {
                self.queue_stream_send(stream_id, data, reply).await;
            }
            CircuitCmd::CloseStream { stream_id, reason } => {
                self.pending_receivers.remove(&stream_id);
                if self.streams.remove(&stream_id).is_some() {
                    let _ = self
                        .send_relay(RelayCommand::End, stream_id, vec![reason])
                        .await;
                }
            }
            CircuitCmd::SendControl {
                command,
                body,
                reply,
            } => {
                let result = self.send_relay(command, 0, body).await;
                let _ = reply.send(result);
            }
            CircuitCmd::AwaitControl { accept, reply } => {
                self.control_waiters.push_back((accept, reply));
            }
            CircuitCmd::AppendVirtualHop { keys, reply } => {
                self.hops.push(Hop::new([0u8; 20], None, &keys));
                let _ = reply.send(Ok(()));
            }
            CircuitCmd::Close { reply } => {
                self.teardown(Some(0), "requested").await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return true;
            }
        }
        false
    }

    /// Allocate a stream id (increment-and-wrap, collision-checked).
    fn allocate_stream_id(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_stream_id;
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            if self.next_stream_id == 0 {
                self.next_stream_id = 1;
            }
            if candidate != 0 && !self.streams.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(TorError::ResourceExhausted(
            "stream-id space exhausted on circuit".into(),
        ))
    }

    async fn start_stream(&mut self, target: StreamTarget) -> Result<u16> {
        let stream_id = self.allocate_stream_id()?;
        let (events, events_rx) = mpsc::channel(STREAM_QUEUE);

        // The receiver is handed back on CONNECTED; stash it until then.
        let (command, body) = match &target {
            StreamTarget::Exit { host, port } => {
                let mut body = format!("{}:{}", host, port).into_bytes();
                body.push(0);
                body.extend_from_slice(&0u32.to_be_bytes()); // flags
                (RelayCommand::Begin, body)
            }
            StreamTarget::Dir => (RelayCommand::BeginDir, Vec::new()),
        };

        self.streams.insert(
            stream_id,
            StreamState {
                events,
                connect_reply: None,
                flow: StreamFlowControl::new(stream_id),
                sendmes_owed: 0,
            },
        );
        // Keep the receiver alongside until CONNECTED
        self.pending_receivers.insert(stream_id, events_rx);

        if let Err(e) = self.send_relay(command, stream_id, body).await {
            self.streams.remove(&stream_id);
            self.pending_receivers.remove(&stream_id);
            return Err(e);
        }
        Ok(stream_id)
    }

    async fn queue_stream_send(
        &mut self,
        stream_id: u16,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if !self.streams.contains_key(&stream_id) {
            let _ = reply.send(Err(TorError::CircuitClosed));
            return;
        }
        self.blocked_sends.push_back(BlockedSend {
            stream_id,
            data,
            reply,
        });
        self.drain_blocked_sends().await;
    }

    /// Send as many queued DATA cells as the windows currently allow.
    /// Writers whose cells cannot go out stay queued (they block, never
    /// drop).
    async fn drain_blocked_sends(&mut self) {
        while let Some(front) = self.blocked_sends.front() {
            let stream_id = front.stream_id;
            let Some(stream) = self.streams.get(&stream_id) else {
                let send = self.blocked_sends.pop_front().expect("nonempty");
                let _ = send.reply.send(Err(TorError::CircuitClosed));
                continue;
            };
            if !self.flow.can_send() || !stream.flow.can_send() {
                break;
            }

            let send = self.blocked_sends.pop_front().expect("nonempty");
            let mut result = self
                .send_relay(RelayCommand::Data, stream_id, send.data)
                .await;
            if result.is_ok() {
                result = self.flow.note_sent();
            }
            if result.is_ok() {
                result = self
                    .streams
                    .get_mut(&stream_id)
                    .expect("stream present")
                    .flow
                    .note_sent();
            }
            let failed = result.is_err();
            let _ = send.reply.send(result);
            if failed {
                break;
            }
        }
    }

    /// Send owed stream SENDMEs while the buffer keeps room for the cells
    /// each one authorizes (free slots minus the peer's remaining window
    /// must cover one increment).
    async fn flush_stream_sendmes(&mut self, stream_id: u16) -> Result<()> {
        loop {
            let gate_open = match self.streams.get(&stream_id) {
                Some(stream) => {
                    // One extra slot stays reserved so a final END always
                    // has room even with the window fully spent.
                    stream.sendmes_owed > 0
                        && stream.events.capacity() as i32 - stream.flow.deliver_window
                            > StreamFlowControl::WINDOW_INCREMENT
                }
                None => false,
            };
            if !gate_open {
                return Ok(());
            }
            self.send_relay(RelayCommand::Sendme, stream_id, Vec::new())
                .await?;
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.flow.note_sendme_sent();
                stream.sendmes_owed -= 1;
            }
        }
    }

    /// Onion-encrypt and ship one relay cell to the last hop.
    async fn send_relay(
        &mut self,
        command: RelayCommand,
        stream_id: u16,
        body: Vec<u8>,
    ) -> Result<()> {
        let relay_cell = RelayCell::new(command, stream_id, body)?;
        let dest = self.hops.len() - 1;
        let payload = encrypt_outbound(&mut self.hops, dest, &relay_cell)?;
        self.link.send_cell(Cell::relay(self.circ_id, payload)).await
    }

    async fn handle_cell(&mut self, cell: Cell) -> Result<()> {
        match cell.command {
            CellCommand::Relay | CellCommand::RelayEarly => {
                let (source_hop, relay_cell) = decrypt_inbound(&mut self.hops, &cell.payload)?;
                self.handle_relay_cell(source_hop, relay_cell).await
            }
            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                log::info!(
                    "circuit {} destroyed by peer: {}",
                    self.circ_id,
                    destroy_reason_name(reason)
                );
                self.teardown(None, destroy_reason_name(reason)).await;
                Ok(())
            }
            CellCommand::Padding | CellCommand::Vpadding | CellCommand::PaddingNegotiate => Ok(()),
            other => Err(TorError::UnexpectedCell {
                expected: "RELAY/DESTROY".into(),
                got: format!("{:?}", other),
            }),
        }
    }

    async fn handle_relay_cell(&mut self, source_hop: usize, relay_cell: RelayCell) -> Result<()> {
        match relay_cell.command {
            RelayCommand::Data => {
                let stream_id = relay_cell.stream_id;

                // Circuit-level accounting first; a SENDME may be owed.
                let circuit_sendme_owed = self.flow.note_received()?;

                match self.streams.get_mut(&stream_id) {
                    Some(stream) => {
                        if stream.flow.note_received()? {
                            stream.sendmes_owed += 1;
                        }
                        // Delivery never blocks dispatch: SENDMEs are gated
                        // on buffer capacity, so a window-legal cell always
                        // fits. A full buffer means the peer overran its
                        // window.
                        match stream.events.try_send(StreamEvent::Data(relay_cell.data)) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                return Err(TorError::Protocol(format!(
                                    "stream {} buffer overrun",
                                    stream_id
                                )));
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                // Reader gone; half-closed. Drop the data.
                            }
                        }
                    }
                    None => {
                        log::debug!(
                            "circuit {}: DATA for unknown stream {}",
                            self.circ_id,
                            stream_id
                        );
                    }
                }

                // Owed stream SENDMEs go out only while the buffer can
                // absorb what they authorize; a slow reader withholds them.
                self.flush_stream_sendmes(stream_id).await?;

                if circuit_sendme_owed {
                    self.send_relay(RelayCommand::Sendme, 0, Vec::new()).await?;
                    self.flow.note_sendme_sent();
                }
                Ok(())
            }
            RelayCommand::Connected => {
                let receiver = self.pending_receivers.remove(&relay_cell.stream_id);
                if let Some(stream) = self.streams.get_mut(&relay_cell.stream_id) {
                    if let (Some(reply), Some(events)) = (stream.connect_reply.take(), receiver) {
                        let _ = reply.send(Ok(StreamAttachment {
                            stream_id: relay_cell.stream_id,
                            events,
                        }));
                    }
                }
                Ok(())
            }
            RelayCommand::End => {
                let reason = relay_cell.data.first().copied().unwrap_or(0);
                if let Some(mut stream) = self.streams.remove(&relay_cell.stream_id) {
                    self.pending_receivers.remove(&relay_cell.stream_id);
                    if let Some(reply) = stream.connect_reply.take() {
                        // END before CONNECTED: the exit refused the target.
                        let err = if reason == 6 {
                            TorError::CircuitClosed
                        } else {
                            TorError::TargetRefused { reason }
                        };
                        let _ = reply.send(Err(err));
                    } else {
                        // A slot is always reserved for END by the SENDME
                        // gate, so this cannot be rejected for capacity.
                        let _ = stream.events.try_send(StreamEvent::End(reason));
                    }
                }
                Ok(())
            }
            RelayCommand::Sendme => {
                if relay_cell.stream_id == 0 {
                    self.flow.note_sendme_received();
                } else if let Some(stream) = self.streams.get_mut(&relay_cell.stream_id) {
                    stream.flow.note_sendme_received();
                }
                self.drain_blocked_sends().await;
                Ok(())
            }
            RelayCommand::Drop => Ok(()), // long-range padding: no-op
            RelayCommand::Truncated => {
                let reason = relay_cell.data.first().copied().unwrap_or(0);
                Err(TorError::Protocol(format!(
                    "circuit truncated: {}",
                    destroy_reason_name(reason)
                )))
            }
            RelayCommand::Extended2
            | RelayCommand::RendezvousEstablished
            | RelayCommand::Rendezvous2
            | RelayCommand::IntroduceAck => {
                // Circuit-scoped control replies for a parked waiter.
                // Watchers whose receiver was dropped (an abandoned
                // attempt) must not swallow the reply.
                self.control_waiters.retain(|(_, reply)| !reply.is_closed());
                let position = self
                    .control_waiters
                    .iter()
                    .position(|(accept, _)| accept.contains(&relay_cell.command));
                match position {
                    Some(idx) => {
                        let (_, reply) = self.control_waiters.remove(idx).expect("index valid");
                        let _ = reply.send(Ok(relay_cell));
                        Ok(())
                    }
                    None => {
                        let _ = source_hop;
                        Err(TorError::UnexpectedCell {
                            expected: "none (no control waiter)".into(),
                            got: format!("{:?}", relay_cell.command),
                        })
                    }
                }
            }
            other => Err(TorError::Protocol(format!(
                "unhandled relay command {:?}",
                other
            ))),
        }
    }

    async fn teardown(&mut self, send_destroy: Option<u8>, reason: &str) {
        if self.state == CircuitState::Closed {
            return;
        }
        self.state = CircuitState::Closing;
        log::debug!("circuit {} teardown: {}", self.circ_id, reason);

        // Streams observe EOF, then errors on any further operation.
        for (_, stream) in self.streams.drain() {
            let _ = stream.events.try_send(StreamEvent::End(5)); // DESTROY
            if let Some(reply) = stream.connect_reply {
                let _ = reply.send(Err(TorError::CircuitClosed));
            }
        }
        self.pending_receivers.clear();
        while let Some(send) = self.blocked_sends.pop_front() {
            let _ = send.reply.send(Err(TorError::CircuitClosed));
        }
        while let Some((_, reply)) = self.control_waiters.pop_front() {
            let _ = reply.send(Err(TorError::CircuitClosed));
        }

        if let Some(reason) = send_destroy {
            let _ = self.link.send_cell(Cell::destroy(self.circ_id, reason)).await;
        }
        self.link.unregister_circuit(self.circ_id);
        self.state = CircuitState::Closed;
        self.closed.store(true, Ordering::SeqCst);
    }
}
