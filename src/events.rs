//! Lifecycle events
//!
//! The core publishes circuit and stream lifecycle events to an injected
//! [`EventSink`]. The control-protocol server and metrics layer consume
//! these; the core never depends on them.

use std::sync::Arc;

/// Bootstrap progress phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    Starting,
    FetchingConsensus,
    ConsensusValid,
    BuildingCircuits,
    Done,
}

/// A lifecycle event emitted by the core.
#[derive(Debug, Clone)]
pub enum Event {
    Bootstrap {
        phase: BootstrapPhase,
    },
    CircuitOpened {
        circ_id: u32,
        hops: Vec<String>,
    },
    CircuitClosed {
        circ_id: u32,
        reason: String,
    },
    StreamOpened {
        circ_id: u32,
        stream_id: u16,
        target: String,
    },
    StreamClosed {
        circ_id: u32,
        stream_id: u16,
    },
    GuardConfirmed {
        fingerprint: String,
    },
    ConsensusRefreshed {
        relay_count: usize,
    },
}

/// Capability trait for anything observing circuit/stream lifecycle.
///
/// Implementations must be cheap and non-blocking; the core calls this from
/// dispatch paths.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Sink that forwards events to the `log` facade. The default when the host
/// injects nothing else.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn publish(&self, event: Event) {
        match &event {
            Event::Bootstrap { phase } => log::info!("bootstrap phase={:?}", phase),
            Event::CircuitOpened { circ_id, hops } => {
                log::info!("circuit opened circ_id={} path={}", circ_id, hops.join(","))
            }
            Event::CircuitClosed { circ_id, reason } => {
                log::info!("circuit closed circ_id={} reason={}", circ_id, reason)
            }
            Event::StreamOpened {
                circ_id,
                stream_id,
                target,
            } => log::debug!(
                "stream opened circ_id={} stream_id={} target={}",
                circ_id,
                stream_id,
                target
            ),
            Event::StreamClosed { circ_id, stream_id } => {
                log::debug!("stream closed circ_id={} stream_id={}", circ_id, stream_id)
            }
            Event::GuardConfirmed { fingerprint } => {
                log::info!("guard confirmed fingerprint={}", fingerprint)
            }
            Event::ConsensusRefreshed { relay_count } => {
                log::info!("consensus refreshed relays={}", relay_count)
            }
        }
    }
}

/// Shared handle to a sink.
pub type SharedEventSink = Arc<dyn EventSink>;
