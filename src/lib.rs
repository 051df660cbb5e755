//! # tor-client
//!
//! A pure-userspace Tor client: builds layered onion-routed circuits
//! through the Tor network, multiplexes application streams over them,
//! speaks the cell protocol with relays, and reaches v3 onion services via
//! the introduction/rendezvous protocol. Applications connect through a
//! local SOCKS5 listener.
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 front door
//!   -> isolation key -> circuit pool
//!        -> path selector (consensus + persistent guards)
//!        -> circuit engine (ntor, per-hop AES-CTR + rolling SHA-1)
//!             -> link connections (TLS, VERSIONS/CERTS/NETINFO)
//!   -> stream layer (BEGIN/DATA/END, SENDME windows)
//! .onion targets
//!   -> onion client (blinded keys, HSDir ring, descriptor,
//!      INTRODUCE1/RENDEZVOUS2, virtual hop)
//! ```
//!
//! The client is a graph of owned components under a single
//! [`TorClient`] root; there is no process-global state.

pub mod protocol;

mod client;
mod config;
mod error;
mod events;
mod guards;
mod isolation;
mod onion;
mod path;
mod pool;
mod socks;

pub use client::TorClient;
pub use config::TorConfig;
pub use error::{destroy_reason_name, ErrorKind, Result, TorError};
pub use events::{BootstrapPhase, Event, EventSink, LogEventSink, SharedEventSink};
pub use guards::{Guard, GuardSet};
pub use isolation::{
    IsolationKey, IsolationLevel, RequestAttributes, SESSION_CREDENTIAL_PREFIX,
};
pub use onion::{
    is_onion_hostname, IntroPoint, LinkSpecifier, OnionAddress, OnionClient, OnionDescriptor,
};
pub use path::{LastHop, PathSelector};
pub use pool::{CircuitFactory, CircuitPool, PoolStats, PoolStatsSnapshot};
pub use socks::SocksServer;
