//! v3 onion-service client
//!
//! Everything needed to reach a `.onion` service as a client: address
//! parsing, per-period key blinding, the HSDir hashring, descriptor
//! fetch/verify/decrypt, and the introduction/rendezvous exchange.
//!
//! v2 onion services are deprecated and rejected at address parse.

mod address;
mod client;
mod descriptor;
mod hs_ntor;
mod keys;

pub use address::{is_onion_hostname, OnionAddress};
pub use client::OnionClient;
pub use descriptor::{IntroPoint, LinkSpecifier, OnionDescriptor};
pub use hs_ntor::HsNtorClient;
pub use keys::{
    blind_pubkey, current_and_previous_periods, hs_index, hsdir_index, responsible_hsdirs,
    subcredential, time_period, DEFAULT_PERIOD_LENGTH_MIN, HSDIR_N_REPLICAS, HSDIR_SPREAD_FETCH,
    ROTATION_OFFSET_MIN,
};
