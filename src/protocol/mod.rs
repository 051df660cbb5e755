//! Tor protocol implementation
//!
//! The wire-level heart of the client:
//! - Cell codec and relay-cell framing
//! - Per-hop circuit cryptography and the ntor handshake
//! - Link connections (TLS + VERSIONS/CERTS/NETINFO)
//! - Directory consensus fetching, parsing, and verification
//! - Circuit building and relay-cell routing
//! - Stream multiplexing with SENDME flow control

mod cell;
pub(crate) mod certs;
mod circuit;
mod consensus;
mod crypto;
mod directory;
mod flow_control;
mod link;
mod ntor;
mod relay;
mod stream;

pub use cell::{Cell, CellCommand, CellError, RelayCell, RelayCommand};
pub use certs::{CertsCell, Certificate, CertType, Ed25519Cert, VerifiedLinkIdentity};
pub use circuit::{
    decrypt_inbound, encrypt_outbound, CircuitBuilder, CircuitHandle, CircuitPurpose,
    CircuitState, Hop, StreamAttachment, StreamEvent, StreamTarget,
};
pub use consensus::{
    parse_datetime_utc, signature_quorum, Consensus, ConsensusParser, ConsensusVerifier,
    DirectoryAuthority, DirectorySignature, DIRECTORY_AUTHORITIES,
};
pub use crypto::{
    constant_time_eq, secure_zero, validate_entropy, Aes128Ctr, CircuitKeys, HopCrypto,
    RollingDigest,
};
pub use directory::{http_get, ConsensusSource, DirectoryClient};
pub use flow_control::{CircuitFlowControl, StreamFlowControl};
pub use link::{Link, LinkManager};
pub use ntor::{create2_payload, parse_created2, parse_extended2, NtorHandshake};
pub use relay::{PortPolicy, Relay, RelayFlags};
pub use stream::{TorStream, END_REASON_DONE};
