//! Onion-service key derivations
//!
//! The v3 scheme never exposes a service's identity key to HSDirs. Instead
//! every time period uses a blinded key derived from the identity key, the
//! period number, and the period length; descriptors are stored under the
//! blinded key at ring positions derived from it and the consensus
//! shared-random value.
//!
//! Reference: rend-spec-v3.txt Appendix A, Section 2.2

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::Scalar;
use sha3::{Digest, Sha3_256};

use crate::error::{Result, TorError};
use crate::protocol::{Consensus, Relay};

/// Default time-period length in minutes (one day)
pub const DEFAULT_PERIOD_LENGTH_MIN: u64 = 1440;

/// Rotation offset: periods start 12:00 UTC, not midnight
pub const ROTATION_OFFSET_MIN: u64 = 12 * 60;

/// Replicas of the descriptor on the hashring
pub const HSDIR_N_REPLICAS: u64 = 2;

/// Responsible HSDirs per replica
pub const HSDIR_SPREAD_FETCH: usize = 3;

/// String constants from rend-spec-v3 A.2. The basepoint is spelled out in
/// decimal because the blinding hash covers its string representation.
const BLIND_STRING: &[u8] = b"Derive temporary signing key\0";
const ED25519_BASEPOINT_STR: &[u8] = b"(15112221349535400772501151409588531511454012693041857206046113283949847762202, \
    46316835694926478169428394003475163141307993866256225615783033603165251855960)";

fn int8(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

/// Compute the time-period number for a unix timestamp.
pub fn time_period(
    unix_seconds: u64,
    period_length_min: u64,
    rotation_offset_min: u64,
) -> u64 {
    let minutes = unix_seconds / 60;
    minutes.saturating_sub(rotation_offset_min) / period_length_min
}

/// Current and previous period numbers; descriptors for both are reachable
/// near a period boundary.
pub fn current_and_previous_periods(unix_seconds: u64, period_length_min: u64) -> (u64, u64) {
    let current = time_period(unix_seconds, period_length_min, ROTATION_OFFSET_MIN);
    (current, current.saturating_sub(1))
}

/// Derive the blinded public key for one time period.
///
/// h = SHA3-256(BLIND_STRING | A | B | N) with N = "key-blind" |
/// INT_8(period) | INT_8(length); h is clamped like an ed25519 scalar and
/// the blinded key is h*A.
pub fn blind_pubkey(pubkey: &[u8; 32], period_num: u64, period_length_min: u64) -> Result<[u8; 32]> {
    let mut hasher = Sha3_256::new();
    hasher.update(BLIND_STRING);
    hasher.update(pubkey);
    hasher.update(ED25519_BASEPOINT_STR);
    hasher.update(b"key-blind");
    hasher.update(int8(period_num));
    hasher.update(int8(period_length_min));
    let mut h: [u8; 32] = hasher.finalize().into();

    // Scalar clamping
    h[0] &= 248;
    h[31] &= 63;
    h[31] |= 64;

    let point = CompressedEdwardsY(*pubkey)
        .decompress()
        .ok_or_else(|| TorError::Crypto("onion identity key is not a curve point".into()))?;
    let blinded = point * Scalar::from_bytes_mod_order(h);
    Ok(blinded.compress().to_bytes())
}

/// N_hs_cred = H("credential" | pubkey)
fn credential(pubkey: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(b"credential");
    hasher.update(pubkey);
    hasher.finalize().into()
}

/// N_hs_subcred = H("subcredential" | N_hs_cred | blinded_pubkey)
pub fn subcredential(pubkey: &[u8; 32], blinded_pubkey: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(b"subcredential");
    hasher.update(credential(pubkey));
    hasher.update(blinded_pubkey);
    hasher.finalize().into()
}

/// Ring position where replica `replica_num` of the descriptor lives.
pub fn hs_index(
    blinded_pubkey: &[u8; 32],
    replica_num: u64,
    period_length_min: u64,
    period_num: u64,
) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(b"store-at-idx");
    hasher.update(blinded_pubkey);
    hasher.update(int8(replica_num));
    hasher.update(int8(period_length_min));
    hasher.update(int8(period_num));
    hasher.finalize().into()
}

/// Ring position of one relay for this period.
pub fn hsdir_index(
    relay_ed_identity: &[u8; 32],
    shared_random: &[u8; 32],
    period_num: u64,
    period_length_min: u64,
) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(b"node-idx");
    hasher.update(relay_ed_identity);
    hasher.update(shared_random);
    hasher.update(int8(period_num));
    hasher.update(int8(period_length_min));
    hasher.finalize().into()
}

/// Compute the responsible HSDirs for a blinded key, in fetch order.
///
/// Relays with the HSDir flag are sorted by their ring index; for each of
/// the two replicas, the next `HSDIR_SPREAD_FETCH` relays clockwise from
/// the replica's hs_index are responsible. Duplicates across replicas are
/// dropped.
pub fn responsible_hsdirs(
    consensus: &Consensus,
    blinded_pubkey: &[u8; 32],
    period_num: u64,
) -> Result<Vec<Relay>> {
    let period_length = consensus.hsdir_interval_minutes();
    let shared_random = consensus
        .shared_rand_current
        .ok_or_else(|| TorError::Directory("consensus lacks shared-random value".into()))?;

    let mut ring: Vec<([u8; 32], &Relay)> = consensus
        .relays
        .iter()
        .filter(|r| r.is_hsdir())
        .filter_map(|r| {
            r.ed25519_identity
                .map(|ed| (hsdir_index(&ed, &shared_random, period_num, period_length), r))
        })
        .collect();
    if ring.is_empty() {
        return Err(TorError::Directory("no usable HSDirs in consensus".into()));
    }
    ring.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out: Vec<Relay> = Vec::new();
    for replica in 1..=HSDIR_N_REPLICAS {
        let index = hs_index(blinded_pubkey, replica, period_length, period_num);
        // First ring entry clockwise from the index, wrapping around.
        let start = ring.partition_point(|(pos, _)| pos < &index);
        for offset in 0..HSDIR_SPREAD_FETCH.min(ring.len()) {
            let (_, relay) = ring[(start + offset) % ring.len()];
            if !out.iter().any(|r| r.fingerprint == relay.fingerprint) {
                out.push(relay.clone());
            }
        }
    }
    Ok(out)
}
