//! Tor protocol cryptography
//!
//! Implements the per-hop circuit crypto:
//! - AES-128-CTR stream ciphers, one pair per hop, state kept across cells
//! - Rolling SHA-1 digests seeded with the KDF digest seeds
//! - HKDF-SHA256 (RFC 5869) key derivation from the ntor KEY_SEED
//! - Constant-time comparison helpers
//!
//! Key material is zeroized on drop.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TorError};

/// AES-128-CTR cipher type
pub type Aes128Ctr = Ctr128BE<Aes128>;

/// Bytes of KDF output: Df(20) | Db(20) | Kf(16) | Kb(16) | KH(20)
pub const KDF_OUTPUT_LEN: usize = 92;

/// Constant-time equality over byte slices.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Best-effort wipe of a buffer before it is dropped.
pub fn secure_zero(buf: &mut [u8]) {
    buf.zeroize();
}

/// Key material for one hop, as split from the ntor KDF output.
///
/// Keys are zeroized when dropped.
#[derive(Clone, Debug, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    /// Forward digest seed (client -> relay integrity)
    pub forward_digest_seed: [u8; 20],

    /// Backward digest seed (relay -> client integrity)
    pub backward_digest_seed: [u8; 20],

    /// Forward encryption key (client -> relay), AES-128
    pub forward_key: [u8; 16],

    /// Backward encryption key (relay -> client), AES-128
    pub backward_key: [u8; 16],
}

impl CircuitKeys {
    /// Derive hop keys from KEY_SEED using Tor's ntor KDF.
    ///
    /// KEY_SEED is already pseudorandom (HMAC-SHA256 output), so per
    /// RFC 5869 the Extract step is skipped and KEY_SEED is used directly
    /// as the PRK. Output layout:
    ///
    /// ```text
    /// Df (20) | Db (20) | Kf (16) | Kb (16) | KH (20) = 92 bytes
    /// ```
    ///
    /// KH authenticates the handshake transcript in some protocol variants;
    /// it is returned but not stored.
    pub fn derive_from_seed(key_seed: &[u8]) -> Result<(Self, [u8; 20])> {
        const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| TorError::Crypto("invalid PRK length".into()))?;

        let mut okm = [0u8; KDF_OUTPUT_LEN];
        hkdf.expand(M_EXPAND, &mut okm)
            .map_err(|_| TorError::Crypto("key derivation failed".into()))?;

        let keys = Self::split_key_material(&okm[..72]);

        let mut kh = [0u8; 20];
        kh.copy_from_slice(&okm[72..92]);

        okm.zeroize();
        Ok((keys, kh))
    }

    /// Split a 72-byte Df|Db|Kf|Kb block into hop keys.
    ///
    /// Also used by the hs-ntor KDF for the virtual rendezvous hop, which
    /// produces the same layout from a SHAKE-256 expansion.
    pub fn split_key_material(okm: &[u8]) -> Self {
        debug_assert!(okm.len() >= 72);
        let mut keys = Self {
            forward_digest_seed: [0u8; 20],
            backward_digest_seed: [0u8; 20],
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
        };
        keys.forward_digest_seed.copy_from_slice(&okm[0..20]);
        keys.backward_digest_seed.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        keys
    }
}

/// Rolling SHA-1 digest for relay-cell integrity.
///
/// Seeded with the hop's digest seed; every relay cell exchanged with that
/// hop is folded in (with the 4-byte digest field zeroed). `digest4`
/// returns the current truncated digest without finalizing the state.
#[derive(Clone)]
pub struct RollingDigest {
    state: Sha1,
}

impl RollingDigest {
    /// Create a rolling digest seeded with a KDF digest seed.
    pub fn seeded(seed: &[u8; 20]) -> Self {
        let mut state = Sha1::new();
        state.update(seed);
        Self { state }
    }

    /// Fold bytes into the running state.
    pub fn update(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }

    /// First four bytes of the current hash, without finalizing.
    pub fn digest4(&self) -> [u8; 4] {
        let hash = self.state.clone().finalize();
        [hash[0], hash[1], hash[2], hash[3]]
    }
}

/// Full cryptographic state for one hop of a circuit.
///
/// Cipher and digest state is inherently sequential; a `HopCrypto` is owned
/// by its circuit's dispatch task and never shared.
pub struct HopCrypto {
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: RollingDigest,
    backward_digest: RollingDigest,
}

impl HopCrypto {
    /// Initialize hop state from freshly derived keys. IVs start at zero.
    pub fn new(keys: &CircuitKeys) -> Self {
        let zero_iv = [0u8; 16];
        Self {
            forward_cipher: Aes128Ctr::new((&keys.forward_key).into(), (&zero_iv).into()),
            backward_cipher: Aes128Ctr::new((&keys.backward_key).into(), (&zero_iv).into()),
            forward_digest: RollingDigest::seeded(&keys.forward_digest_seed),
            backward_digest: RollingDigest::seeded(&keys.backward_digest_seed),
        }
    }

    /// Stamp the digest for an outbound relay payload addressed to this hop.
    ///
    /// The payload must have its digest field (bytes 5..9) zeroed. The whole
    /// 509-byte payload, padding included, is folded into the forward
    /// digest; the first 4 bytes of the result are written into the field.
    pub fn stamp_forward_digest(&mut self, payload: &mut [u8]) {
        debug_assert_eq!(&payload[5..9], &[0, 0, 0, 0]);
        self.forward_digest.update(payload);
        let digest = self.forward_digest.digest4();
        payload[5..9].copy_from_slice(&digest);
    }

    /// Apply one forward encryption layer in place.
    pub fn encrypt_forward(&mut self, payload: &mut [u8]) {
        self.forward_cipher.apply_keystream(payload);
    }

    /// Remove one backward encryption layer in place.
    pub fn decrypt_backward(&mut self, payload: &mut [u8]) {
        self.backward_cipher.apply_keystream(payload);
    }

    /// Check whether a decrypted payload was addressed by this hop.
    ///
    /// The recognized field must already be zero. The digest is verified in
    /// constant time against the rolling backward state; the state is only
    /// advanced when the cell is actually claimed, so an unclaimed cell
    /// leaves this hop's digest untouched for the next one.
    pub fn verify_backward_digest(&mut self, payload: &[u8]) -> bool {
        let received = &payload[5..9];

        let mut zeroed = payload.to_vec();
        zeroed[5..9].copy_from_slice(&[0, 0, 0, 0]);

        let mut candidate = self.backward_digest.clone();
        candidate.update(&zeroed);
        let expected = candidate.digest4();

        if constant_time_eq(received, &expected) {
            self.backward_digest = candidate;
            true
        } else {
            false
        }
    }
}

/// Validate the shape of freshly generated key material.
///
/// Detects gross RNG failures (all zeros, all ones, near-constant output).
pub fn validate_entropy(bytes: &[u8]) -> Result<()> {
    if bytes.iter().all(|&b| b == 0) {
        return Err(TorError::Crypto("RNG failure: all zeros".into()));
    }
    if bytes.iter().all(|&b| b == 0xFF) {
        return Err(TorError::Crypto("RNG failure: all ones".into()));
    }
    let unique: std::collections::HashSet<u8> = bytes.iter().copied().collect();
    if unique.len() < 8 {
        return Err(TorError::Crypto(format!(
            "RNG failure: low entropy ({} unique bytes)",
            unique.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys(tag: u8) -> CircuitKeys {
        let mut okm = [0u8; 72];
        for (i, b) in okm.iter_mut().enumerate() {
            *b = tag.wrapping_add(i as u8);
        }
        CircuitKeys::split_key_material(&okm)
    }

    #[test]
    fn test_kdf_layout() {
        let seed = [7u8; 32];
        let (keys, kh) = CircuitKeys::derive_from_seed(&seed).unwrap();
        assert_ne!(keys.forward_key, keys.backward_key);
        assert_ne!(keys.forward_digest_seed, keys.backward_digest_seed);
        assert_ne!(kh, [0u8; 20]);

        // Deterministic
        let (keys2, kh2) = CircuitKeys::derive_from_seed(&seed).unwrap();
        assert_eq!(keys.forward_key, keys2.forward_key);
        assert_eq!(kh, kh2);
    }

    #[test]
    fn test_cipher_state_persists_across_cells() {
        let keys = test_keys(3);
        let mut enc = HopCrypto::new(&keys);
        let mut dec = HopCrypto::new(&keys);

        // Two consecutive cells must decrypt correctly only if the cipher
        // keystream position is maintained between them.
        for round in 0..2u8 {
            let mut data = vec![round; 509];
            let original = data.clone();
            enc.encrypt_forward(&mut data);
            assert_ne!(data, original);
            // Peer side: forward cipher with same key and running offset
            dec.forward_cipher.apply_keystream(&mut data);
            assert_eq!(data, original);
        }
    }

    #[test]
    fn test_rolling_digest_stamp_and_verify() {
        let keys = test_keys(9);
        let mut sender = HopCrypto::new(&keys);
        let mut receiver = HopCrypto::new(&keys);

        // Simulate the backward direction: the relay stamps with its own
        // forward-equivalent state; here we mirror by seeding both ends with
        // the backward seed.
        let mut relay_digest = RollingDigest::seeded(&keys.backward_digest_seed);

        let mut payload = vec![0u8; 509];
        payload[0] = 2; // DATA
        payload[3] = 0;
        payload[4] = 42;
        relay_digest.update(&payload);
        let d = relay_digest.digest4();
        payload[5..9].copy_from_slice(&d);

        assert!(receiver.verify_backward_digest(&payload));

        // Tampering after stamping must fail verification
        let mut tampered = payload.clone();
        tampered[100] ^= 0x01;
        assert!(!sender.verify_backward_digest(&tampered));
    }

    #[test]
    fn test_unclaimed_cell_leaves_digest_state() {
        let keys = test_keys(17);
        let mut hop = HopCrypto::new(&keys);

        let garbage = vec![0xAAu8; 509];
        let before = hop.backward_digest.digest4();
        assert!(!hop.verify_backward_digest(&garbage));
        let after = hop.backward_digest.digest4();
        assert_eq!(before, after);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_entropy_validation() {
        assert!(validate_entropy(&[0u8; 32]).is_err());
        assert!(validate_entropy(&[0xFFu8; 32]).is_err());
        assert!(validate_entropy(&[1, 2, 1, 2, 1, 2, 1, 2]).is_err());
        let varied: Vec<u8> = (0..32).collect();
        assert!(validate_entropy(&varied).is_ok());
    }

    #[test]
    fn test_secure_zero() {
        let mut buf = vec![0xAB; 16];
        secure_zero(&mut buf);
        assert_eq!(buf, vec![0u8; 16]);
    }
}
