//! ntor handshake implementation
//!
//! Implements the ntor (ntor1) key exchange used for circuit creation and
//! extension, based on X25519 Diffie-Hellman.
//!
//! References:
//! - Tor spec: https://spec.torproject.org/tor-spec/create-created-cells.html
//!
//! Security: AUTH verification uses constant-time comparison; the client
//! ephemeral secret is zeroized on drop by x25519-dalek.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Result, TorError};
use crate::protocol::crypto::{constant_time_eq, validate_entropy, CircuitKeys};

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// CREATE2/EXTEND2 handshake type for ntor
pub const HANDSHAKE_TYPE_NTOR: u16 = 0x0002;

/// Client handshake body: ID(20) | B(32) | X(32)
pub const NTOR_ONIONSKIN_LEN: usize = 84;

/// Server reply body: Y(32) | AUTH(32)
pub const NTOR_REPLY_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let out = mac.finalize().into_bytes();
    let mut result = [0u8; 32];
    result.copy_from_slice(&out);
    result
}

/// In-flight ntor handshake state for one hop.
pub struct NtorHandshake {
    /// Client's ephemeral secret (zeroized on drop by the dalek type)
    client_secret: StaticSecret,

    /// Client's ephemeral public key
    client_public: PublicKey,

    /// Target relay identity fingerprint (RSA-SHA1, 20 bytes)
    relay_id: [u8; 20],

    /// Target relay ntor onion key
    relay_onion_key: PublicKey,
}

impl NtorHandshake {
    /// Start a handshake toward one relay.
    pub fn start(relay_id: [u8; 20], relay_onion_key: PublicKey) -> Result<Self> {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);
        validate_entropy(client_public.as_bytes())?;

        Ok(Self {
            client_secret,
            client_public,
            relay_id,
            relay_onion_key,
        })
    }

    /// The client's ephemeral public key X.
    pub fn client_public(&self) -> &PublicKey {
        &self.client_public
    }

    /// Handshake body for CREATE2 / EXTEND2: ID(20) | B(32) | X(32).
    pub fn onionskin(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(NTOR_ONIONSKIN_LEN);
        data.extend_from_slice(&self.relay_id);
        data.extend_from_slice(self.relay_onion_key.as_bytes());
        data.extend_from_slice(self.client_public.as_bytes());
        data
    }

    /// Complete the handshake with the server's Y | AUTH reply and derive
    /// the hop keys.
    ///
    /// Any AUTH mismatch is a hard cryptographic failure; the caller must
    /// tear down the circuit, never retry on it.
    ///
    /// Tor spec: secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
    pub fn finish(self, reply: &[u8]) -> Result<(CircuitKeys, [u8; 20])> {
        if reply.len() < NTOR_REPLY_LEN {
            return Err(TorError::Protocol(format!(
                "ntor reply too short: {} bytes",
                reply.len()
            )));
        }

        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[0..32]);
        let server_public = PublicKey::from(y_bytes);
        let server_auth = &reply[32..64];

        // EXP(Y,x) and EXP(B,x)
        let shared_yx = self.client_secret.diffie_hellman(&server_public);
        let shared_bx = self.client_secret.diffie_hellman(&self.relay_onion_key);

        // Contributory-behavior check: an all-zero shared secret means the
        // peer sent a low-order point.
        if shared_yx.as_bytes().iter().all(|&b| b == 0)
            || shared_bx.as_bytes().iter().all(|&b| b == 0)
        {
            return Err(TorError::Crypto("ntor: low-order peer point".into()));
        }

        let mut secret_input = Vec::with_capacity(32 * 4 + 20 + 32 + PROTOID.len());
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.relay_id);
        secret_input.extend_from_slice(self.relay_onion_key.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_sha256(T_KEY, &secret_input);
        let verify = hmac_sha256(T_VERIFY, &secret_input);

        // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
        let mut auth_input = Vec::with_capacity(32 + 20 + 32 * 3 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.relay_id);
        auth_input.extend_from_slice(self.relay_onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let computed_auth = hmac_sha256(T_MAC, &auth_input);

        if !constant_time_eq(&computed_auth, server_auth) {
            return Err(TorError::AuthMismatch);
        }

        let (keys, kh) = CircuitKeys::derive_from_seed(&key_seed)?;
        Ok((keys, kh))
    }
}

/// Build a CREATE2 cell payload: HTYPE(2) | HLEN(2) | HDATA.
pub fn create2_payload(onionskin: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + onionskin.len());
    payload.extend_from_slice(&HANDSHAKE_TYPE_NTOR.to_be_bytes());
    payload.extend_from_slice(&(onionskin.len() as u16).to_be_bytes());
    payload.extend_from_slice(onionskin);
    payload
}

/// Parse a CREATED2 cell payload: HLEN(2) | HDATA(HLEN).
pub fn parse_created2(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < 2 {
        return Err(TorError::Protocol("CREATED2 payload too short".into()));
    }
    let hlen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if hlen < NTOR_REPLY_LEN || payload.len() < 2 + hlen {
        return Err(TorError::Protocol(format!(
            "CREATED2 handshake data too short: {} bytes",
            hlen
        )));
    }
    Ok(&payload[2..2 + hlen])
}

/// Parse an EXTENDED2 relay cell body (same HLEN | HDATA shape).
pub fn parse_extended2(body: &[u8]) -> Result<&[u8]> {
    parse_created2(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Relay-side ntor implementation, used to exercise the full exchange.
    fn server_respond(
        onionskin: &[u8],
        relay_id: &[u8; 20],
        onion_secret: &StaticSecret,
    ) -> (Vec<u8>, [u8; 32]) {
        assert_eq!(onionskin.len(), NTOR_ONIONSKIN_LEN);
        assert_eq!(&onionskin[0..20], relay_id);

        let relay_onion_pub = PublicKey::from(onion_secret);
        assert_eq!(&onionskin[20..52], relay_onion_pub.as_bytes());

        let mut x_bytes = [0u8; 32];
        x_bytes.copy_from_slice(&onionskin[52..84]);
        let client_public = PublicKey::from(x_bytes);

        let server_secret = StaticSecret::random_from_rng(OsRng);
        let server_public = PublicKey::from(&server_secret);

        let shared_xy = server_secret.diffie_hellman(&client_public);
        let shared_xb = onion_secret.diffie_hellman(&client_public);

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(shared_xy.as_bytes());
        secret_input.extend_from_slice(shared_xb.as_bytes());
        secret_input.extend_from_slice(relay_id);
        secret_input.extend_from_slice(relay_onion_pub.as_bytes());
        secret_input.extend_from_slice(client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_sha256(T_KEY, &secret_input);
        let verify = hmac_sha256(T_VERIFY, &secret_input);

        let mut auth_input = Vec::new();
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(relay_id);
        auth_input.extend_from_slice(relay_onion_pub.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");
        let auth = hmac_sha256(T_MAC, &auth_input);

        let mut reply = Vec::with_capacity(NTOR_REPLY_LEN);
        reply.extend_from_slice(server_public.as_bytes());
        reply.extend_from_slice(&auth);
        (reply, key_seed)
    }

    #[test]
    fn test_full_exchange_derives_matching_keys() {
        let relay_id = [0x42u8; 20];
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let onion_pub = PublicKey::from(&onion_secret);

        let handshake = NtorHandshake::start(relay_id, onion_pub).unwrap();
        let onionskin = handshake.onionskin();
        assert_eq!(onionskin.len(), NTOR_ONIONSKIN_LEN);

        let (reply, server_seed) = server_respond(&onionskin, &relay_id, &onion_secret);
        let (client_keys, _kh) = handshake.finish(&reply).unwrap();

        let (server_keys, _) = CircuitKeys::derive_from_seed(&server_seed).unwrap();
        assert_eq!(client_keys.forward_key, server_keys.forward_key);
        assert_eq!(client_keys.backward_key, server_keys.backward_key);
        assert_eq!(
            client_keys.forward_digest_seed,
            server_keys.forward_digest_seed
        );
    }

    #[test]
    fn test_auth_tamper_rejected() {
        let relay_id = [0x42u8; 20];
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let onion_pub = PublicKey::from(&onion_secret);

        let handshake = NtorHandshake::start(relay_id, onion_pub).unwrap();
        let onionskin = handshake.onionskin();
        let (mut reply, _) = server_respond(&onionskin, &relay_id, &onion_secret);

        reply[40] ^= 0x01; // flip one AUTH bit
        let err = handshake.finish(&reply).unwrap_err();
        assert!(matches!(err, TorError::AuthMismatch));
    }

    #[test]
    fn test_create2_payload_shape() {
        let relay_id = [1u8; 20];
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let handshake =
            NtorHandshake::start(relay_id, PublicKey::from(&onion_secret)).unwrap();

        let payload = create2_payload(&handshake.onionskin());
        assert_eq!(payload.len(), 2 + 2 + 84);
        assert_eq!(&payload[0..2], &[0x00, 0x02]); // ntor
        assert_eq!(&payload[2..4], &[0x00, 0x54]); // 84
        assert_eq!(&payload[4..24], &relay_id);
    }

    #[test]
    fn test_short_reply_rejected() {
        let relay_id = [1u8; 20];
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let handshake =
            NtorHandshake::start(relay_id, PublicKey::from(&onion_secret)).unwrap();
        assert!(handshake.finish(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_parse_created2() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&64u16.to_be_bytes());
        payload.extend_from_slice(&[9u8; 64]);
        let hdata = parse_created2(&payload).unwrap();
        assert_eq!(hdata.len(), 64);

        assert!(parse_created2(&[0x00]).is_err());
        assert!(parse_created2(&[0x00, 0x10, 0, 0]).is_err());
    }
}
