//! hs-ntor handshake
//!
//! The variant of ntor used between a client and an onion service across
//! the introduction/rendezvous relays. SHA3-256 replaces SHA-256, the
//! SHAKE-256 XOF replaces HKDF, and the intro-point leg additionally
//! derives the keys that encrypt the INTRODUCE1 payload for the service.
//!
//! Reference: rend-spec-v3.txt Appendix B (HS_NTOR)

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::rngs::OsRng;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Digest, Sha3_256, Shake256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Result, TorError};
use crate::protocol::{constant_time_eq, CircuitKeys};

type Aes256Ctr = Ctr128BE<Aes256>;

const PROTOID: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1";
const T_HSENC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_extract";
const T_HSVERIFY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_verify";
const T_HSMAC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_mac";
const M_HSEXPAND: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_expand";

/// MAC(k, m) = SHA3-256(INT_8(len(k)) | k | m)
fn mac(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    Digest::update(&mut hasher, (key.len() as u64).to_be_bytes());
    Digest::update(&mut hasher, key);
    Digest::update(&mut hasher, message);
    hasher.finalize().into()
}

fn shake256(input: &[u8], output_len: usize) -> Vec<u8> {
    let mut hasher = Shake256::default();
    hasher.update(input);
    let mut reader = hasher.finalize_xof();
    let mut out = vec![0u8; output_len];
    reader.read(&mut out);
    out
}

/// Client state for one introduction attempt.
pub struct HsNtorClient {
    client_secret: StaticSecret,
    client_public: PublicKey,
    /// Intro point auth key (ed25519, from the descriptor)
    auth_key: [u8; 32],
    /// Service encryption key B (curve25519, from the descriptor)
    enc_key: PublicKey,
    subcredential: [u8; 32],
}

impl HsNtorClient {
    pub fn start(auth_key: [u8; 32], enc_key: [u8; 32], subcredential: [u8; 32]) -> Self {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);
        Self {
            client_secret,
            client_public,
            auth_key,
            enc_key: PublicKey::from(enc_key),
            subcredential,
        }
    }

    /// The ephemeral client key X carried in INTRODUCE1.
    pub fn client_public(&self) -> [u8; 32] {
        *self.client_public.as_bytes()
    }

    /// Derive the INTRODUCE1 encryption keys:
    /// intro_secret_hs_input = EXP(B,x) | AUTH_KEY | X | B | PROTOID
    /// keys = SHAKE-256(intro_secret_hs_input | t_hsenc | info)
    fn intro_keys(&self) -> Result<([u8; 32], [u8; 32])> {
        let shared_bx = self.client_secret.diffie_hellman(&self.enc_key);
        if shared_bx.as_bytes().iter().all(|&b| b == 0) {
            return Err(TorError::Crypto("hs-ntor: low-order service key".into()));
        }

        let mut input = Vec::new();
        input.extend_from_slice(shared_bx.as_bytes());
        input.extend_from_slice(&self.auth_key);
        input.extend_from_slice(self.client_public.as_bytes());
        input.extend_from_slice(self.enc_key.as_bytes());
        input.extend_from_slice(PROTOID);
        input.extend_from_slice(T_HSENC);
        input.extend_from_slice(M_HSEXPAND);
        input.extend_from_slice(&self.subcredential);

        let keys = shake256(&input, 64);
        let mut enc_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        enc_key.copy_from_slice(&keys[..32]);
        mac_key.copy_from_slice(&keys[32..64]);
        Ok((enc_key, mac_key))
    }

    /// Seal the INTRODUCE1 plaintext: returns `X | CIPHERTEXT | MAC`, where
    /// the MAC covers `intro_header | X | CIPHERTEXT`.
    pub fn seal_introduce1(&self, intro_header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let (enc_key, mac_key) = self.intro_keys()?;

        let mut ciphertext = plaintext.to_vec();
        let zero_iv = [0u8; 16];
        let mut cipher = Aes256Ctr::new((&enc_key).into(), (&zero_iv).into());
        cipher.apply_keystream(&mut ciphertext);

        let mut mac_covered = Vec::with_capacity(intro_header.len() + 32 + ciphertext.len());
        mac_covered.extend_from_slice(intro_header);
        mac_covered.extend_from_slice(self.client_public.as_bytes());
        mac_covered.extend_from_slice(&ciphertext);
        let tag = mac(&mac_key, &mac_covered);

        let mut out = Vec::with_capacity(32 + ciphertext.len() + 32);
        out.extend_from_slice(self.client_public.as_bytes());
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Complete the handshake with the RENDEZVOUS2 reply `Y | AUTH` and
    /// derive the virtual-hop keys toward the service.
    pub fn finish_rendezvous2(self, reply: &[u8]) -> Result<CircuitKeys> {
        if reply.len() < 64 {
            return Err(TorError::Protocol(format!(
                "RENDEZVOUS2 body too short: {} bytes",
                reply.len()
            )));
        }
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[0..32]);
        let server_public = PublicKey::from(y_bytes);
        let server_auth = &reply[32..64];

        let shared_yx = self.client_secret.diffie_hellman(&server_public);
        let shared_bx = self.client_secret.diffie_hellman(&self.enc_key);
        if shared_yx.as_bytes().iter().all(|&b| b == 0) {
            return Err(TorError::Crypto("hs-ntor: low-order rendezvous key".into()));
        }

        // rend_secret_hs_input = EXP(Y,x) | EXP(B,x) | AUTH_KEY | B | X | Y | PROTOID
        let mut rend_secret = Vec::new();
        rend_secret.extend_from_slice(shared_yx.as_bytes());
        rend_secret.extend_from_slice(shared_bx.as_bytes());
        rend_secret.extend_from_slice(&self.auth_key);
        rend_secret.extend_from_slice(self.enc_key.as_bytes());
        rend_secret.extend_from_slice(self.client_public.as_bytes());
        rend_secret.extend_from_slice(server_public.as_bytes());
        rend_secret.extend_from_slice(PROTOID);

        let ntor_key_seed = mac(&rend_secret, T_HSENC);
        let verify = mac(&rend_secret, T_HSVERIFY);

        // auth_input = verify | AUTH_KEY | B | Y | X | PROTOID | "Server"
        let mut auth_input = Vec::new();
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.auth_key);
        auth_input.extend_from_slice(self.enc_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");
        let expected_auth = mac(&auth_input, T_HSMAC);

        if !constant_time_eq(&expected_auth, server_auth) {
            return Err(TorError::AuthMismatch);
        }

        // Expand into the standard hop key layout for the virtual hop.
        let mut expand_input = Vec::with_capacity(32 + M_HSEXPAND.len());
        expand_input.extend_from_slice(&ntor_key_seed);
        expand_input.extend_from_slice(M_HSEXPAND);
        let okm = shake256(&expand_input, 72);
        Ok(CircuitKeys::split_key_material(&okm))
    }
}
