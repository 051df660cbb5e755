//! v3 onion-service descriptors
//!
//! Parses the outer descriptor document, verifies its signature chain
//! (descriptor signing key certified by the blinded identity key), and
//! decrypts the two encryption layers to reach the introduction points.
//!
//! Reference: rend-spec-v3.txt Section 2.4 and 2.5

use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha3::digest::{ExtendableOutput, Update as XofUpdate, XofReader};
use sha3::{Digest, Sha3_256, Shake256};
use std::time::SystemTime;

use crate::error::{Result, TorError};
use crate::protocol::{constant_time_eq, Ed25519Cert};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Signature prefix for the outer document
const SIG_PREFIX: &[u8] = b"Tor onion service descriptor sig v3";

/// KDF string constants for the two layers
const OUTER_LAYER_CONST: &[u8] = b"hsdir-superencrypted-data";
const INNER_LAYER_CONST: &[u8] = b"hsdir-encrypted-data";

/// tor-cert type: descriptor signing key certified by the blinded key
const CERT_TYPE_SIGNING: u8 = 0x08;

/// Maximum descriptor lifetime we accept (minutes)
const MAX_LIFETIME_MIN: u64 = 12 * 60;

/// One link specifier of an introduction point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpecifier {
    pub spec_type: u8,
    pub data: Vec<u8>,
}

impl LinkSpecifier {
    /// Legacy RSA identity, when present (type 2).
    pub fn legacy_id(specs: &[LinkSpecifier]) -> Option<[u8; 20]> {
        specs
            .iter()
            .find(|s| s.spec_type == 0x02 && s.data.len() == 20)
            .map(|s| s.data.as_slice().try_into().expect("20 bytes"))
    }

    /// IPv4 address + port, when present (type 0).
    pub fn ipv4(specs: &[LinkSpecifier]) -> Option<(std::net::Ipv4Addr, u16)> {
        specs
            .iter()
            .find(|s| s.spec_type == 0x00 && s.data.len() == 6)
            .map(|s| {
                let ip = std::net::Ipv4Addr::new(s.data[0], s.data[1], s.data[2], s.data[3]);
                let port = u16::from_be_bytes([s.data[4], s.data[5]]);
                (ip, port)
            })
    }
}

/// One introduction point from the decrypted inner layer.
#[derive(Debug, Clone)]
pub struct IntroPoint {
    pub link_specifiers: Vec<LinkSpecifier>,
    /// ntor onion key of the introduction-point relay
    pub ntor_onion_key: [u8; 32],
    /// Intro authentication key (ed25519)
    pub auth_key: [u8; 32],
    /// Service encryption key B for hs-ntor
    pub enc_key: [u8; 32],
}

/// A fully verified and decrypted descriptor.
#[derive(Debug, Clone)]
pub struct OnionDescriptor {
    pub revision_counter: u64,
    pub lifetime_minutes: u64,
    pub intro_points: Vec<IntroPoint>,
}

impl OnionDescriptor {
    /// When a descriptor fetched at `fetched_at` stops being usable.
    pub fn expires_at(&self, fetched_at: u64) -> u64 {
        fetched_at + self.lifetime_minutes * 60
    }
}

/// Parse, verify, and decrypt a descriptor document.
///
/// `blinded_pubkey` is the current-period blinded key the descriptor must
/// be certified under; `subcredential` the derived decryption input.
pub fn parse_descriptor(
    text: &str,
    blinded_pubkey: &[u8; 32],
    subcredential: &[u8; 32],
) -> Result<OnionDescriptor> {
    let outer = OuterDocument::parse(text)?;

    // Certificate: the descriptor signing key, certified by the blinded key
    let cert = Ed25519Cert::parse(&outer.signing_key_cert)?;
    if cert.cert_type != CERT_TYPE_SIGNING {
        return Err(TorError::DescriptorInvalid(format!(
            "signing cert has type {:#04x}",
            cert.cert_type
        )));
    }
    let signer = cert.verify_self_signed().map_err(|_| {
        TorError::DescriptorInvalid("signing-key cert signature invalid".into())
    })?;
    if !constant_time_eq(&signer, blinded_pubkey) {
        return Err(TorError::DescriptorInvalid(
            "signing cert not issued by the blinded identity key".into(),
        ));
    }
    if cert.is_expired(SystemTime::now()) {
        return Err(TorError::DescriptorInvalid("signing cert expired".into()));
    }
    let signing_key = cert.certified_key;

    // Outer signature over the prefixed document body
    let key = VerifyingKey::from_bytes(&signing_key)
        .map_err(|_| TorError::DescriptorInvalid("bad descriptor signing key".into()))?;
    let mut signed = Vec::with_capacity(SIG_PREFIX.len() + outer.signed_body.len());
    signed.extend_from_slice(SIG_PREFIX);
    signed.extend_from_slice(outer.signed_body.as_bytes());
    let signature = Signature::from_slice(&outer.signature)
        .map_err(|_| TorError::DescriptorInvalid("malformed signature".into()))?;
    key.verify(&signed, &signature)
        .map_err(|_| TorError::DescriptorInvalid("descriptor signature invalid".into()))?;

    if outer.lifetime_minutes == 0 || outer.lifetime_minutes > MAX_LIFETIME_MIN {
        return Err(TorError::DescriptorInvalid(format!(
            "implausible descriptor lifetime {} min",
            outer.lifetime_minutes
        )));
    }

    // Layer 1: superencrypted -> middle document
    let middle_bytes = decrypt_layer(
        &outer.superencrypted,
        blinded_pubkey,
        subcredential,
        outer.revision_counter,
        OUTER_LAYER_CONST,
    )?;
    let middle = String::from_utf8_lossy(&middle_bytes).into_owned();

    // Layer 2: encrypted -> intro point list
    let inner_blob = extract_message_block(&middle, "encrypted")
        .ok_or_else(|| TorError::DescriptorInvalid("middle layer lacks encrypted blob".into()))?;
    let inner_bytes = decrypt_layer(
        &inner_blob,
        blinded_pubkey,
        subcredential,
        outer.revision_counter,
        INNER_LAYER_CONST,
    )?;
    let inner = String::from_utf8_lossy(&inner_bytes).into_owned();

    let intro_points = parse_intro_points(&inner, &signing_key)?;
    if intro_points.is_empty() {
        return Err(TorError::DescriptorInvalid(
            "descriptor lists no introduction points".into(),
        ));
    }

    Ok(OnionDescriptor {
        revision_counter: outer.revision_counter,
        lifetime_minutes: outer.lifetime_minutes,
        intro_points,
    })
}

struct OuterDocument {
    lifetime_minutes: u64,
    signing_key_cert: Vec<u8>,
    revision_counter: u64,
    superencrypted: Vec<u8>,
    signature: Vec<u8>,
    /// Document from the first byte through "signature " inclusive
    signed_body: String,
}

impl OuterDocument {
    fn parse(text: &str) -> Result<Self> {
        if !text.starts_with("hs-descriptor 3") {
            return Err(TorError::DescriptorInvalid(
                "not a v3 hs-descriptor".into(),
            ));
        }

        let mut lifetime_minutes = None;
        let mut revision_counter = None;
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("descriptor-lifetime ") {
                lifetime_minutes = rest.trim().parse::<u64>().ok();
            } else if let Some(rest) = line.strip_prefix("revision-counter ") {
                revision_counter = rest.trim().parse::<u64>().ok();
            }
        }
        let lifetime_minutes = lifetime_minutes
            .ok_or_else(|| TorError::DescriptorInvalid("missing descriptor-lifetime".into()))?;
        let revision_counter = revision_counter
            .ok_or_else(|| TorError::DescriptorInvalid("missing revision-counter".into()))?;

        let signing_key_cert = extract_cert_block(text, "descriptor-signing-key-cert")
            .ok_or_else(|| TorError::DescriptorInvalid("missing signing-key cert".into()))?;
        let superencrypted = extract_message_block(text, "superencrypted")
            .ok_or_else(|| TorError::DescriptorInvalid("missing superencrypted blob".into()))?;

        const SIG_TOKEN: &str = "\nsignature ";
        let sig_pos = text
            .rfind(SIG_TOKEN)
            .ok_or_else(|| TorError::DescriptorInvalid("missing signature".into()))?;
        let signed_body = text[..sig_pos + SIG_TOKEN.len()].to_string();
        let sig_b64: String = text[sig_pos + SIG_TOKEN.len()..]
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        let signature = BASE64
            .decode(pad_b64(&sig_b64))
            .map_err(|_| TorError::DescriptorInvalid("signature is not base64".into()))?;

        Ok(Self {
            lifetime_minutes,
            signing_key_cert,
            revision_counter,
            superencrypted,
            signature,
            signed_body,
        })
    }
}

/// Decrypt one SALT | CIPHERTEXT | MAC layer.
fn decrypt_layer(
    blob: &[u8],
    blinded_pubkey: &[u8; 32],
    subcredential: &[u8; 32],
    revision_counter: u64,
    string_constant: &[u8],
) -> Result<Vec<u8>> {
    if blob.len() < 16 + 32 + 1 {
        return Err(TorError::DescriptorInvalid("encrypted layer too short".into()));
    }
    let salt = &blob[..16];
    let ciphertext = &blob[16..blob.len() - 32];
    let mac_tag = &blob[blob.len() - 32..];

    // keys = SHAKE-256(blinded | subcredential | INT_8(revision) | salt | const)
    let mut kdf_input = Vec::new();
    kdf_input.extend_from_slice(blinded_pubkey);
    kdf_input.extend_from_slice(subcredential);
    kdf_input.extend_from_slice(&revision_counter.to_be_bytes());
    kdf_input.extend_from_slice(salt);
    kdf_input.extend_from_slice(string_constant);

    let mut hasher = Shake256::default();
    XofUpdate::update(&mut hasher, &kdf_input);
    let mut reader = hasher.finalize_xof();
    let mut keys = [0u8; 32 + 16 + 32];
    reader.read(&mut keys);
    let (secret_key, rest) = keys.split_at(32);
    let (secret_iv, mac_key) = rest.split_at(16);

    // MAC = H(mac_key_len | MAC_KEY | salt_len | SALT | CIPHERTEXT)
    let mut mac_hasher = Sha3_256::new();
    Digest::update(&mut mac_hasher, (mac_key.len() as u64).to_be_bytes());
    Digest::update(&mut mac_hasher, mac_key);
    Digest::update(&mut mac_hasher, (salt.len() as u64).to_be_bytes());
    Digest::update(&mut mac_hasher, salt);
    Digest::update(&mut mac_hasher, ciphertext);
    let expected: [u8; 32] = mac_hasher.finalize().into();
    if !constant_time_eq(&expected, mac_tag) {
        return Err(TorError::DescriptorInvalid("layer MAC mismatch".into()));
    }

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new(secret_key.into(), secret_iv.into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

fn parse_intro_points(inner: &str, signing_key: &[u8; 32]) -> Result<Vec<IntroPoint>> {
    let mut out = Vec::new();

    // Split on "introduction-point " entries; the preamble is skipped.
    let mut sections = inner.split("\nintroduction-point ");
    let _preamble = sections.next();

    for section in sections {
        let section = format!("introduction-point {}", section);
        let mut lines = section.lines();
        let ls_b64 = lines
            .next()
            .and_then(|l| l.strip_prefix("introduction-point "))
            .unwrap_or("")
            .trim()
            .to_string();
        let ls_bytes = BASE64
            .decode(pad_b64(&ls_b64))
            .map_err(|_| TorError::DescriptorInvalid("bad link specifier base64".into()))?;
        let link_specifiers = parse_link_specifiers(&ls_bytes)?;

        let mut ntor_onion_key = None;
        let mut enc_key = None;
        for line in section.lines() {
            if let Some(rest) = line.strip_prefix("onion-key ntor ") {
                ntor_onion_key = decode_key32(rest);
            } else if let Some(rest) = line.strip_prefix("enc-key ntor ") {
                enc_key = decode_key32(rest);
            }
        }

        // The auth key lives in a cert certified by the signing key.
        let auth_cert_bytes = extract_cert_block(&section, "auth-key")
            .ok_or_else(|| TorError::DescriptorInvalid("intro point lacks auth-key".into()))?;
        let auth_cert = Ed25519Cert::parse(&auth_cert_bytes)?;
        auth_cert.verify(signing_key).map_err(|_| {
            TorError::DescriptorInvalid("auth-key cert not signed by descriptor key".into())
        })?;

        let (Some(ntor_onion_key), Some(enc_key)) = (ntor_onion_key, enc_key) else {
            return Err(TorError::DescriptorInvalid(
                "intro point missing onion-key or enc-key".into(),
            ));
        };

        out.push(IntroPoint {
            link_specifiers,
            ntor_onion_key,
            auth_key: auth_cert.certified_key,
            enc_key,
        });
    }
    Ok(out)
}

fn parse_link_specifiers(bytes: &[u8]) -> Result<Vec<LinkSpecifier>> {
    if bytes.is_empty() {
        return Err(TorError::DescriptorInvalid("empty link specifiers".into()));
    }
    let count = bytes[0] as usize;
    let mut specs = Vec::with_capacity(count);
    let mut offset = 1;
    for _ in 0..count {
        if offset + 2 > bytes.len() {
            return Err(TorError::DescriptorInvalid("link specifier truncated".into()));
        }
        let spec_type = bytes[offset];
        let len = bytes[offset + 1] as usize;
        offset += 2;
        if offset + len > bytes.len() {
            return Err(TorError::DescriptorInvalid("link specifier truncated".into()));
        }
        specs.push(LinkSpecifier {
            spec_type,
            data: bytes[offset..offset + len].to_vec(),
        });
        offset += len;
    }
    Ok(specs)
}

fn decode_key32(b64: &str) -> Option<[u8; 32]> {
    let bytes = BASE64.decode(pad_b64(b64.trim())).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

fn pad_b64(s: &str) -> String {
    let mut s = s.to_string();
    while s.len() % 4 != 0 {
        s.push('=');
    }
    s
}

/// Extract the base64 body of `-----BEGIN ED25519 CERT-----` following a
/// keyword line.
fn extract_cert_block(text: &str, keyword: &str) -> Option<Vec<u8>> {
    extract_block(text, keyword, "-----BEGIN ED25519 CERT-----", "-----END ED25519 CERT-----")
}

/// Extract the base64 body of `-----BEGIN MESSAGE-----` following a
/// keyword line.
fn extract_message_block(text: &str, keyword: &str) -> Option<Vec<u8>> {
    extract_block(text, keyword, "-----BEGIN MESSAGE-----", "-----END MESSAGE-----")
}

fn extract_block(text: &str, keyword: &str, begin: &str, end: &str) -> Option<Vec<u8>> {
    let mut lines = text.lines();
    lines.by_ref().find(|l| {
        let token = l.split_whitespace().next().unwrap_or("");
        token == keyword
    })?;

    let mut b64 = String::new();
    let mut in_block = false;
    for line in lines {
        let line = line.trim();
        if line == begin {
            in_block = true;
        } else if line == end {
            return BASE64.decode(pad_b64(&b64)).ok();
        } else if in_block {
            b64.push_str(line);
        } else if !line.is_empty() {
            // keyword not immediately followed by a block
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::certs::test_support::make_cert;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn encrypt_layer(
        plaintext: &[u8],
        blinded: &[u8; 32],
        subcred: &[u8; 32],
        revision: u64,
        string_constant: &[u8],
        salt: [u8; 16],
    ) -> Vec<u8> {
        let mut kdf_input = Vec::new();
        kdf_input.extend_from_slice(blinded);
        kdf_input.extend_from_slice(subcred);
        kdf_input.extend_from_slice(&revision.to_be_bytes());
        kdf_input.extend_from_slice(&salt);
        kdf_input.extend_from_slice(string_constant);

        let mut hasher = Shake256::default();
        XofUpdate::update(&mut hasher, &kdf_input);
        let mut reader = hasher.finalize_xof();
        let mut keys = [0u8; 80];
        reader.read(&mut keys);

        let mut ciphertext = plaintext.to_vec();
        let mut cipher = Aes256Ctr::new(keys[..32].into(), keys[32..48].into());
        cipher.apply_keystream(&mut ciphertext);

        let mut mac_hasher = Sha3_256::new();
        Digest::update(&mut mac_hasher, 32u64.to_be_bytes());
        Digest::update(&mut mac_hasher, &keys[48..80]);
        Digest::update(&mut mac_hasher, 16u64.to_be_bytes());
        Digest::update(&mut mac_hasher, salt);
        Digest::update(&mut mac_hasher, &ciphertext);
        let mac: [u8; 32] = mac_hasher.finalize().into();

        let mut blob = Vec::new();
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&ciphertext);
        blob.extend_from_slice(&mac);
        blob
    }

    fn wrap_b64(bytes: &[u8], begin: &str, end: &str) -> String {
        let b64 = BASE64.encode(bytes);
        let mut out = String::new();
        out.push_str(begin);
        out.push('\n');
        for chunk in b64.as_bytes().chunks(64) {
            out.push_str(std::str::from_utf8(chunk).unwrap());
            out.push('\n');
        }
        out.push_str(end);
        out
    }

    fn far_future_hours() -> u32 {
        let now = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        (now / 3600 + 24 * 30) as u32
    }

    /// Construct a complete signed + doubly-encrypted descriptor.
    fn build_descriptor(
        blinded_signer: &SigningKey,
        subcred: &[u8; 32],
        revision: u64,
    ) -> (String, [u8; 32], [u8; 32]) {
        let blinded_pub = *blinded_signer.verifying_key().as_bytes();
        let desc_signing = SigningKey::generate(&mut OsRng);

        // Inner layer with one intro point
        let intro_ntor = [0x21u8; 32];
        let intro_enc = [0x22u8; 32];
        let intro_auth_key = SigningKey::generate(&mut OsRng);
        let auth_cert = make_cert(
            0x09,
            intro_auth_key.verifying_key().as_bytes(),
            0x01,
            &desc_signing,
            false,
            far_future_hours(),
        );

        let mut ls = Vec::new();
        ls.push(2u8); // two specifiers
        ls.push(0x00);
        ls.push(6);
        ls.extend_from_slice(&[203, 0, 113, 5, 0x23, 0x29]); // 203.0.113.5:9001
        ls.push(0x02);
        ls.push(20);
        ls.extend_from_slice(&[0x44; 20]);

        let inner = format!(
            "create2-formats 2\n\
             introduction-point {}\n\
             onion-key ntor {}\n\
             auth-key\n{}\n\
             enc-key ntor {}\n",
            BASE64.encode(&ls),
            BASE64.encode(intro_ntor),
            wrap_b64(
                &auth_cert,
                "-----BEGIN ED25519 CERT-----",
                "-----END ED25519 CERT-----"
            ),
            BASE64.encode(intro_enc),
        );

        let inner_blob = encrypt_layer(
            inner.as_bytes(),
            &blinded_pub,
            subcred,
            revision,
            INNER_LAYER_CONST,
            [0xA1; 16],
        );

        let middle = format!(
            "desc-auth-type x25519\n\
             desc-auth-ephemeral-key {}\n\
             encrypted\n{}\n",
            BASE64.encode([0x55u8; 32]),
            wrap_b64(&inner_blob, "-----BEGIN MESSAGE-----", "-----END MESSAGE-----"),
        );

        let outer_blob = encrypt_layer(
            middle.as_bytes(),
            &blinded_pub,
            subcred,
            revision,
            OUTER_LAYER_CONST,
            [0xB2; 16],
        );

        let signing_cert = make_cert(
            CERT_TYPE_SIGNING,
            desc_signing.verifying_key().as_bytes(),
            0x01,
            blinded_signer,
            true,
            far_future_hours(),
        );

        let body = format!(
            "hs-descriptor 3\n\
             descriptor-lifetime 180\n\
             descriptor-signing-key-cert\n{}\n\
             revision-counter {}\n\
             superencrypted\n{}\n\
             signature ",
            wrap_b64(
                &signing_cert,
                "-----BEGIN ED25519 CERT-----",
                "-----END ED25519 CERT-----"
            ),
            revision,
            wrap_b64(&outer_blob, "-----BEGIN MESSAGE-----", "-----END MESSAGE-----"),
        );

        let mut signed = Vec::new();
        signed.extend_from_slice(SIG_PREFIX);
        signed.extend_from_slice(body.as_bytes());
        let sig = desc_signing.sign(&signed);
        let text = format!("{}{}\n", body, BASE64.encode(sig.to_bytes()));

        (text, intro_ntor, intro_enc)
    }

    #[test]
    fn test_full_descriptor_roundtrip() {
        let blinded_signer = SigningKey::generate(&mut OsRng);
        let blinded_pub = *blinded_signer.verifying_key().as_bytes();
        let subcred = [0x66u8; 32];

        let (text, intro_ntor, intro_enc) = build_descriptor(&blinded_signer, &subcred, 42);
        let descriptor = parse_descriptor(&text, &blinded_pub, &subcred).unwrap();

        assert_eq!(descriptor.revision_counter, 42);
        assert_eq!(descriptor.lifetime_minutes, 180);
        assert_eq!(descriptor.intro_points.len(), 1);

        let ip = &descriptor.intro_points[0];
        assert_eq!(ip.ntor_onion_key, intro_ntor);
        assert_eq!(ip.enc_key, intro_enc);
        assert_eq!(
            LinkSpecifier::ipv4(&ip.link_specifiers),
            Some(("203.0.113.5".parse().unwrap(), 9001))
        );
        assert_eq!(LinkSpecifier::legacy_id(&ip.link_specifiers), Some([0x44; 20]));
    }

    #[test]
    fn test_wrong_blinded_key_rejected() {
        let blinded_signer = SigningKey::generate(&mut OsRng);
        let subcred = [0x66u8; 32];
        let (text, _, _) = build_descriptor(&blinded_signer, &subcred, 1);

        let wrong = *SigningKey::generate(&mut OsRng).verifying_key().as_bytes();
        assert!(matches!(
            parse_descriptor(&text, &wrong, &subcred),
            Err(TorError::DescriptorInvalid(_))
        ));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let blinded_signer = SigningKey::generate(&mut OsRng);
        let blinded_pub = *blinded_signer.verifying_key().as_bytes();
        let subcred = [0x66u8; 32];
        let (text, _, _) = build_descriptor(&blinded_signer, &subcred, 1);

        let tampered = text.replace("descriptor-lifetime 180", "descriptor-lifetime 179");
        assert!(parse_descriptor(&tampered, &blinded_pub, &subcred).is_err());
    }

    #[test]
    fn test_wrong_subcredential_fails_mac() {
        let blinded_signer = SigningKey::generate(&mut OsRng);
        let blinded_pub = *blinded_signer.verifying_key().as_bytes();
        let (text, _, _) = build_descriptor(&blinded_signer, &[0x66u8; 32], 1);

        let err = parse_descriptor(&text, &blinded_pub, &[0x67u8; 32]).unwrap_err();
        assert!(matches!(err, TorError::DescriptorInvalid(ref m) if m.contains("MAC")));
    }

    #[test]
    fn test_expiry_computation() {
        let descriptor = OnionDescriptor {
            revision_counter: 1,
            lifetime_minutes: 180,
            intro_points: Vec::new(),
        };
        assert_eq!(descriptor.expires_at(1000), 1000 + 180 * 60);
    }

    #[test]
    fn test_not_a_descriptor() {
        assert!(parse_descriptor("network-status-version 3", &[0; 32], &[0; 32]).is_err());
    }
}
