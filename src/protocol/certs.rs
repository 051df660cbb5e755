//! Tor certificate parsing and verification
//!
//! Implements the tor-cert Ed25519 certificate format and CERTS cell
//! handling for the link handshake. Without this check an attacker who can
//! intercept TCP could impersonate any relay.
//!
//! Reference: tor-spec.txt Section 4.2, cert-spec.txt
//!
//! The Ed25519 certificate format is shared with the onion-service
//! descriptor code, which certifies descriptor signing keys with the same
//! structure.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, TorError};

/// Certificate types carried in a CERTS cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CertType {
    /// Type 1: Link key certificate signed with RSA identity key (legacy)
    RsaLink = 1,
    /// Type 2: RSA1024 identity certificate (legacy)
    RsaId = 2,
    /// Type 3: RSA1024 AUTHENTICATE cell link certificate (legacy)
    RsaAuth = 3,
    /// Type 4: Ed25519 signing key, signed with Ed25519 identity key
    Ed25519SigningKey = 4,
    /// Type 5: TLS link certificate, signed with Ed25519 signing key
    Ed25519TlsLink = 5,
    /// Type 6: Ed25519 AUTHENTICATE cell key
    Ed25519AuthKey = 6,
    /// Type 7: Ed25519 identity, signed with RSA identity (cross-cert)
    Ed25519Identity = 7,
}

/// Ed25519 certificate extension: signed-with-ed25519-key
const EXT_SIGNED_WITH_ED_KEY: u8 = 0x04;

/// tor-cert certified key types
pub const KEY_TYPE_ED25519: u8 = 0x01;
pub const KEY_TYPE_SHA256_OF_X509: u8 = 0x03;

/// A raw certificate entry from a CERTS cell
#[derive(Debug, Clone)]
pub struct Certificate {
    pub cert_type: u8,
    pub data: Vec<u8>,
}

/// Parsed Ed25519 certificate (tor-cert format)
///
/// Layout: VERSION(1)=0x01 | CERT_TYPE(1) | EXPIRATION(4, hours since
/// epoch) | CERT_KEY_TYPE(1) | CERTIFIED_KEY(32) | N_EXTENSIONS(1) |
/// extensions | SIGNATURE(64)
#[derive(Debug, Clone)]
pub struct Ed25519Cert {
    pub version: u8,
    pub cert_type: u8,
    pub expiration_hours: u32,
    pub cert_key_type: u8,
    pub certified_key: [u8; 32],
    /// Signer key from the signed-with-ed25519-key extension, if present
    pub signed_with: Option<[u8; 32]>,
    /// Everything preceding the signature, for verification
    body: Vec<u8>,
    pub signature: [u8; 64],
}

impl Ed25519Cert {
    /// Parse a certificate from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 104 {
            return Err(TorError::Protocol(format!(
                "ed25519 cert too short: {} bytes",
                data.len()
            )));
        }

        let version = data[0];
        if version != 0x01 {
            return Err(TorError::Protocol(format!(
                "unknown ed25519 cert version {}",
                version
            )));
        }

        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let cert_key_type = data[6];

        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        let n_extensions = data[39];
        let mut offset = 40;
        let mut signed_with = None;

        for _ in 0..n_extensions {
            if offset + 4 > data.len() {
                return Err(TorError::Protocol("cert extension header truncated".into()));
            }
            let ext_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            let ext_type = data[offset + 2];
            let ext_data_start = offset + 4;
            if ext_data_start + ext_len > data.len() {
                return Err(TorError::Protocol("cert extension data truncated".into()));
            }
            if ext_type == EXT_SIGNED_WITH_ED_KEY && ext_len == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&data[ext_data_start..ext_data_start + 32]);
                signed_with = Some(key);
            }
            offset = ext_data_start + ext_len;
        }

        if data.len() < offset + 64 {
            return Err(TorError::Protocol("cert signature truncated".into()));
        }
        let sig_start = data.len() - 64;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[sig_start..]);

        Ok(Self {
            version,
            cert_type,
            expiration_hours,
            cert_key_type,
            certified_key,
            signed_with,
            body: data[..sig_start].to_vec(),
            signature,
        })
    }

    /// Verify the certificate signature under the given Ed25519 key.
    pub fn verify(&self, signing_key: &[u8; 32]) -> Result<()> {
        let key = VerifyingKey::from_bytes(signing_key)
            .map_err(|e| TorError::Crypto(format!("invalid ed25519 key: {}", e)))?;
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&self.body, &signature)
            .map_err(|_| TorError::Crypto("ed25519 cert signature invalid".into()))?;
        Ok(())
    }

    /// Verify under the key embedded in the signed-with extension, and
    /// return that key.
    pub fn verify_self_signed(&self) -> Result<[u8; 32]> {
        let signer = self
            .signed_with
            .ok_or_else(|| TorError::Protocol("cert lacks signed-with extension".into()))?;
        self.verify(&signer)?;
        Ok(signer)
    }

    /// Whether the certificate is past its expiration hour.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        let now_hours = now
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_secs() / 3600) as u32)
            .unwrap_or(0);
        self.expiration_hours < now_hours
    }
}

/// Parsed CERTS cell contents.
#[derive(Debug)]
pub struct CertsCell {
    pub certificates: Vec<Certificate>,
}

/// The relay identity material extracted from a verified CERTS cell.
#[derive(Debug, Clone)]
pub struct VerifiedLinkIdentity {
    /// Ed25519 identity key (signer of the signing-key cert)
    pub ed25519_identity: [u8; 32],
    /// Ed25519 signing key
    pub ed25519_signing_key: [u8; 32],
    /// SHA-256 of the TLS link certificate the chain binds to
    pub link_cert_digest: [u8; 32],
}

impl CertsCell {
    /// Parse a CERTS cell payload: N(1), then N x (type(1) | len(2) | body).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(TorError::Protocol("empty CERTS cell".into()));
        }

        let n_certs = data[0] as usize;
        let mut offset = 1;
        let mut certificates = Vec::with_capacity(n_certs);

        for i in 0..n_certs {
            if offset + 3 > data.len() {
                return Err(TorError::Protocol(format!(
                    "CERTS cell truncated at certificate {}",
                    i
                )));
            }
            let cert_type = data[offset];
            let cert_len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
            offset += 3;
            if offset + cert_len > data.len() {
                return Err(TorError::Protocol(format!(
                    "certificate {} data truncated",
                    i
                )));
            }
            certificates.push(Certificate {
                cert_type,
                data: data[offset..offset + cert_len].to_vec(),
            });
            offset += cert_len;
        }

        Ok(Self { certificates })
    }

    fn find(&self, cert_type: CertType) -> Option<&Certificate> {
        self.certificates
            .iter()
            .find(|c| c.cert_type == cert_type as u8)
    }

    /// Verify the Ed25519 certificate chain of a responder's CERTS cell.
    ///
    /// Checks, per tor-spec 4.2:
    /// - the signing-key cert (type 4) is correctly self-scoped: its
    ///   signed-with extension carries the identity key and the signature
    ///   verifies under it;
    /// - the link cert (type 5) verifies under the signing key and
    ///   certifies a SHA-256 of the TLS certificate;
    /// - neither certificate is expired;
    /// - if an expected Ed25519 identity is supplied (from the consensus),
    ///   it matches the chain's identity key.
    pub fn verify_link_chain(
        &self,
        expected_ed_identity: Option<&[u8; 32]>,
        now: SystemTime,
    ) -> Result<VerifiedLinkIdentity> {
        let signing_cert_raw = self
            .find(CertType::Ed25519SigningKey)
            .ok_or_else(|| TorError::Protocol("CERTS missing signing-key cert".into()))?;
        let signing_cert = Ed25519Cert::parse(&signing_cert_raw.data)?;
        let identity = signing_cert.verify_self_signed()?;

        if signing_cert.is_expired(now) {
            return Err(TorError::Crypto("signing-key cert expired".into()));
        }
        if signing_cert.cert_key_type != KEY_TYPE_ED25519 {
            return Err(TorError::Protocol("signing cert certifies non-ed key".into()));
        }
        let signing_key = signing_cert.certified_key;

        let link_cert_raw = self
            .find(CertType::Ed25519TlsLink)
            .ok_or_else(|| TorError::Protocol("CERTS missing TLS link cert".into()))?;
        let link_cert = Ed25519Cert::parse(&link_cert_raw.data)?;
        link_cert.verify(&signing_key)?;
        if link_cert.is_expired(now) {
            return Err(TorError::Crypto("link cert expired".into()));
        }

        if let Some(expected) = expected_ed_identity {
            if !crate::protocol::crypto::constant_time_eq(expected, &identity) {
                return Err(TorError::Crypto(
                    "relay ed25519 identity does not match consensus".into(),
                ));
            }
        }

        Ok(VerifiedLinkIdentity {
            ed25519_identity: identity,
            ed25519_signing_key: signing_key,
            link_cert_digest: link_cert.certified_key,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    /// Build a tor-cert with a signed-with extension, signed by `signer`.
    pub fn make_cert(
        cert_type: u8,
        certified_key: &[u8; 32],
        cert_key_type: u8,
        signer: &SigningKey,
        include_signer_ext: bool,
        expiration_hours: u32,
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(0x01);
        body.push(cert_type);
        body.extend_from_slice(&expiration_hours.to_be_bytes());
        body.push(cert_key_type);
        body.extend_from_slice(certified_key);
        if include_signer_ext {
            body.push(1); // one extension
            body.extend_from_slice(&32u16.to_be_bytes());
            body.push(EXT_SIGNED_WITH_ED_KEY);
            body.push(0); // flags
            body.extend_from_slice(signer.verifying_key().as_bytes());
        } else {
            body.push(0);
        }
        let sig = signer.sign(&body);
        body.extend_from_slice(&sig.to_bytes());
        body
    }
}
