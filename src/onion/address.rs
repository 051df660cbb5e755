//! v3 onion address parsing
//!
//! A v3 address encodes `pubkey(32) || checksum(2) || version(1)` in
//! lowercase unpadded base32, 56 characters plus ".onion". The checksum is
//! the first two bytes of SHA3-256(".onion checksum" || pubkey || version).
//!
//! v2 addresses (16 characters) are deprecated and rejected outright.

use sha3::{Digest, Sha3_256};

use crate::error::{Result, TorError};

const CHECKSUM_PREFIX: &[u8] = b".onion checksum";
const VERSION: u8 = 0x03;
const V3_ADDR_LEN: usize = 56;
const V2_ADDR_LEN: usize = 16;

/// A parsed v3 onion service address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionAddress {
    /// Ed25519 public identity key of the service
    pub pubkey: [u8; 32],
}

impl OnionAddress {
    /// Parse `<56 base32 chars>.onion` (the suffix is optional).
    pub fn parse(address: &str) -> Result<Self> {
        let lowered = address.to_lowercase();
        let trimmed = lowered.trim_end_matches('.');
        let label = trimmed.strip_suffix(".onion").unwrap_or(trimmed);

        if label.len() == V2_ADDR_LEN {
            return Err(TorError::UnsupportedOnionVersion(
                "v2 onion services are deprecated and unsupported".into(),
            ));
        }
        if label.len() != V3_ADDR_LEN {
            return Err(TorError::InvalidOnionAddress(format!(
                "expected {} base32 characters, got {}",
                V3_ADDR_LEN,
                label.len()
            )));
        }

        let decoded = base32::decode(base32::Alphabet::Rfc4648Lower { padding: false }, label)
            .ok_or_else(|| TorError::InvalidOnionAddress("invalid base32".into()))?;
        if decoded.len() != 35 {
            return Err(TorError::InvalidOnionAddress(format!(
                "decoded to {} bytes, expected 35",
                decoded.len()
            )));
        }

        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&decoded[0..32]);
        let checksum = &decoded[32..34];
        let version = decoded[34];

        if version != VERSION {
            return Err(TorError::UnsupportedOnionVersion(format!(
                "onion address version {} (only 3 supported)",
                version
            )));
        }

        let expected = Self::checksum(&pubkey, version);
        if checksum != expected {
            return Err(TorError::InvalidOnionAddress("checksum mismatch".into()));
        }

        Ok(Self { pubkey })
    }

    /// Encode back to the canonical `xxxx.onion` form.
    pub fn encode(&self) -> String {
        let mut blob = Vec::with_capacity(35);
        blob.extend_from_slice(&self.pubkey);
        blob.extend_from_slice(&Self::checksum(&self.pubkey, VERSION));
        blob.push(VERSION);
        let label = base32::encode(base32::Alphabet::Rfc4648Lower { padding: false }, &blob);
        format!("{}.onion", label)
    }

    fn checksum(pubkey: &[u8; 32], version: u8) -> [u8; 2] {
        let mut hasher = Sha3_256::new();
        hasher.update(CHECKSUM_PREFIX);
        hasher.update(pubkey);
        hasher.update([version]);
        let digest = hasher.finalize();
        [digest[0], digest[1]]
    }
}

/// Whether a hostname should be routed through the onion-service client.
pub fn is_onion_hostname(host: &str) -> bool {
    host.trim_end_matches('.')
        .to_lowercase()
        .ends_with(".onion")
}

#[cfg(test)]
mod tests {
    use super::*;

    // A live v3 address (DuckDuckGo's), checksum-valid by construction.
    const KNOWN: &str = "vww6ybal4bd7szmgncyruucpgfkqahzddi37ktceo3ah7ngmcopnpyyd.onion";

    #[test]
    fn test_parse_known_address() {
        let addr = OnionAddress::parse(KNOWN).unwrap();
        assert_eq!(addr.encode(), KNOWN);
    }

    #[test]
    fn test_roundtrip_random_keys() {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let mut pubkey = [0u8; 32];
            rng.fill_bytes(&mut pubkey);
            let addr = OnionAddress { pubkey };
            let encoded = addr.encode();
            let parsed = OnionAddress::parse(&encoded).unwrap();
            assert_eq!(parsed, addr);
        }
    }

    #[test]
    fn test_single_char_flip_detected() {
        // Flip the 5th character to 'z' (it is 'y' in the original).
        let mut chars: Vec<char> = KNOWN.chars().collect();
        assert_ne!(chars[4], 'z');
        chars[4] = 'z';
        let flipped: String = chars.into_iter().collect();
        let err = OnionAddress::parse(&flipped).unwrap_err();
        assert!(matches!(err, TorError::InvalidOnionAddress(ref m) if m.contains("checksum")));
    }

    #[test]
    fn test_v2_rejected() {
        let err = OnionAddress::parse("abcdefghijklmnop.onion").unwrap_err();
        assert!(matches!(err, TorError::UnsupportedOnionVersion(_)));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(OnionAddress::parse("tooshort.onion").is_err());
        let too_long = format!("{}a.onion", &KNOWN[..56]);
        assert!(OnionAddress::parse(&too_long).is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let addr = OnionAddress::parse(KNOWN).unwrap();
        let mut blob = Vec::new();
        blob.extend_from_slice(&addr.pubkey);
        blob.extend_from_slice(&OnionAddress::checksum(&addr.pubkey, 0x04));
        blob.push(0x04);
        let label = base32::encode(base32::Alphabet::Rfc4648Lower { padding: false }, &blob);
        let err = OnionAddress::parse(&format!("{}.onion", label)).unwrap_err();
        assert!(matches!(err, TorError::UnsupportedOnionVersion(_)));
    }

    #[test]
    fn test_is_onion_hostname() {
        assert!(is_onion_hostname(KNOWN));
        assert!(is_onion_hostname("EXAMPLE.ONION"));
        assert!(is_onion_hostname("sub.example.onion."));
        assert!(!is_onion_hostname("example.com"));
        assert!(!is_onion_hostname("onion"));
    }
}
