//! Relay model
//!
//! Relay metadata assembled from the microdesc consensus plus the relay's
//! microdescriptor (ntor key, ed25519 identity, exit policy, family).

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::error::{Result, TorError};

/// A Tor relay from the consensus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    /// Relay nickname
    pub nickname: String,

    /// RSA identity fingerprint (hex, 40 chars, uppercase)
    pub fingerprint: String,

    /// Ed25519 identity from the microdescriptor, if published
    pub ed25519_identity: Option<[u8; 32]>,

    /// IPv4 (or primary) address
    pub address: IpAddr,

    /// Optional additional IPv6 OR address
    pub ipv6_address: Option<SocketAddr>,

    /// OR (onion router) port
    pub or_port: u16,

    /// Directory port (0 when absent)
    pub dir_port: Option<u16>,

    /// Relay flags
    pub flags: RelayFlags,

    /// Consensus bandwidth weight (kilobytes/sec)
    pub bandwidth: u64,

    /// Advertised version string
    pub version: Option<String>,

    /// ntor onion key (32 bytes, from the microdescriptor)
    pub ntor_onion_key: Option<[u8; 32]>,

    /// Exit port policy from the microdescriptor `p` line
    pub exit_policy: Option<PortPolicy>,

    /// Declared family fingerprints (normalized uppercase hex)
    #[serde(default)]
    pub family: Vec<String>,

    /// Microdescriptor digest from the consensus `m` line (base64)
    #[serde(default)]
    pub microdesc_digest: Option<String>,
}

impl Relay {
    /// Socket address of the OR port
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.or_port)
    }

    /// Decode the hex fingerprint into 20 raw bytes.
    pub fn fingerprint_bytes(&self) -> Result<[u8; 20]> {
        let bytes = hex::decode(&self.fingerprint)
            .map_err(|e| TorError::Internal(format!("bad fingerprint hex: {}", e)))?;
        if bytes.len() != 20 {
            return Err(TorError::Internal(format!(
                "fingerprint must be 20 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// Usable at all: Running and Valid, with a known ntor key.
    pub fn is_usable(&self) -> bool {
        self.flags.running && self.flags.valid && self.ntor_onion_key.is_some()
    }

    /// Guard position eligibility
    pub fn is_guard(&self) -> bool {
        self.is_usable() && self.flags.guard && self.flags.stable && self.flags.fast
    }

    /// Exit position eligibility (policy check is separate)
    pub fn is_exit(&self) -> bool {
        self.is_usable() && self.flags.exit && !self.flags.bad_exit
    }

    /// HSDir eligibility
    pub fn is_hsdir(&self) -> bool {
        self.is_usable() && self.flags.hs_dir
    }

    /// Whether the exit policy permits the given port.
    pub fn allows_exit_to_port(&self, port: u16) -> bool {
        match &self.exit_policy {
            Some(policy) => policy.allows(port),
            None => false,
        }
    }

    /// The /16 prefix for IPv4 path diversity (IPv6 uses /32).
    pub fn subnet_key(&self) -> u64 {
        match self.address {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                u64::from(o[0]) << 8 | u64::from(o[1])
            }
            IpAddr::V6(v6) => {
                let s = v6.segments();
                0x1_0000_0000u64 | (u64::from(s[0]) << 16) | u64::from(s[1])
            }
        }
    }

    /// Whether two relays share a declared family.
    ///
    /// Family is bidirectional: both relays must declare each other.
    pub fn shares_family_with(&self, other: &Relay) -> bool {
        let a_declares_b = self.family.iter().any(|fp| fp == &other.fingerprint);
        let b_declares_a = other.family.iter().any(|fp| fp == &self.fingerprint);
        a_declares_b && b_declares_a
    }
}

/// Relay flags from the consensus `s` line
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayFlags {
    pub authority: bool,
    pub bad_exit: bool,
    pub exit: bool,
    pub fast: bool,
    pub guard: bool,
    pub hs_dir: bool,
    pub running: bool,
    pub stable: bool,
    pub v2_dir: bool,
    pub valid: bool,
}

impl RelayFlags {
    /// Parse flags from a consensus flag list; unknown flags are ignored.
    pub fn from_tokens(flags: &str) -> Self {
        let mut relay_flags = RelayFlags::default();
        for flag in flags.split_whitespace() {
            match flag {
                "Authority" => relay_flags.authority = true,
                "BadExit" => relay_flags.bad_exit = true,
                "Exit" => relay_flags.exit = true,
                "Fast" => relay_flags.fast = true,
                "Guard" => relay_flags.guard = true,
                "HSDir" => relay_flags.hs_dir = true,
                "Running" => relay_flags.running = true,
                "Stable" => relay_flags.stable = true,
                "V2Dir" => relay_flags.v2_dir = true,
                "Valid" => relay_flags.valid = true,
                _ => {}
            }
        }
        relay_flags
    }
}

/// Port policy summary from a microdescriptor `p` line
/// (e.g. `accept 80,443,8000-8999` or `reject 25,119`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortPolicy {
    /// true for an accept-list, false for a reject-list
    pub accept: bool,
    /// inclusive port ranges
    pub ranges: Vec<(u16, u16)>,
}

impl PortPolicy {
    /// Parse `accept <ports>` / `reject <ports>`.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| TorError::Directory("empty port policy".into()))?;
        let accept = match keyword {
            "accept" => true,
            "reject" => false,
            other => {
                return Err(TorError::Directory(format!(
                    "bad port policy keyword '{}'",
                    other
                )))
            }
        };
        let list = parts
            .next()
            .ok_or_else(|| TorError::Directory("port policy missing list".into()))?;

        let mut ranges = Vec::new();
        for item in list.split(',') {
            if let Some((lo, hi)) = item.split_once('-') {
                let lo: u16 = lo
                    .parse()
                    .map_err(|_| TorError::Directory(format!("bad port '{}'", lo)))?;
                let hi: u16 = hi
                    .parse()
                    .map_err(|_| TorError::Directory(format!("bad port '{}'", hi)))?;
                if lo > hi {
                    return Err(TorError::Directory(format!("inverted range '{}'", item)));
                }
                ranges.push((lo, hi));
            } else {
                let port: u16 = item
                    .parse()
                    .map_err(|_| TorError::Directory(format!("bad port '{}'", item)))?;
                ranges.push((port, port));
            }
        }
        Ok(Self { accept, ranges })
    }

    /// Whether this policy permits exiting to `port`.
    pub fn allows(&self, port: u16) -> bool {
        let listed = self.ranges.iter().any(|&(lo, hi)| port >= lo && port <= hi);
        if self.accept {
            listed
        } else {
            !listed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    pub(crate) fn test_relay(nickname: &str, fp_byte: u8, addr: [u8; 4]) -> Relay {
        Relay {
            nickname: nickname.into(),
            fingerprint: hex::encode_upper([fp_byte; 20]),
            ed25519_identity: Some([fp_byte; 32]),
            address: IpAddr::V4(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3])),
            ipv6_address: None,
            or_port: 9001,
            dir_port: Some(9030),
            flags: RelayFlags {
                exit: true,
                fast: true,
                guard: true,
                hs_dir: true,
                running: true,
                stable: true,
                valid: true,
                ..Default::default()
            },
            bandwidth: 1000,
            version: Some("Tor 0.4.8.9".into()),
            ntor_onion_key: Some([fp_byte; 32]),
            exit_policy: Some(PortPolicy {
                accept: true,
                ranges: vec![(80, 80), (443, 443)],
            }),
            family: Vec::new(),
            microdesc_digest: None,
        }
    }

    #[test]
    fn test_accept_policy() {
        let p = PortPolicy::parse("accept 80,443,8000-8999").unwrap();
        assert!(p.allows(80));
        assert!(p.allows(8500));
        assert!(!p.allows(25));
    }

    #[test]
    fn test_reject_policy() {
        let p = PortPolicy::parse("reject 25,119,6660-6669").unwrap();
        assert!(p.allows(443));
        assert!(!p.allows(25));
        assert!(!p.allows(6665));
    }

    #[test]
    fn test_bad_policy() {
        assert!(PortPolicy::parse("frobnicate 1-2").is_err());
        assert!(PortPolicy::parse("accept 99-1").is_err());
        assert!(PortPolicy::parse("accept not-a-port").is_err());
    }

    #[test]
    fn test_subnet_key() {
        let a = test_relay("a", 1, [10, 1, 5, 5]);
        let b = test_relay("b", 2, [10, 1, 200, 200]);
        let c = test_relay("c", 3, [10, 2, 5, 5]);
        assert_eq!(a.subnet_key(), b.subnet_key());
        assert_ne!(a.subnet_key(), c.subnet_key());
    }

    #[test]
    fn test_family_is_bidirectional() {
        let mut a = test_relay("a", 1, [1, 1, 1, 1]);
        let mut b = test_relay("b", 2, [2, 2, 2, 2]);

        a.family = vec![b.fingerprint.clone()];
        assert!(!a.shares_family_with(&b)); // one-sided claim does not count

        b.family = vec![a.fingerprint.clone()];
        assert!(a.shares_family_with(&b));
    }

    #[test]
    fn test_exit_eligibility() {
        let mut r = test_relay("r", 5, [9, 9, 9, 9]);
        assert!(r.is_exit());
        assert!(r.allows_exit_to_port(443));
        assert!(!r.allows_exit_to_port(25));

        r.flags.bad_exit = true;
        assert!(!r.is_exit());
    }

    #[test]
    fn test_usable_requires_ntor_key() {
        let mut r = test_relay("r", 5, [9, 9, 9, 9]);
        r.ntor_onion_key = None;
        assert!(!r.is_usable());
        assert!(!r.is_guard());
    }
}
