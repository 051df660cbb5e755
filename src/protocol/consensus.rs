//! Network consensus: parsing and signature verification
//!
//! Parses the microdescriptor-flavored consensus from the directory
//! authorities and verifies the authority signature quorum. A consensus is
//! only usable when the current time is inside its validity window and a
//! strict majority of the compiled-in authorities have valid signatures
//! over the canonical document hash.
//!
//! Reference: dir-spec.txt Sections 3.4.1, 3.8.2

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::{Result, TorError};
use crate::protocol::relay::{Relay, RelayFlags};

/// A compiled-in directory authority.
#[derive(Debug, Clone)]
pub struct DirectoryAuthority {
    pub name: &'static str,
    /// v3 identity fingerprint (hex, 40 chars)
    pub v3ident: &'static str,
    /// DirPort address for bootstrap fetches
    pub address: &'static str,
}

/// Hardcoded directory authorities (from the Tor source auth_dirs.inc).
pub const DIRECTORY_AUTHORITIES: &[DirectoryAuthority] = &[
    DirectoryAuthority {
        name: "moria1",
        v3ident: "D586D18309DED4CD6D57C18FDB97EFA96D330566",
        address: "128.31.0.34:9131",
    },
    DirectoryAuthority {
        name: "tor26",
        v3ident: "14C131DFC5C6F93646BE72FA1401C02A8DF2E8B4",
        address: "217.196.147.77:80",
    },
    DirectoryAuthority {
        name: "dizum",
        v3ident: "E8A9C45EDE6D711294FADF8E7951F4DE6CA56B58",
        address: "45.66.35.11:80",
    },
    DirectoryAuthority {
        name: "gabelmoo",
        v3ident: "ED03BB616EB2F60BEC80151114BB25CEF515B226",
        address: "131.188.40.189:80",
    },
    DirectoryAuthority {
        name: "dannenberg",
        v3ident: "0232AF901C31A04EE9848595AF9BB7620D4C5B2E",
        address: "193.23.244.244:80",
    },
    DirectoryAuthority {
        name: "maatuska",
        v3ident: "49015F787433103580E3B66A1707A00E60F2D15B",
        address: "171.25.193.9:443",
    },
    DirectoryAuthority {
        name: "Faravahar",
        v3ident: "EFCBE720AB3A82B99F9E953CD5BF50F7EEFC7B97",
        address: "154.35.175.225:80",
    },
    DirectoryAuthority {
        name: "longclaw",
        v3ident: "23D15D965BC35114467363C165C4F724B64B4F66",
        address: "199.58.81.140:80",
    },
    DirectoryAuthority {
        name: "bastet",
        v3ident: "27102BC123E7AF1D4741AE047E160C91ADC76B21",
        address: "204.13.164.118:80",
    },
];

/// Signatures required: strict majority of compiled-in authorities.
pub fn signature_quorum() -> usize {
    DIRECTORY_AUTHORITIES.len().div_ceil(2) + 1
}

/// Parsed consensus document
#[derive(Debug, Clone)]
pub struct Consensus {
    /// valid-after (unix seconds)
    pub valid_after: u64,

    /// fresh-until (unix seconds)
    pub fresh_until: u64,

    /// valid-until (unix seconds)
    pub valid_until: u64,

    /// shared-rand-current-value
    pub shared_rand_current: Option<[u8; 32]>,

    /// shared-rand-previous-value
    pub shared_rand_previous: Option<[u8; 32]>,

    /// Consensus parameters (`params` line)
    pub params: HashMap<String, i64>,

    /// All relays, in document order
    pub relays: Vec<Relay>,
}

impl Consensus {
    /// Whether `now` is inside [valid-after, valid-until].
    pub fn is_live(&self, now: u64) -> bool {
        now >= self.valid_after && now <= self.valid_until
    }

    /// Whether a refresh is due (past fresh-until).
    pub fn is_fresh(&self, now: u64) -> bool {
        now < self.fresh_until
    }

    /// Time-period length in minutes for the HSDir ring (default 1440).
    pub fn hsdir_interval_minutes(&self) -> u64 {
        self.params
            .get("hsdir-interval")
            .copied()
            .filter(|&v| v > 0)
            .map(|v| v as u64)
            .unwrap_or(1440)
    }

    /// Relays currently usable for path building.
    pub fn usable_relays(&self) -> impl Iterator<Item = &Relay> {
        self.relays.iter().filter(|r| r.is_usable())
    }
}

/// One `directory-signature` block.
#[derive(Debug, Clone)]
pub struct DirectorySignature {
    /// "sha1" or "sha256"
    pub algorithm: String,
    /// Identity fingerprint of the signing authority (hex)
    pub identity: String,
    /// Digest of the signing key used (hex)
    pub signing_key_digest: String,
    /// Raw signature bytes
    pub signature: Vec<u8>,
}

/// Consensus parser for the microdesc flavor.
pub struct ConsensusParser;

impl ConsensusParser {
    /// Parse a consensus document body.
    pub fn parse(text: &str) -> Result<Consensus> {
        let mut valid_after = 0;
        let mut fresh_until = 0;
        let mut valid_until = 0;
        let mut shared_rand_current = None;
        let mut shared_rand_previous = None;
        let mut params = HashMap::new();
        let mut relays: Vec<Relay> = Vec::new();

        let mut current: Option<Relay> = None;

        for line in text.lines() {
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("valid-after ") {
                valid_after = parse_datetime_utc(rest)?;
            } else if let Some(rest) = line.strip_prefix("fresh-until ") {
                fresh_until = parse_datetime_utc(rest)?;
            } else if let Some(rest) = line.strip_prefix("valid-until ") {
                valid_until = parse_datetime_utc(rest)?;
            } else if let Some(rest) = line.strip_prefix("shared-rand-current-value ") {
                shared_rand_current = parse_shared_rand(rest);
            } else if let Some(rest) = line.strip_prefix("shared-rand-previous-value ") {
                shared_rand_previous = parse_shared_rand(rest);
            } else if let Some(rest) = line.strip_prefix("params ") {
                for kv in rest.split_whitespace() {
                    if let Some((k, v)) = kv.split_once('=') {
                        if let Ok(v) = v.parse::<i64>() {
                            params.insert(k.to_string(), v);
                        }
                    }
                }
            } else if line.starts_with("r ") {
                if let Some(relay) = current.take() {
                    relays.push(relay);
                }
                current = Some(Self::parse_r_line(line)?);
            } else if let Some(rest) = line.strip_prefix("a ") {
                if let Some(ref mut relay) = current {
                    // "[2001:db8::1]:9001" parses as a SocketAddr directly
                    if let Ok(addr) = rest.trim().parse() {
                        relay.ipv6_address = Some(addr);
                    }
                }
            } else if let Some(rest) = line.strip_prefix("s ") {
                if let Some(ref mut relay) = current {
                    relay.flags = RelayFlags::from_tokens(rest);
                }
            } else if let Some(rest) = line.strip_prefix("v ") {
                if let Some(ref mut relay) = current {
                    relay.version = Some(rest.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("w ") {
                if let Some(ref mut relay) = current {
                    for part in rest.split_whitespace() {
                        if let Some(bw) = part.strip_prefix("Bandwidth=") {
                            relay.bandwidth = bw.parse().unwrap_or(0);
                        }
                    }
                }
            } else if let Some(rest) = line.strip_prefix("m ") {
                if let Some(ref mut relay) = current {
                    relay.microdesc_digest = Some(rest.trim().to_string());
                }
            } else if line.starts_with("directory-signature") {
                break;
            }
        }
        if let Some(relay) = current.take() {
            relays.push(relay);
        }

        if valid_after == 0 || valid_until == 0 {
            return Err(TorError::Directory(
                "consensus missing validity timestamps".into(),
            ));
        }
        if relays.is_empty() {
            return Err(TorError::Directory("consensus lists no relays".into()));
        }

        Ok(Consensus {
            valid_after,
            fresh_until,
            valid_until,
            shared_rand_current,
            shared_rand_previous,
            params,
            relays,
        })
    }

    /// Parse an `r` line of the microdesc flavor:
    /// `r nickname identity-b64 published-date published-time IP ORPort DirPort`
    fn parse_r_line(line: &str) -> Result<Relay> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 {
            return Err(TorError::Directory(format!("invalid r line: {}", line)));
        }

        let nickname = parts[1].to_string();
        let identity = BASE64
            .decode(pad_b64(parts[2]))
            .map_err(|e| TorError::Directory(format!("bad identity base64: {}", e)))?;
        if identity.len() != 20 {
            return Err(TorError::Directory("identity is not 20 bytes".into()));
        }
        let fingerprint = hex::encode_upper(&identity);

        let address: IpAddr = parts[5]
            .parse()
            .map_err(|_| TorError::Directory(format!("invalid relay address {}", parts[5])))?;
        let or_port: u16 = parts[6]
            .parse()
            .map_err(|_| TorError::Directory("invalid OR port".into()))?;
        let dir_port: Option<u16> = match parts[7] {
            "0" => None,
            p => p.parse().ok(),
        };

        Ok(Relay {
            nickname,
            fingerprint,
            ed25519_identity: None,
            address,
            ipv6_address: None,
            or_port,
            dir_port,
            flags: RelayFlags::default(),
            bandwidth: 0,
            version: None,
            ntor_onion_key: None,
            exit_policy: None,
            family: Vec::new(),
            microdesc_digest: None,
        })
    }
}

fn parse_shared_rand(rest: &str) -> Option<[u8; 32]> {
    // Format: <num-reveals> <base64-value>
    let value = rest.split_whitespace().nth(1)?;
    let bytes = BASE64.decode(pad_b64(value)).ok()?;
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

/// Parse `YYYY-MM-DD HH:MM:SS` (UTC) into unix seconds.
pub fn parse_datetime_utc(s: &str) -> Result<u64> {
    let bad = || TorError::Directory(format!("bad timestamp '{}'", s));
    let (date, time) = s.trim().split_once(' ').ok_or_else(bad)?;

    let mut d = date.split('-');
    let year: i64 = d.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;
    let month: i64 = d.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;
    let day: i64 = d.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;

    let mut t = time.split(':');
    let hour: i64 = t.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;
    let minute: i64 = t.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;
    let second: i64 = t.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 60
    {
        return Err(bad());
    }

    // Days-from-civil (Gregorian), valid for the full consensus date range.
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146097 + doe - 719468;

    let secs = days * 86400 + hour * 3600 + minute * 60 + second;
    u64::try_from(secs).map_err(|_| bad())
}

/// Consensus signature verifier.
pub struct ConsensusVerifier {
    /// v3ident (hex, uppercase) -> authority
    authorities: HashMap<String, &'static DirectoryAuthority>,
}

impl ConsensusVerifier {
    pub fn new() -> Self {
        let mut authorities = HashMap::new();
        for auth in DIRECTORY_AUTHORITIES {
            authorities.insert(auth.v3ident.to_uppercase(), auth);
        }
        Self { authorities }
    }

    /// Extract all `directory-signature` blocks from the document.
    pub fn parse_signatures(&self, consensus_text: &str) -> Vec<DirectorySignature> {
        let mut signatures = Vec::new();
        let mut lines = consensus_text.lines().peekable();

        while let Some(line) = lines.next() {
            let line = line.trim_end();
            if !line.starts_with("directory-signature") {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            let (algorithm, identity, signing_key_digest) = match parts.len() {
                3 => ("sha1".to_string(), parts[1].to_string(), parts[2].to_string()),
                n if n >= 4 => (
                    parts[1].to_string(),
                    parts[2].to_string(),
                    parts[3].to_string(),
                ),
                _ => continue,
            };

            // Collect the base64 between BEGIN/END SIGNATURE markers
            let mut sig_b64 = String::new();
            let mut in_sig = false;
            while let Some(&next) = lines.peek() {
                let next = next.trim();
                if next == "-----BEGIN SIGNATURE-----" {
                    in_sig = true;
                } else if next == "-----END SIGNATURE-----" {
                    lines.next();
                    break;
                } else if next.starts_with("directory-signature") {
                    break;
                } else if in_sig {
                    sig_b64.push_str(next);
                }
                lines.next();
            }

            if let Ok(signature) = BASE64.decode(&sig_b64) {
                signatures.push(DirectorySignature {
                    algorithm,
                    identity,
                    signing_key_digest,
                    signature,
                });
            }
        }

        signatures
    }

    /// Compute the canonical document digest the signatures cover: from
    /// "network-status-version" through the space after the first
    /// "directory-signature " token.
    pub fn canonical_digest_sha256(consensus_text: &str) -> Result<[u8; 32]> {
        let start = consensus_text
            .find("network-status-version")
            .ok_or_else(|| TorError::Directory("missing network-status-version".into()))?;
        const TOKEN: &str = "directory-signature ";
        let sig = consensus_text[start..]
            .find(TOKEN)
            .ok_or_else(|| TorError::Directory("missing directory-signature".into()))?;
        let end = start + sig + TOKEN.len();

        let mut hasher = Sha256::new();
        hasher.update(consensus_text[start..end].as_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(out)
    }

    /// Verify the signature quorum.
    ///
    /// `signing_keys` maps a signing-key digest (hex, uppercase) to the
    /// authority's RSA signing key, as assembled from fetched key
    /// certificates. Returns the number of distinct compiled-in authorities
    /// with valid sha256 signatures, or a quorum failure.
    pub fn verify_quorum(
        &self,
        consensus_text: &str,
        signing_keys: &HashMap<String, RsaPublicKey>,
    ) -> Result<usize> {
        let digest = Self::canonical_digest_sha256(consensus_text)?;
        let signatures = self.parse_signatures(consensus_text);
        log::debug!("consensus carries {} signatures", signatures.len());

        let mut verified: Vec<&'static str> = Vec::new();
        for sig in &signatures {
            if sig.algorithm != "sha256" {
                continue;
            }
            let identity = sig.identity.to_uppercase();
            let Some(auth) = self.authorities.get(&identity) else {
                log::debug!("signature from unknown signer {}", identity);
                continue;
            };
            if verified.contains(&auth.name) {
                continue;
            }
            let Some(key) = signing_keys.get(&sig.signing_key_digest.to_uppercase()) else {
                log::debug!(
                    "no signing key for {} (digest {})",
                    auth.name,
                    sig.signing_key_digest
                );
                continue;
            };

            // Tor signs the raw digest with PKCS#1 v1.5, no DigestInfo prefix.
            match key.verify(Pkcs1v15Sign::new_unprefixed(), &digest, &sig.signature) {
                Ok(()) => {
                    log::debug!("signature verified: {}", auth.name);
                    verified.push(auth.name);
                }
                Err(_) => log::warn!("signature from {} failed verification", auth.name),
            }
        }

        let need = signature_quorum();
        if verified.len() >= need {
            log::info!(
                "consensus signature quorum met: {}/{} ({})",
                verified.len(),
                need,
                verified.join(",")
            );
            Ok(verified.len())
        } else {
            Err(TorError::SignatureQuorumFail {
                got: verified.len(),
                need,
            })
        }
    }
}

impl Default for ConsensusVerifier {
    fn default() -> Self {
        Self::new()
    }
}
