//! Circuit isolation
//!
//! Isolation keys partition circuits so that unrelated requests never share
//! one, preventing cross-request linkage at the exit. A key is an opaque
//! composite of fields computed from the configured policy plus the SOCKS
//! request attributes; equality is structural and hashing runs SHA-256 over
//! a canonicalized byte form.
//!
//! The `None` key (no fields) denotes the one shared default pool; any
//! other key gets its own subpool.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Base isolation policy from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// One shared pool for everything
    #[default]
    None,
    /// Isolate by destination host:port
    Destination,
    /// Isolate by SOCKS username
    Credential,
    /// Isolate by client source port
    Port,
    /// Isolate by session token carried in the credentials
    Session,
}

/// Credential prefix that carries an explicit session token.
pub const SESSION_CREDENTIAL_PREFIX: &str = "SocksIsolationSession";

/// One component of an isolation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum IsolationField {
    /// Destination host:port (lowercased host)
    Destination(String),
    /// SHA-256 of the SOCKS username (credentials are identifiers here)
    Credential([u8; 32]),
    /// Client source port
    SourcePort(u16),
    /// SHA-256 of an explicit session token
    Session([u8; 32]),
}

/// Attributes of one SOCKS request relevant to isolation.
#[derive(Debug, Clone, Default)]
pub struct RequestAttributes {
    pub username: Option<String>,
    pub source_port: u16,
    pub dest_host: String,
    pub dest_port: u16,
}

/// An opaque, structural circuit isolation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IsolationKey {
    /// Sorted for canonical form; empty means the shared pool
    fields: Vec<IsolationField>,
}

impl IsolationKey {
    /// The shared-pool key.
    pub fn none() -> Self {
        Self { fields: Vec::new() }
    }

    /// Whether this is the shared-pool key.
    pub fn is_none(&self) -> bool {
        self.fields.is_empty()
    }

    /// Compute the key for a request under the given policy and additive
    /// flags.
    pub fn compute(
        level: IsolationLevel,
        isolate_destinations: bool,
        isolate_socks_auth: bool,
        isolate_client_port: bool,
        request: &RequestAttributes,
    ) -> Self {
        let mut fields = Vec::new();

        let destination_field = || {
            IsolationField::Destination(format!(
                "{}:{}",
                request.dest_host.to_lowercase(),
                request.dest_port
            ))
        };
        let credential_field = |name: &str| IsolationField::Credential(hash_bytes(name.as_bytes()));

        match level {
            IsolationLevel::None => {}
            IsolationLevel::Destination => fields.push(destination_field()),
            IsolationLevel::Credential => {
                if let Some(name) = &request.username {
                    fields.push(credential_field(name));
                }
            }
            IsolationLevel::Port => fields.push(IsolationField::SourcePort(request.source_port)),
            IsolationLevel::Session => {
                if let Some(token) = request
                    .username
                    .as_deref()
                    .and_then(|u| u.strip_prefix(SESSION_CREDENTIAL_PREFIX))
                {
                    fields.push(IsolationField::Session(hash_bytes(token.as_bytes())));
                }
            }
        }

        if isolate_destinations {
            fields.push(destination_field());
        }
        if isolate_socks_auth {
            if let Some(name) = &request.username {
                fields.push(credential_field(name));
            }
        }
        if isolate_client_port {
            fields.push(IsolationField::SourcePort(request.source_port));
        }

        fields.sort();
        fields.dedup();
        Self { fields }
    }

    /// SHA-256 over the canonical byte form, for logging and map keys that
    /// must not leak field contents.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for field in &self.fields {
            match field {
                IsolationField::Destination(dest) => {
                    hasher.update([0x01]);
                    hasher.update((dest.len() as u32).to_be_bytes());
                    hasher.update(dest.as_bytes());
                }
                IsolationField::Credential(h) => {
                    hasher.update([0x02]);
                    hasher.update(h);
                }
                IsolationField::SourcePort(port) => {
                    hasher.update([0x03]);
                    hasher.update(port.to_be_bytes());
                }
                IsolationField::Session(h) => {
                    hasher.update([0x04]);
                    hasher.update(h);
                }
            }
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    /// Short hex tag for log lines.
    pub fn tag(&self) -> String {
        if self.is_none() {
            "none".into()
        } else {
            hex::encode(&self.digest()[..6])
        }
    }
}

fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(bytes));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user: Option<&str>, src_port: u16, host: &str, port: u16) -> RequestAttributes {
        RequestAttributes {
            username: user.map(String::from),
            source_port: src_port,
            dest_host: host.into(),
            dest_port: port,
        }
    }

    #[test]
    fn test_none_level_shares_pool() {
        let a = IsolationKey::compute(
            IsolationLevel::None,
            false,
            false,
            false,
            &request(Some("alice"), 1000, "example.com", 443),
        );
        let b = IsolationKey::compute(
            IsolationLevel::None,
            false,
            false,
            false,
            &request(Some("bob"), 2000, "other.net", 80),
        );
        assert!(a.is_none());
        assert_eq!(a, b);
        assert_eq!(a, IsolationKey::none());
    }

    #[test]
    fn test_credential_isolation() {
        let alice = IsolationKey::compute(
            IsolationLevel::Credential,
            false,
            false,
            false,
            &request(Some("alice"), 1000, "example.com", 443),
        );
        let bob = IsolationKey::compute(
            IsolationLevel::Credential,
            false,
            false,
            false,
            &request(Some("bob"), 1000, "example.com", 443),
        );
        assert_ne!(alice, bob);
        assert!(!alice.is_none());

        // Same user, different destination: same key at this level
        let alice2 = IsolationKey::compute(
            IsolationLevel::Credential,
            false,
            false,
            false,
            &request(Some("alice"), 1001, "other.net", 80),
        );
        assert_eq!(alice, alice2);
    }

    #[test]
    fn test_destination_isolation_case_insensitive() {
        let a = IsolationKey::compute(
            IsolationLevel::Destination,
            false,
            false,
            false,
            &request(None, 1, "Example.COM", 443),
        );
        let b = IsolationKey::compute(
            IsolationLevel::Destination,
            false,
            false,
            false,
            &request(None, 2, "example.com", 443),
        );
        assert_eq!(a, b);

        let c = IsolationKey::compute(
            IsolationLevel::Destination,
            false,
            false,
            false,
            &request(None, 2, "example.com", 80),
        );
        assert_ne!(a, c);
    }

    #[test]
    fn test_additive_flags_compose() {
        let base = IsolationKey::compute(
            IsolationLevel::Credential,
            true, // + destinations
            false,
            true, // + client port
            &request(Some("alice"), 4321, "example.com", 443),
        );
        let different_port = IsolationKey::compute(
            IsolationLevel::Credential,
            true,
            false,
            true,
            &request(Some("alice"), 9999, "example.com", 443),
        );
        assert_ne!(base, different_port);
    }

    #[test]
    fn test_session_token_prefix() {
        let s1 = IsolationKey::compute(
            IsolationLevel::Session,
            false,
            false,
            false,
            &request(Some("SocksIsolationSession-tab42"), 1, "x.org", 80),
        );
        let s2 = IsolationKey::compute(
            IsolationLevel::Session,
            false,
            false,
            false,
            &request(Some("SocksIsolationSession-tab43"), 1, "x.org", 80),
        );
        let plain = IsolationKey::compute(
            IsolationLevel::Session,
            false,
            false,
            false,
            &request(Some("alice"), 1, "x.org", 80),
        );
        assert_ne!(s1, s2);
        assert!(plain.is_none()); // no token, no isolation field
    }

    #[test]
    fn test_digest_is_stable_and_structural() {
        let a = IsolationKey::compute(
            IsolationLevel::Destination,
            false,
            true,
            false,
            &request(Some("u"), 5, "host.tld", 22),
        );
        let b = IsolationKey::compute(
            IsolationLevel::Destination,
            false,
            true,
            false,
            &request(Some("u"), 6, "host.tld", 22),
        );
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.tag(), b.tag());
        assert_ne!(a.tag(), IsolationKey::none().tag());
    }
}
