//! Guard persistence
//!
//! Entry guards are selected once and reused for a long time: rotating the
//! first hop often hands an adversary repeated chances to observe a client.
//! The guard set survives restarts in a single checksummed file under the
//! data directory.
//!
//! Rotation rules:
//! - a guard missing from the consensus for more than 30 days is dropped
//! - a guard unreachable for more than 3 days (after retries) is dropped
//! - three consecutive connection failures mark a guard unreachable so the
//!   selector moves to a different one

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, TorError};

/// Consensus absence after which a guard is rotated out
const MISSING_ROTATE_SECS: u64 = 30 * 24 * 60 * 60;

/// Unreachability after which a guard is rotated out
const UNREACHABLE_ROTATE_SECS: u64 = 3 * 24 * 60 * 60;

/// Consecutive failures before a guard is marked unreachable
const FAILURES_BEFORE_UNREACHABLE: u32 = 3;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One persisted guard record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guard {
    /// RSA identity fingerprint (hex, uppercase)
    pub fingerprint: String,

    /// When this guard was first selected
    pub first_seen: u64,

    /// Has been used successfully at least once
    pub confirmed: bool,

    /// Last connection attempt (0 = never)
    pub last_tried: u64,

    /// When the guard became unreachable (0 = reachable)
    pub unreachable_since: u64,

    /// When the guard vanished from the consensus (0 = present)
    #[serde(default)]
    pub missing_since: u64,

    /// Consecutive failed attempts since the last success
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl Guard {
    fn new(fingerprint: String) -> Self {
        Self {
            fingerprint,
            first_seen: now_unix(),
            confirmed: false,
            last_tried: 0,
            unreachable_since: 0,
            missing_since: 0,
            consecutive_failures: 0,
        }
    }

    /// Usable as a first hop right now.
    pub fn is_usable(&self) -> bool {
        self.unreachable_since == 0 && self.missing_since == 0
    }
}

/// The persistent guard set.
pub struct GuardSet {
    guards: Vec<Guard>,
    path: PathBuf,
}

impl GuardSet {
    /// Load the guard set from `path`. A missing file yields an empty set;
    /// a torn or corrupted file (checksum mismatch) is discarded with a
    /// warning.
    pub fn load(path: &Path) -> Self {
        let guards = match std::fs::read(path) {
            Ok(bytes) => match Self::decode(&bytes) {
                Ok(guards) => {
                    log::info!("restored {} guards from {}", guards.len(), path.display());
                    guards
                }
                Err(e) => {
                    log::warn!("discarding guard state ({}): {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            guards,
            path: path.to_path_buf(),
        }
    }

    /// Serialize: JSON record list followed by a 32-byte SHA-256 checksum.
    fn encode(guards: &[Guard]) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(guards)
            .map_err(|e| TorError::Internal(format!("guard serialization: {}", e)))?;
        let checksum = Sha256::digest(&bytes);
        bytes.extend_from_slice(&checksum);
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<Vec<Guard>> {
        if bytes.len() < 32 {
            return Err(TorError::Internal("guard file too short".into()));
        }
        let (body, checksum) = bytes.split_at(bytes.len() - 32);
        let expected = Sha256::digest(body);
        if expected.as_slice() != checksum {
            return Err(TorError::Internal("guard file checksum mismatch".into()));
        }
        serde_json::from_slice(body)
            .map_err(|e| TorError::Internal(format!("guard deserialization: {}", e)))
    }

    /// Persist to disk: write-to-temp, fsync, atomic rename.
    pub fn save(&self) -> Result<()> {
        let bytes = Self::encode(&self.guards)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Fingerprints usable as a first hop, confirmed guards first.
    pub fn usable_fingerprints(&self) -> Vec<String> {
        let mut usable: Vec<&Guard> = self.guards.iter().filter(|g| g.is_usable()).collect();
        usable.sort_by_key(|g| !g.confirmed);
        usable.iter().map(|g| g.fingerprint.clone()).collect()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.guards.iter().any(|g| g.fingerprint == fingerprint)
    }

    pub fn get(&self, fingerprint: &str) -> Option<&Guard> {
        self.guards.iter().find(|g| g.fingerprint == fingerprint)
    }

    /// Add a newly selected guard.
    pub fn add(&mut self, fingerprint: String) {
        if !self.contains(&fingerprint) {
            log::info!("new entry guard {}", &fingerprint[..8.min(fingerprint.len())]);
            self.guards.push(Guard::new(fingerprint));
        }
    }

    /// Record a successful use: confirms the guard and clears failure
    /// state.
    pub fn note_success(&mut self, fingerprint: &str) {
        if let Some(guard) = self.guards.iter_mut().find(|g| g.fingerprint == fingerprint) {
            guard.confirmed = true;
            guard.last_tried = now_unix();
            guard.unreachable_since = 0;
            guard.consecutive_failures = 0;
        }
    }

    /// Record a failed attempt. A guard is not dropped for one failure;
    /// after three consecutive failures it is marked unreachable.
    pub fn note_failure(&mut self, fingerprint: &str) {
        if let Some(guard) = self.guards.iter_mut().find(|g| g.fingerprint == fingerprint) {
            guard.last_tried = now_unix();
            guard.consecutive_failures += 1;
            if guard.consecutive_failures >= FAILURES_BEFORE_UNREACHABLE
                && guard.unreachable_since == 0
            {
                log::warn!(
                    "guard {} unreachable after {} failures",
                    &guard.fingerprint[..8],
                    guard.consecutive_failures
                );
                guard.unreachable_since = now_unix();
            }
        }
    }

    /// Reconcile with a fresh consensus: track disappearance, and rotate
    /// out guards gone too long or unreachable too long.
    pub fn reconcile(&mut self, present_fingerprints: &HashSet<String>) {
        let now = now_unix();
        for guard in &mut self.guards {
            if present_fingerprints.contains(&guard.fingerprint) {
                guard.missing_since = 0;
            } else if guard.missing_since == 0 {
                guard.missing_since = now;
            }
        }
        self.guards.retain(|g| {
            let missing_too_long =
                g.missing_since != 0 && now.saturating_sub(g.missing_since) > MISSING_ROTATE_SECS;
            let unreachable_too_long = g.unreachable_since != 0
                && now.saturating_sub(g.unreachable_since) > UNREACHABLE_ROTATE_SECS;
            if missing_too_long || unreachable_too_long {
                log::info!("rotating out guard {}", &g.fingerprint[..8]);
            }
            !(missing_too_long || unreachable_too_long)
        });
    }

    /// Retry guards whose unreachable mark is stale enough to probe again
    /// (one hour), without dropping them.
    pub fn allow_retries(&mut self) {
        let now = now_unix();
        for guard in &mut self.guards {
            if guard.unreachable_since != 0
                && now.saturating_sub(guard.last_tried) > 3600
                && now.saturating_sub(guard.unreachable_since) <= UNREACHABLE_ROTATE_SECS
            {
                guard.consecutive_failures = 0;
                guard.unreachable_since = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tor-client-guards-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_roundtrip_persistence() {
        let path = temp_path("roundtrip");
        let mut set = GuardSet::load(&path);
        assert!(set.is_empty());

        set.add("AAAA000000000000000000000000000000000000".into());
        set.add("BBBB000000000000000000000000000000000000".into());
        set.note_success("AAAA000000000000000000000000000000000000");
        set.save().unwrap();

        let restored = GuardSet::load(&path);
        assert_eq!(restored.len(), 2);
        let guard = restored
            .get("AAAA000000000000000000000000000000000000")
            .unwrap();
        assert!(guard.confirmed);
        assert_eq!(guard.consecutive_failures, 0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_torn_write_detected() {
        let path = temp_path("torn");
        let mut set = GuardSet::load(&path);
        set.add("CCCC000000000000000000000000000000000000".into());
        set.save().unwrap();

        // Truncate mid-file: checksum no longer matches
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();

        let restored = GuardSet::load(&path);
        assert!(restored.is_empty());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_three_failures_mark_unreachable() {
        let path = temp_path("failures");
        let mut set = GuardSet::load(&path);
        let fp = "DDDD000000000000000000000000000000000000";
        set.add(fp.into());

        set.note_failure(fp);
        set.note_failure(fp);
        assert!(set.get(fp).unwrap().is_usable());

        set.note_failure(fp);
        assert!(!set.get(fp).unwrap().is_usable());
        assert!(set.usable_fingerprints().is_empty());

        // Success clears everything
        set.note_success(fp);
        assert!(set.get(fp).unwrap().is_usable());
        assert!(set.get(fp).unwrap().confirmed);
    }

    #[test]
    fn test_reconcile_tracks_missing() {
        let path = temp_path("reconcile");
        let mut set = GuardSet::load(&path);
        let fp = "EEEE000000000000000000000000000000000000".to_string();
        set.add(fp.clone());

        let empty = HashSet::new();
        set.reconcile(&empty);
        // Freshly missing, not yet rotated
        assert_eq!(set.len(), 1);
        assert!(!set.get(&fp).unwrap().is_usable());

        let mut present = HashSet::new();
        present.insert(fp.clone());
        set.reconcile(&present);
        assert!(set.get(&fp).unwrap().is_usable());
    }

    #[test]
    fn test_confirmed_guards_listed_first() {
        let path = temp_path("order");
        let mut set = GuardSet::load(&path);
        set.add("1111000000000000000000000000000000000000".into());
        set.add("2222000000000000000000000000000000000000".into());
        set.note_success("2222000000000000000000000000000000000000");

        let usable = set.usable_fingerprints();
        assert_eq!(usable[0], "2222000000000000000000000000000000000000");
    }
}
