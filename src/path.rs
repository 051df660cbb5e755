//! Path selection
//!
//! Picks 3-hop paths (guard, middle, exit) over a consensus snapshot,
//! honoring relay flags, /16 subnet diversity, declared families, hard
//! exclusions, and guard persistence.
//!
//! Selection is uniform among eligible relays. Consensus bandwidth weights
//! are parsed and available, but weighting is deliberately not applied;
//! see DESIGN.md.

use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, TorError};
use crate::guards::GuardSet;
use crate::protocol::{Consensus, Relay};

/// What the final hop must be able to do.
#[derive(Debug, Clone)]
pub enum LastHop {
    /// An exit whose policy permits this port
    Exit { port: u16 },
    /// A specific relay (HSDir fetch, introduction point)
    Relay { fingerprint: String },
    /// Any stable relay, used as a rendezvous point
    Rendezvous,
}

/// Path selector with persistent guard state.
pub struct PathSelector {
    guards: Mutex<GuardSet>,
    exclude_nodes: HashSet<String>,
    exclude_exit_nodes: HashSet<String>,
    num_entry_guards: usize,
}

impl PathSelector {
    pub fn new(
        guard_state_path: &Path,
        exclude_nodes: &[String],
        exclude_exit_nodes: &[String],
        num_entry_guards: usize,
    ) -> Self {
        Self {
            guards: Mutex::new(GuardSet::load(guard_state_path)),
            exclude_nodes: exclude_nodes.iter().cloned().collect(),
            exclude_exit_nodes: exclude_exit_nodes.iter().cloned().collect(),
            num_entry_guards,
        }
    }

    /// Select an ordered path [G, M, E] of three distinct relays.
    pub fn select_path(&self, consensus: &Consensus, last_hop: &LastHop) -> Result<Vec<Relay>> {
        let usable: Vec<&Relay> = consensus
            .usable_relays()
            .filter(|r| !self.exclude_nodes.contains(&r.fingerprint))
            .collect();
        if usable.len() < 3 {
            return Err(TorError::NoPathAvailable(format!(
                "only {} usable relays",
                usable.len()
            )));
        }

        let exit = self.pick_last_hop(&usable, last_hop)?;
        let guard = self.pick_guard(&usable, &exit)?;
        let middle = self.pick_middle(&usable, &guard, &exit)?;

        Ok(vec![guard, middle, exit])
    }

    fn pick_last_hop(&self, usable: &[&Relay], last_hop: &LastHop) -> Result<Relay> {
        let mut rng = rand::thread_rng();
        match last_hop {
            LastHop::Exit { port } => {
                let candidates: Vec<&&Relay> = usable
                    .iter()
                    .filter(|r| {
                        r.is_exit()
                            && r.allows_exit_to_port(*port)
                            && !self.exclude_exit_nodes.contains(&r.fingerprint)
                    })
                    .collect();
                candidates
                    .choose(&mut rng)
                    .map(|r| (**r).clone())
                    .ok_or_else(|| {
                        TorError::NoPathAvailable(format!("no exit allows port {}", port))
                    })
            }
            LastHop::Relay { fingerprint } => usable
                .iter()
                .find(|r| &r.fingerprint == fingerprint)
                .map(|r| (*r).clone())
                .ok_or_else(|| {
                    TorError::NoPathAvailable(format!(
                        "required relay {} not usable",
                        &fingerprint[..8.min(fingerprint.len())]
                    ))
                }),
            LastHop::Rendezvous => {
                let candidates: Vec<&&Relay> = usable
                    .iter()
                    .filter(|r| r.flags.fast && r.flags.stable)
                    .collect();
                candidates
                    .choose(&mut rng)
                    .map(|r| (**r).clone())
                    .ok_or_else(|| {
                        TorError::NoPathAvailable("no rendezvous candidate".into())
                    })
            }
        }
    }

    /// Choose the entry guard: a usable persisted guard when one is in the
    /// consensus, otherwise a fresh uniform pick from Guard-flagged relays
    /// which is then persisted.
    fn pick_guard(&self, usable: &[&Relay], exit: &Relay) -> Result<Relay> {
        let mut guards = self.guards.lock().expect("lock poisoned");

        let compatible = |relay: &Relay| {
            relay.fingerprint != exit.fingerprint
                && relay.subnet_key() != exit.subnet_key()
                && !relay.shares_family_with(exit)
        };

        // Reconcile persisted guards against this consensus.
        let present: HashSet<String> = usable.iter().map(|r| r.fingerprint.clone()).collect();
        guards.reconcile(&present);
        guards.allow_retries();

        for fingerprint in guards.usable_fingerprints() {
            if let Some(relay) = usable.iter().find(|r| r.fingerprint == fingerprint) {
                if relay.is_guard() && compatible(relay) {
                    return Ok((*relay).clone());
                }
            }
        }

        // No usable persisted guard: pick fresh ones up to the minimum.
        let mut rng = rand::thread_rng();
        let mut candidates: Vec<&&Relay> = usable
            .iter()
            .filter(|r| r.is_guard() && compatible(r) && !guards.contains(&r.fingerprint))
            .collect();
        candidates.shuffle(&mut rng);

        let chosen = candidates
            .first()
            .map(|r| (**r).clone())
            .ok_or_else(|| TorError::NoPathAvailable("no guard candidate".into()))?;

        for candidate in candidates.iter().take(self.num_entry_guards) {
            guards.add(candidate.fingerprint.clone());
        }
        if let Err(e) = guards.save() {
            log::warn!("failed to persist guard state: {}", e);
        }
        Ok(chosen)
    }

    fn pick_middle(&self, usable: &[&Relay], guard: &Relay, exit: &Relay) -> Result<Relay> {
        let mut rng = rand::thread_rng();
        let candidates: Vec<&&Relay> = usable
            .iter()
            .filter(|r| {
                r.fingerprint != guard.fingerprint
                    && r.fingerprint != exit.fingerprint
                    && r.subnet_key() != guard.subnet_key()
                    && r.subnet_key() != exit.subnet_key()
                    && !r.shares_family_with(guard)
                    && !r.shares_family_with(exit)
            })
            .collect();
        candidates
            .choose(&mut rng)
            .map(|r| (**r).clone())
            .ok_or_else(|| TorError::NoPathAvailable("no middle candidate".into()))
    }

    /// Report a successful circuit through this guard; persists the
    /// confirmation.
    pub fn note_guard_success(&self, fingerprint: &str) {
        let mut guards = self.guards.lock().expect("lock poisoned");
        guards.note_success(fingerprint);
        if let Err(e) = guards.save() {
            log::warn!("failed to persist guard state: {}", e);
        }
    }

    /// Report a failed connection to this guard; persists the failure.
    pub fn note_guard_failure(&self, fingerprint: &str) {
        let mut guards = self.guards.lock().expect("lock poisoned");
        guards.note_failure(fingerprint);
        if let Err(e) = guards.save() {
            log::warn!("failed to persist guard state: {}", e);
        }
    }

    /// Whether this guard has been confirmed (used successfully).
    pub fn guard_confirmed(&self, fingerprint: &str) -> bool {
        self.guards
            .lock()
            .expect("lock poisoned")
            .get(fingerprint)
            .map(|g| g.confirmed)
            .unwrap_or(false)
    }

    /// Flush guard state to disk (shutdown path).
    pub fn flush(&self) -> Result<()> {
        self.guards.lock().expect("lock poisoned").save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PortPolicy, RelayFlags};
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::path::PathBuf;

    fn relay(tag: u8, subnet: u8) -> Relay {
        Relay {
            nickname: format!("relay{}", tag),
            fingerprint: hex::encode_upper([tag; 20]),
            ed25519_identity: Some([tag; 32]),
            address: IpAddr::V4(std::net::Ipv4Addr::new(10, subnet, 0, tag)),
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
            version: None,
            ntor_onion_key: Some([tag; 32]),
            exit_policy: Some(PortPolicy {
                accept: true,
                ranges: vec![(1, 65535)],
            }),
            family: Vec::new(),
            microdesc_digest: None,
        }
    }

    fn consensus(relays: Vec<Relay>) -> Consensus {
        Consensus {
            valid_after: 0,
            fresh_until: u64::MAX,
            valid_until: u64::MAX,
            shared_rand_current: Some([1u8; 32]),
            shared_rand_previous: Some([2u8; 32]),
            params: HashMap::new(),
            relays,
        }
    }

    fn selector(name: &str) -> PathSelector {
        let path = std::env::temp_dir().join(format!(
            "tor-client-path-{}-{}",
            std::process::id(),
            name
        ));
        let _ = std::fs::remove_file(&path);
        PathSelector::new(&path, &[], &[], 3)
    }

    fn guard_file(selector_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "tor-client-path-{}-{}",
            std::process::id(),
            selector_name
        ))
    }

    #[test]
    fn test_three_distinct_hops_distinct_subnets() {
        let relays: Vec<Relay> = (1..=8).map(|i| relay(i, i)).collect();
        let consensus = consensus(relays);
        let selector = selector("distinct");

        for _ in 0..20 {
            let path = selector
                .select_path(&consensus, &LastHop::Exit { port: 443 })
                .unwrap();
            assert_eq!(path.len(), 3);
            let fps: HashSet<&String> = path.iter().map(|r| &r.fingerprint).collect();
            assert_eq!(fps.len(), 3);
            let subnets: HashSet<u64> = path.iter().map(|r| r.subnet_key()).collect();
            assert_eq!(subnets.len(), 3);
        }
        std::fs::remove_file(guard_file("distinct")).ok();
    }

    #[test]
    fn test_guard_persists_across_selections() {
        let relays: Vec<Relay> = (1..=8).map(|i| relay(i, i)).collect();
        let consensus = consensus(relays);
        let selector = selector("sticky");

        let first = selector
            .select_path(&consensus, &LastHop::Exit { port: 443 })
            .unwrap();
        let guard_fp = first[0].fingerprint.clone();

        // The same guard is reused while it stays usable (unless it would
        // conflict with the chosen exit).
        let mut reused = 0;
        for _ in 0..10 {
            let path = selector
                .select_path(&consensus, &LastHop::Exit { port: 443 })
                .unwrap();
            if path[0].fingerprint == guard_fp {
                reused += 1;
            }
        }
        assert!(reused >= 7, "guard reused only {}/10 times", reused);
        std::fs::remove_file(guard_file("sticky")).ok();
    }

    #[test]
    fn test_shared_subnet_never_selected_together() {
        // Two relays in the same /16 plus one distinct: no valid 3-hop path
        let relays = vec![relay(1, 5), relay(2, 5), relay(3, 7)];
        let consensus = consensus(relays);
        let selector = selector("subnet");
        assert!(selector
            .select_path(&consensus, &LastHop::Exit { port: 443 })
            .is_err());
        std::fs::remove_file(guard_file("subnet")).ok();
    }

    #[test]
    fn test_family_excluded() {
        let mut relays: Vec<Relay> = (1..=4).map(|i| relay(i, i)).collect();
        // Relays 1 and 2 declare each other as family
        let fp1 = relays[0].fingerprint.clone();
        let fp2 = relays[1].fingerprint.clone();
        relays[0].family = vec![fp2.clone()];
        relays[1].family = vec![fp1.clone()];
        let consensus = consensus(relays);
        let selector = selector("family");

        for _ in 0..30 {
            let path = selector
                .select_path(&consensus, &LastHop::Exit { port: 443 })
                .unwrap();
            let has1 = path.iter().any(|r| r.fingerprint == fp1);
            let has2 = path.iter().any(|r| r.fingerprint == fp2);
            assert!(!(has1 && has2), "family members selected together");
        }
        std::fs::remove_file(guard_file("family")).ok();
    }

    #[test]
    fn test_exit_policy_respected() {
        let mut relays: Vec<Relay> = (1..=6).map(|i| relay(i, i)).collect();
        // Only relay 6 allows port 25
        for r in relays.iter_mut().take(5) {
            r.exit_policy = Some(PortPolicy {
                accept: false,
                ranges: vec![(25, 25)],
            });
        }
        let target = relays[5].fingerprint.clone();
        let consensus = consensus(relays);
        let selector = selector("policy");

        for _ in 0..10 {
            let path = selector
                .select_path(&consensus, &LastHop::Exit { port: 25 })
                .unwrap();
            assert_eq!(path[2].fingerprint, target);
        }
        std::fs::remove_file(guard_file("policy")).ok();
    }

    #[test]
    fn test_exclusions_are_hard() {
        let relays: Vec<Relay> = (1..=6).map(|i| relay(i, i)).collect();
        let banned = relays[2].fingerprint.clone();
        let consensus = consensus(relays);

        let path_file = std::env::temp_dir().join(format!(
            "tor-client-path-{}-excl",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path_file);
        let selector = PathSelector::new(&path_file, std::slice::from_ref(&banned), &[], 3);

        for _ in 0..20 {
            let path = selector
                .select_path(&consensus, &LastHop::Exit { port: 443 })
                .unwrap();
            assert!(path.iter().all(|r| r.fingerprint != banned));
        }
        std::fs::remove_file(&path_file).ok();
    }

    #[test]
    fn test_fixed_last_hop() {
        let relays: Vec<Relay> = (1..=6).map(|i| relay(i, i)).collect();
        let wanted = relays[4].fingerprint.clone();
        let consensus = consensus(relays);
        let selector = selector("fixed");

        let path = selector
            .select_path(
                &consensus,
                &LastHop::Relay {
                    fingerprint: wanted.clone(),
                },
            )
            .unwrap();
        assert_eq!(path[2].fingerprint, wanted);
        assert_ne!(path[0].fingerprint, wanted);
        assert_ne!(path[1].fingerprint, wanted);
        std::fs::remove_file(guard_file("fixed")).ok();
    }
}
