//! Client configuration
//!
//! The recognized option surface consumed by the core. The host process owns
//! flag parsing and config-file loading; it hands the core a validated
//! `TorConfig`. Unknown keys fed through [`TorConfig::apply_raw_option`] are
//! ignored with a warning; invalid values fail validation before start.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TorError};
use crate::isolation::IsolationLevel;

/// Complete configuration for [`crate::client::TorClient`].
#[derive(Debug, Clone)]
pub struct TorConfig {
    /// Bind port for the SOCKS5 listener
    pub socks_port: u16,

    /// Where guard state and caches live; created 0700 if missing
    pub data_directory: PathBuf,

    /// Minimum guard pool size
    pub num_entry_guards: usize,

    /// Deadline for a single circuit build
    pub circuit_build_timeout: Duration,

    /// Eviction age: a circuit is retired this long after its first stream
    pub max_circuit_dirtiness: Duration,

    /// Base policy for computing isolation keys from SOCKS inputs
    pub isolation_level: IsolationLevel,

    /// Additive isolation flags, composable with `isolation_level`
    pub isolate_destinations: bool,
    pub isolate_socks_auth: bool,
    pub isolate_client_port: bool,

    /// Bridges are unimplemented; this must stay false
    pub use_bridges: bool,

    /// Hard exclusions applied to every hop position
    pub exclude_nodes: Vec<String>,

    /// Hard exclusions applied to the exit position
    pub exclude_exit_nodes: Vec<String>,

    /// Minimum open circuits kept warm per active pool
    pub min_circuits: usize,

    /// Cap on open circuits per pool
    pub max_circuits: usize,

    /// Idle pools (non-default isolation keys) are garbage-collected
    /// after this long without an acquire
    pub pool_idle_timeout: Duration,

    /// Cap on concurrent SOCKS5 connections
    pub max_socks_connections: usize,

    /// Deadline for a stream to reach CONNECTED after BEGIN
    pub stream_connect_timeout: Duration,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            socks_port: 9050,
            data_directory: PathBuf::from(".tor-client"),
            num_entry_guards: 3,
            circuit_build_timeout: Duration::from_secs(60),
            max_circuit_dirtiness: Duration::from_secs(10 * 60),
            isolation_level: IsolationLevel::None,
            isolate_destinations: false,
            isolate_socks_auth: false,
            isolate_client_port: false,
            use_bridges: false,
            exclude_nodes: Vec::new(),
            exclude_exit_nodes: Vec::new(),
            min_circuits: 3,
            max_circuits: 5,
            pool_idle_timeout: Duration::from_secs(10 * 60),
            max_socks_connections: 1000,
            stream_connect_timeout: Duration::from_secs(30),
        }
    }
}

impl TorConfig {
    /// Validate the configuration before start.
    pub fn validate(&self) -> Result<()> {
        if self.socks_port == 0 {
            return Err(TorError::Config("SocksPort must be nonzero".into()));
        }
        if self.num_entry_guards == 0 {
            return Err(TorError::Config("NumEntryGuards must be at least 1".into()));
        }
        if self.circuit_build_timeout < Duration::from_secs(1) {
            return Err(TorError::Config(
                "CircuitBuildTimeout must be at least 1 second".into(),
            ));
        }
        if self.max_circuit_dirtiness.is_zero() {
            return Err(TorError::Config(
                "MaxCircuitDirtiness must be nonzero".into(),
            ));
        }
        if self.use_bridges {
            return Err(TorError::Config(
                "UseBridges is not supported by this client".into(),
            ));
        }
        if self.min_circuits > self.max_circuits {
            return Err(TorError::Config(format!(
                "MinCircuits ({}) exceeds MaxCircuits ({})",
                self.min_circuits, self.max_circuits
            )));
        }
        if self.max_socks_connections == 0 {
            return Err(TorError::Config(
                "MaxSocksConnections must be nonzero".into(),
            ));
        }
        for fp in self.exclude_nodes.iter().chain(&self.exclude_exit_nodes) {
            if fp.len() != 40 || !fp.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(TorError::Config(format!(
                    "Excluded node '{}' is not a 40-char hex fingerprint",
                    fp
                )));
            }
        }
        Ok(())
    }

    /// Apply a raw `key value` option from the host's config loader.
    ///
    /// Recognized keys update the config; unknown keys are ignored with a
    /// warning per the interface contract.
    pub fn apply_raw_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "SocksPort" => {
                self.socks_port = value
                    .parse()
                    .map_err(|_| TorError::Config(format!("bad SocksPort: {}", value)))?;
            }
            "DataDirectory" => self.data_directory = PathBuf::from(value),
            "NumEntryGuards" => {
                self.num_entry_guards = value
                    .parse()
                    .map_err(|_| TorError::Config(format!("bad NumEntryGuards: {}", value)))?;
            }
            "CircuitBuildTimeout" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| TorError::Config(format!("bad CircuitBuildTimeout: {}", value)))?;
                self.circuit_build_timeout = Duration::from_secs(secs);
            }
            "MaxCircuitDirtiness" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| TorError::Config(format!("bad MaxCircuitDirtiness: {}", value)))?;
                self.max_circuit_dirtiness = Duration::from_secs(secs);
            }
            "IsolationLevel" => {
                self.isolation_level = match value {
                    "None" => IsolationLevel::None,
                    "Destination" => IsolationLevel::Destination,
                    "Credential" => IsolationLevel::Credential,
                    "Port" => IsolationLevel::Port,
                    "Session" => IsolationLevel::Session,
                    other => {
                        return Err(TorError::Config(format!(
                            "bad IsolationLevel: {}",
                            other
                        )))
                    }
                };
            }
            "IsolateDestinations" => self.isolate_destinations = parse_bool(key, value)?,
            "IsolateSOCKSAuth" => self.isolate_socks_auth = parse_bool(key, value)?,
            "IsolateClientPort" => self.isolate_client_port = parse_bool(key, value)?,
            "UseBridges" => self.use_bridges = parse_bool(key, value)?,
            "ExcludeNodes" => {
                self.exclude_nodes = split_fingerprints(value);
            }
            "ExcludeExitNodes" => {
                self.exclude_exit_nodes = split_fingerprints(value);
            }
            "MaxSocksConnections" => {
                self.max_socks_connections = value
                    .parse()
                    .map_err(|_| TorError::Config(format!("bad MaxSocksConnections: {}", value)))?;
            }
            unknown => {
                log::warn!("Ignoring unknown configuration key '{}'", unknown);
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(TorError::Config(format!("bad {}: {}", key, other))),
    }
}

fn split_fingerprints(value: &str) -> Vec<String> {
    value
        .split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_start_matches('$').to_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        TorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_bridges_rejected() {
        let mut cfg = TorConfig::default();
        cfg.use_bridges = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_key_ignored() {
        let mut cfg = TorConfig::default();
        cfg.apply_raw_option("FrobnicateLevel", "11").unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_invalid_value_fails() {
        let mut cfg = TorConfig::default();
        assert!(cfg.apply_raw_option("SocksPort", "not-a-port").is_err());
        assert!(cfg.apply_raw_option("IsolationLevel", "Quantum").is_err());
    }

    #[test]
    fn test_exclusion_list_parsing() {
        let mut cfg = TorConfig::default();
        cfg.apply_raw_option(
            "ExcludeNodes",
            "$aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa,BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB",
        )
        .unwrap();
        assert_eq!(cfg.exclude_nodes.len(), 2);
        assert!(cfg.exclude_nodes[0].chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_min_exceeds_max_circuits() {
        let mut cfg = TorConfig::default();
        cfg.min_circuits = 10;
        cfg.max_circuits = 2;
        assert!(cfg.validate().is_err());
    }
}
