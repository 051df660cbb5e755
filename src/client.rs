//! Client orchestrator
//!
//! Wires the subsystems together and owns the lifecycle: bootstrap
//! (directory fetch, guard restore), run (SOCKS listener, prebuilder,
//! maintenance loops), and bounded shutdown. Nothing runs before a valid
//! consensus is in hand, and every background loop watches the global
//! shutdown signal.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::events::{BootstrapPhase, Event, EventSink, LogEventSink, SharedEventSink};
use crate::isolation::IsolationKey;
use crate::onion::OnionClient;
use crate::path::{LastHop, PathSelector};
use crate::pool::{CircuitFactory, CircuitPool, PoolStatsSnapshot};
use crate::protocol::{
    CircuitBuilder, CircuitHandle, CircuitPurpose, ConsensusSource, DirectoryClient, LinkManager,
};

/// Backoff between circuit build attempts
const BUILD_BACKOFF: [Duration; 3] = [
    Duration::from_secs(0),
    Duration::from_secs(5),
    Duration::from_secs(15),
];

/// Consensus refresh check cadence
const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Shutdown drain window
const SHUTDOWN_WINDOW: Duration = Duration::from_secs(10);

/// Builds real circuits: path selection, link dialing, the build dance,
/// guard accounting, and events.
struct ClientCircuitFactory {
    directory: Arc<DirectoryClient>,
    selector: Arc<PathSelector>,
    links: Arc<LinkManager>,
    build_timeout: Duration,
    events: SharedEventSink,
}

impl CircuitFactory for ClientCircuitFactory {
    fn build(
        &self,
        isolation: IsolationKey,
        last_hop: LastHop,
        purpose: CircuitPurpose,
    ) -> BoxFuture<'_, Result<CircuitHandle>> {
        Box::pin(async move {
            let consensus = self
                .directory
                .current()
                .ok_or_else(|| TorError::Directory("no consensus".into()))?;

            let mut last_error = TorError::CircuitBuildFailed("no attempts made".into());
            for backoff in BUILD_BACKOFF {
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }

                let path = match self.selector.select_path(&consensus, &last_hop) {
                    Ok(path) => path,
                    Err(e) => return Err(e), // no path will appear by retrying here
                };
                let guard_fp = path[0].fingerprint.clone();

                let link = match self.links.get_or_connect(&path[0]).await {
                    Ok(link) => link,
                    Err(e) => {
                        log::info!("guard {} unreachable: {}", &guard_fp[..8], e);
                        self.selector.note_guard_failure(&guard_fp);
                        last_error = e;
                        continue;
                    }
                };

                let build = CircuitBuilder::build(link, &path, purpose, isolation.clone());
                match tokio::time::timeout(self.build_timeout, build).await {
                    Ok(Ok(circuit)) => {
                        self.selector.note_guard_success(&guard_fp);
                        self.events.publish(Event::GuardConfirmed {
                            fingerprint: guard_fp,
                        });
                        self.events.publish(Event::CircuitOpened {
                            circ_id: circuit.circ_id,
                            hops: circuit.path.clone(),
                        });
                        return Ok(circuit);
                    }
                    Ok(Err(e)) => {
                        log::info!("circuit build failed: {}", e);
                        self.selector.note_guard_failure(&guard_fp);
                        last_error = e;
                    }
                    Err(_) => {
                        log::info!("circuit build timed out after {:?}", self.build_timeout);
                        self.selector.note_guard_failure(&guard_fp);
                        last_error = TorError::BuildTimeout;
                    }
                }
            }
            Err(last_error)
        })
    }
}

/// The assembled Tor client.
pub struct TorClient {
    config: TorConfig,
    directory: Arc<DirectoryClient>,
    selector: Arc<PathSelector>,
    links: Arc<LinkManager>,
    pool: Arc<CircuitPool>,
    onion: Arc<OnionClient>,
    events: SharedEventSink,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TorClient {
    /// Bootstrap with the default (log-only) event sink.
    pub async fn bootstrap(config: TorConfig) -> Result<Self> {
        Self::bootstrap_with_events(config, Arc::new(LogEventSink)).await
    }

    /// Bootstrap: validate config, prepare the data directory, restore
    /// guards, and block until a valid consensus is in hand.
    pub async fn bootstrap_with_events(
        config: TorConfig,
        events: SharedEventSink,
    ) -> Result<Self> {
        config.validate()?;
        events.publish(Event::Bootstrap {
            phase: BootstrapPhase::Starting,
        });

        prepare_data_directory(&config)?;

        let selector = Arc::new(PathSelector::new(
            &config.data_directory.join("guards"),
            &config.exclude_nodes,
            &config.exclude_exit_nodes,
            config.num_entry_guards,
        ));

        events.publish(Event::Bootstrap {
            phase: BootstrapPhase::FetchingConsensus,
        });
        let directory = Arc::new(DirectoryClient::new());
        let consensus = directory.fetch_consensus().await?;
        events.publish(Event::Bootstrap {
            phase: BootstrapPhase::ConsensusValid,
        });
        events.publish(Event::ConsensusRefreshed {
            relay_count: consensus.relays.len(),
        });

        let links = Arc::new(LinkManager::new());
        let factory: Arc<dyn CircuitFactory> = Arc::new(ClientCircuitFactory {
            directory: directory.clone(),
            selector: selector.clone(),
            links: links.clone(),
            build_timeout: config.circuit_build_timeout,
            events: events.clone(),
        });

        let pool = CircuitPool::new(factory.clone(), &config, events.clone());
        let onion = Arc::new(OnionClient::new(
            directory.clone(),
            factory,
            config.stream_connect_timeout,
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            directory,
            selector,
            links,
            pool,
            onion,
            events,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Start the SOCKS listener and background loops. Returns once the
    /// listener is bound; the work continues in spawned tasks.
    pub async fn run(&mut self) -> Result<()> {
        self.events.publish(Event::Bootstrap {
            phase: BootstrapPhase::BuildingCircuits,
        });

        // Prebuilder
        let pool = self.pool.clone();
        self.tasks
            .push(tokio::spawn(pool.run_maintenance(self.shutdown_tx.subscribe())));

        // Consensus refresh before valid-until
        let directory = self.directory.clone();
        let events = self.events.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(REFRESH_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match directory.fetch_consensus().await {
                            Ok(consensus) => events.publish(Event::ConsensusRefreshed {
                                relay_count: consensus.relays.len(),
                            }),
                            Err(e) => log::warn!("consensus refresh failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        // SOCKS front door
        let bind = format!("127.0.0.1:{}", self.config.socks_port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| TorError::Config(format!("cannot bind {}: {}", bind, e)))?;
        let socks = Arc::new(crate::socks::SocksServer::new(
            self.pool.clone(),
            self.onion.clone(),
            &self.config,
            self.events.clone(),
        ));
        self.tasks
            .push(tokio::spawn(socks.run(listener, self.shutdown_tx.subscribe())));

        self.events.publish(Event::Bootstrap {
            phase: BootstrapPhase::Done,
        });
        log::info!("bootstrap complete; client running");
        Ok(())
    }

    /// Pool counters for the host's metrics endpoint.
    pub fn pool_stats(&self) -> PoolStatsSnapshot {
        self.pool.stats_snapshot()
    }

    /// Current consensus snapshot, when one is held.
    pub fn consensus(&self) -> Option<Arc<crate::protocol::Consensus>> {
        self.directory.current()
    }

    /// Acquire a circuit directly (library embedding without SOCKS).
    pub async fn acquire_circuit(
        &self,
        key: &IsolationKey,
        port: u16,
    ) -> Result<CircuitHandle> {
        self.pool.acquire(key, LastHop::Exit { port }).await
    }

    /// Orderly shutdown: drain SOCKS, close circuits and links, flush
    /// guard state. Bounded by a fixed window.
    pub async fn shutdown(mut self) {
        log::info!("shutting down");
        let _ = self.shutdown_tx.send(true);

        let teardown = async {
            self.pool.close_all().await;
            self.links.close_all().await;
        };
        if tokio::time::timeout(SHUTDOWN_WINDOW, teardown).await.is_err() {
            log::warn!("teardown exceeded {:?}; abandoning remains", SHUTDOWN_WINDOW);
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Err(e) = self.selector.flush() {
            log::warn!("guard state flush failed: {}", e);
        }
        log::info!("shutdown complete");
    }
}

/// Create the data directory with owner-only permissions.
fn prepare_data_directory(config: &TorConfig) -> Result<()> {
    let dir = &config.data_directory;
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(dir)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        std::fs::set_permissions(dir, permissions)?;
    }
    Ok(())
}
