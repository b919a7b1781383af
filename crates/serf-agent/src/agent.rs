//! Ties configuration, the `Serf` overlay, and the RPC server into one
//! runnable process component (§5). This is the crate's equivalent of the
//! teacher's `node` crate's top-level `ApplicationState`: the thing a CLI
//! binary (out of scope here per spec.md §1) constructs and holds for the
//! life of the process.
use crate::config::AgentConfig;
use crate::files::{load_keyring_file, load_tags_file};
use crate::rpc::RpcServer;
use crate::snapshot::{read_snapshot, FileSnapshotter};
use anyhow::Context;
use cluster_util::formats::LogRecord;
use memberlist::keyring::Keyring;
use serf::{NoopSnapshotter, Serf, SerfConfig, Snapshotter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Best-effort drain window given to outstanding RPC connections on
/// shutdown (§5); connections that haven't closed by then are dropped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct Agent {
    pub serf: Arc<Serf>,
    config: Arc<AgentConfig>,
    rpc: RpcServer,
}

impl Agent {
    /// Validates `config`, loads its tag/keyring/snapshot files, builds the
    /// `Serf` overlay and binds the RPC listener. `log_tx` is the broadcast
    /// sender [`crate::logging::init`] returned; the caller owns when
    /// logging gets installed, this just wires `monitor` subscribers to it.
    pub async fn start(config: AgentConfig, log_tx: broadcast::Sender<LogRecord>) -> anyhow::Result<Self> {
        config.validate().context("invalid agent configuration")?;

        let initial_tags = match &config.tags_file {
            Some(path) => load_tags_file(path).with_context(|| format!("loading tags file {}", path.display()))?,
            None => config.tags.clone(),
        };

        let keyring = match (&config.encrypt_key, &config.keyring_file) {
            (Some(key), None) => {
                let key = base64::decode(key).context("decoding encrypt_key")?;
                Some(Keyring::new(vec![key]).context("building keyring from encrypt_key")?)
            }
            (None, Some(path)) => {
                let keys = load_keyring_file(path).with_context(|| format!("loading keyring file {}", path.display()))?;
                Some(Keyring::new(keys).context("building keyring from keyring file")?)
            }
            _ => None,
        };

        let (snapshotter, seed): (Arc<dyn Snapshotter>, Option<crate::snapshot::SnapshotSeed>) = match &config.snapshot_path {
            Some(path) => {
                let seed = read_snapshot(path).with_context(|| format!("reading snapshot {}", path.display()))?;
                let snap = FileSnapshotter::open(path).with_context(|| format!("opening snapshot {}", path.display()))?;
                (Arc::new(snap), Some(seed))
            }
            None => (Arc::new(NoopSnapshotter), None),
        };

        let mut membership = config.membership.clone();
        membership.bind_addr = config.bind_addr;

        let serf_config = SerfConfig {
            node_name: config.node_name.clone(),
            initial_tags,
            event_buffer_size: config.event_buffer_size,
            tombstone_timeout: config.tombstone_timeout,
            membership,
            keyring,
        };

        let serf = Serf::new(serf_config, snapshotter).await.context("starting serf overlay")?;

        if let Some(seed) = seed {
            serf.witness_clocks(seed.event_clock, seed.query_clock);
            if let Some(coord) = seed.coordinate {
                serf.set_coordinate(coord);
            }
            if !seed.rejoin.is_empty() {
                info!(count = seed.rejoin.len(), "rejoining peers from snapshot");
                serf.join(&seed.rejoin).await;
            }
        }

        let config = Arc::new(config);
        let serf = Arc::new(serf);
        let rpc = RpcServer::bind(serf.clone(), config.clone(), log_tx)
            .await
            .context("binding rpc listener")?;

        Ok(Self { serf, config, rpc })
    }

    pub fn rpc_local_addr(&self) -> std::net::SocketAddr {
        self.rpc.local_addr()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Shuts the agent down. `graceful` mirrors the CLI's distinction
    /// between a clean `leave` (broadcasts `Left`, so peers reap this node
    /// immediately) and a forced stop (peers detect the departure through
    /// ordinary probe failure instead).
    pub async fn shutdown(&self, graceful: bool) {
        if graceful {
            self.serf.leave().await;
        }
        self.rpc.shutdown();
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    }
}
