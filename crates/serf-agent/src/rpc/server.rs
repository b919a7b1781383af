//! TCP accept loop for the RPC protocol (§4.G, §5). One task owns the
//! listener; each accepted connection gets its own task via
//! [`crate::rpc::connection::serve`], the same "accept, spawn, forget"
//! shape `memberlist::transport` uses for its TCP stream listener.
use crate::config::AgentConfig;
use crate::rpc::connection;
use cluster_util::formats::LogRecord;
use serf::Serf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

pub struct RpcServer {
    shutdown_tx: broadcast::Sender<()>,
    local_addr: std::net::SocketAddr,
}

impl RpcServer {
    /// Binds the RPC listener and spawns the accept loop. Returns
    /// immediately; the loop runs until [`RpcServer::shutdown`] is called
    /// or every clone of its handle is dropped.
    pub async fn bind(serf: Arc<Serf>, config: Arc<AgentConfig>, log_tx: broadcast::Sender<LogRecord>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.rpc_bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let accept_shutdown = shutdown_tx.clone();

        tokio::spawn(async move {
            loop {
                let mut shutdown_rx = accept_shutdown.subscribe();
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!(error = %e, "rpc accept failed");
                                continue;
                            }
                        };
                        debug!(%peer, "rpc connection accepted");
                        let serf = serf.clone();
                        let config = config.clone();
                        let log_tx = log_tx.clone();
                        let conn_shutdown = accept_shutdown.subscribe();
                        tokio::spawn(connection::serve(stream, serf, config, log_tx, conn_shutdown));
                    }
                    _ = shutdown_rx.recv() => {
                        info!("rpc accept loop shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self { shutdown_tx, local_addr })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Signals every accepted connection to drain and close. Connections
    /// are given the grace period described in spec.md §5 by the caller
    /// (`agent::Agent::shutdown`) sleeping briefly after calling this.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
