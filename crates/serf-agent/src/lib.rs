//! Agent process wiring for the cluster overlay (§4.F Event Bus lives in
//! `serf` itself; this crate adds §4.G's RPC server plus the config/file/
//! snapshot plumbing needed to run a `serf::Serf` as a standalone process).
pub mod agent;
pub mod config;
pub mod files;
pub mod logging;
pub mod rpc;
pub mod snapshot;

pub use agent::Agent;
pub use config::{AgentConfig, ConfigError};
