//! Typed configuration sink for an agent process. CLI argument parsing and
//! JSON config *file* loading are collaborator concerns; this struct is what
//! those collaborators populate before handing it to
//! [`crate::agent::Agent::start`]. Validation happens eagerly: a bad config
//! is rejected before any component starts rather than failing midway
//! through bring-up.
use memberlist::config::MembershipConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("'tags' and 'tags_file' are mutually exclusive")]
    TagsAndTagsFile,
    #[error("'encrypt_key' and 'keyring_file' are mutually exclusive")]
    EncryptKeyAndKeyringFile,
    #[error("invalid encryption key length {0}, expected 16 or 32 bytes")]
    InvalidKeyLength(usize),
    #[error("rpc_auth_key must not be empty when set")]
    EmptyAuthKey,
    #[error("event_buffer_size must be greater than zero")]
    ZeroEventBuffer,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Typed agent configuration. Deserializable from JSON so a collaborator can
/// load it from a config file, but this crate itself never reads a path off
/// disk — that I/O, plus CLI-flag overlay, is out of scope per spec.md §1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub node_name: String,
    pub bind_addr: SocketAddr,
    pub rpc_bind_addr: SocketAddr,
    #[serde(default)]
    pub rpc_auth_key: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub tags_file: Option<PathBuf>,
    #[serde(default)]
    pub encrypt_key: Option<String>,
    #[serde(default)]
    pub keyring_file: Option<PathBuf>,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    #[serde(default = "default_user_event_size_limit")]
    pub user_event_size_limit: usize,
    #[serde(default = "default_tombstone_timeout")]
    pub tombstone_timeout: Duration,
    #[serde(default = "default_query_timeout")]
    pub default_query_timeout: Duration,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default = "default_max_rpc_frame")]
    pub max_rpc_frame_bytes: usize,
}

fn default_event_buffer_size() -> usize {
    512
}
fn default_user_event_size_limit() -> usize {
    512
}
fn default_tombstone_timeout() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}
fn default_query_timeout() -> Duration {
    Duration::from_secs(15)
}
fn default_max_rpc_frame() -> usize {
    1024 * 1024
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            bind_addr: "0.0.0.0:7946".parse().unwrap(),
            rpc_bind_addr: "127.0.0.1:7373".parse().unwrap(),
            rpc_auth_key: None,
            tags: HashMap::new(),
            tags_file: None,
            encrypt_key: None,
            keyring_file: None,
            snapshot_path: None,
            event_buffer_size: default_event_buffer_size(),
            user_event_size_limit: default_user_event_size_limit(),
            tombstone_timeout: default_tombstone_timeout(),
            default_query_timeout: default_query_timeout(),
            membership: MembershipConfig::default(),
            max_rpc_frame_bytes: default_max_rpc_frame(),
        }
    }
}

impl AgentConfig {
    /// Mirrors the fatal-at-startup config checks of spec.md §7: mutually
    /// exclusive options, bad key length, and the couple of agent-level
    /// sanity checks (empty auth key, zero-sized event buffer) that would
    /// otherwise surface as confusing runtime behavior much later.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.tags.is_empty() && self.tags_file.is_some() {
            return Err(ConfigError::TagsAndTagsFile);
        }
        if self.encrypt_key.is_some() && self.keyring_file.is_some() {
            return Err(ConfigError::EncryptKeyAndKeyringFile);
        }
        if let Some(key) = &self.encrypt_key {
            let decoded = base64::decode(key).map_err(|_| ConfigError::InvalidKeyLength(0))?;
            if decoded.len() != 16 && decoded.len() != 32 {
                return Err(ConfigError::InvalidKeyLength(decoded.len()));
            }
        }
        if matches!(&self.rpc_auth_key, Some(k) if k.is_empty()) {
            return Err(ConfigError::EmptyAuthKey);
        }
        if self.event_buffer_size == 0 {
            return Err(ConfigError::ZeroEventBuffer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_tags_and_tags_file_together() {
        let mut cfg = AgentConfig {
            node_name: "a".into(),
            ..Default::default()
        };
        cfg.tags.insert("role".into(), "leader".into());
        cfg.tags_file = Some("/tmp/tags.json".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::TagsAndTagsFile)));
    }

    #[test]
    fn rejects_encrypt_key_and_keyring_file_together() {
        let cfg = AgentConfig {
            node_name: "a".into(),
            encrypt_key: Some("AAAAAAAAAAAAAAAAAAAAAA==".into()),
            keyring_file: Some("/tmp/keyring.json".into()),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::EncryptKeyAndKeyringFile)));
    }

    #[test]
    fn rejects_bad_key_length() {
        let cfg = AgentConfig {
            node_name: "a".into(),
            encrypt_key: Some("AAAA".into()),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidKeyLength(_))));
    }

    #[test]
    fn accepts_a_well_formed_config() {
        let cfg = AgentConfig {
            node_name: "a".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
