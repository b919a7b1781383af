use memberlist::config::MembershipConfig;
use memberlist::keyring::Keyring;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone)]
pub struct SerfConfig {
    pub node_name: String,
    pub initial_tags: HashMap<String, String>,
    /// Bound on both the user-event history buffer and the recent-message
    /// dedup window (events/queries older than this many Lamport ticks
    /// behind the current clock are dropped as stale).
    pub event_buffer_size: usize,
    pub tombstone_timeout: Duration,
    pub membership: MembershipConfig,
    pub keyring: Option<Keyring>,
}

impl Default for SerfConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            initial_tags: HashMap::new(),
            event_buffer_size: 512,
            tombstone_timeout: Duration::from_secs(24 * 60 * 60),
            membership: MembershipConfig::default(),
            keyring: None,
        }
    }
}
