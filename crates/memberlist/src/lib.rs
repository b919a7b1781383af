//! SWIM-style membership and failure detection: the layer
//! the Serf overlay is built on top of. Owns the node table, the broadcast
//! queue, the probe/suspicion state machine and the UDP/TCP transport.

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod delegate;
pub mod error;
pub mod keyring;
pub mod membership;
pub mod messages;
pub mod node;
pub mod transport;

pub use broadcast::{Broadcast, TransmitQueue};
pub use clock::LClock;
pub use config::MembershipConfig;
pub use delegate::Delegate;
pub use error::MemberError;
pub use keyring::Keyring;
pub use membership::Membership;
pub use node::{Incarnation, Node, NodeState};
