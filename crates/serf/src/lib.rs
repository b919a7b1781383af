//! Cluster overlay built on top of `memberlist`'s SWIM layer: named members
//! carrying tags, user events with coalescing, queries with filtering and
//! relay, and a Vivaldi network-coordinate client. Plugs into the SWIM
//! engine through the `Delegate` trait rather than reaching into its node
//! table directly.

pub mod config;
pub mod coordinate;
pub mod error;
pub mod event;
pub mod member;
pub mod messages;
pub mod query;
pub mod serf;
pub mod snapshot;

pub use config::SerfConfig;
pub use coordinate::{Coordinate, CoordinateClient, CoordinateStats};
pub use error::{SerfError, SerfResult};
pub use event::{Event, EventBus, EventHandler, MemberEvent, MemberEventType, QueryEventRecord, UserEventRecord};
pub use member::{Member, MemberStatus};
pub use query::{NodeResponse, QueryHandle, QueryParams};
pub use serf::Serf;
pub use snapshot::{NoopSnapshotter, Snapshotter};
