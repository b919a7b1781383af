pub mod errors;
pub mod logs;

pub use errors::*;
pub use logs::*;

use derive_more::{AsRef, Display, From, Into};
use serde::{Deserialize, Serialize};

/// Name of a node as known to the membership engine; just a thin newtype so
/// it can't be confused with a tag value or an RPC command string.
#[derive(Deserialize, Serialize, PartialEq, Eq, Hash, Clone, Debug, From, Into, AsRef, Display)]
pub struct NodeName(pub String);

#[derive(Debug, Display)]
pub enum NodeErrorContext {
    #[display(fmt = "Bind failed on {} for {}", addr, component)]
    BindFailed { addr: String, component: String },
}
