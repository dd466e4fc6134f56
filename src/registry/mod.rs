//! The instance registry: typed records for masters, replicas, and peer
//! Sentinels, their shared links, and the global, explicitly-passed state
//! container (`spec.md` §3).

pub mod address;
pub mod flags;
pub mod global;
pub mod link;
pub mod master;
pub mod peer;
pub mod replica;

pub use address::Address;
pub use flags::{FailoverState, InstanceFlags, MasterLinkStatus};
pub use global::GlobalState;
pub use link::InstanceLink;
pub use master::{MasterConfig, MasterRecord};
pub use peer::PeerSentinelRecord;
pub use replica::ReplicaRecord;
