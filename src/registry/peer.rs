//! `PeerSentinelRecord`: another Sentinel monitoring the same master,
//! discovered from gossip (`spec.md` §3, Peer-Sentinel-specific fields).
//!
//! Owned by exactly one master's `peer_sentinels` container (Invariant 1),
//! but its `link` may be shared with another master's record of the same
//! physical Sentinel — that's the one field on this type that is a real
//! shared `Arc`, not a back-reference.

use super::address::Address;
use super::flags::InstanceFlags;
use super::link::InstanceLink;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub struct PeerSentinelRecord {
    pub runid: String,
    pub addr: Address,
    pub master_name: String,

    /// Shared via `GlobalState::share_or_new_link` with any other master's
    /// record of the same runid. `Arc::strong_count` is the refcount
    /// `spec.md` describes.
    pub link: Arc<InstanceLink>,

    pub flags: InstanceFlags,

    pub last_hello_time: Option<Instant>,
    pub last_master_down_reply_time: Option<Instant>,

    /// Last time a hello message was published on this peer's connection,
    /// paced at `consts::PUBLISH_PERIOD` independently of the tick cadence.
    pub last_hello_publish: Option<Instant>,

    /// Whom this peer last told us it voted for, and at what epoch.
    pub leader: Option<String>,
    pub leader_epoch: u64,
}

impl PeerSentinelRecord {
    pub fn new(runid: String, addr: Address, master_name: impl Into<String>, link: Arc<InstanceLink>) -> Self {
        Self {
            runid,
            addr,
            master_name: master_name.into(),
            link,
            flags: InstanceFlags::empty(),
            last_hello_time: None,
            last_master_down_reply_time: None,
            last_hello_publish: None,
            leader: None,
            leader_epoch: 0,
        }
    }

    /// `MASTER_DOWN` is cleared once a reply is older than 5x the ask period
    /// (`spec.md` §4.4).
    pub fn master_down_reply_is_stale(&self, now: Instant, ask_period: std::time::Duration) -> bool {
        match self.last_master_down_reply_time {
            Some(t) => now.duration_since(t) > ask_period * 5,
            None => true,
        }
    }
}
