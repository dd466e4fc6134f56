//! `ReplicaRecord`: a replica of some monitored master, auto-discovered by
//! parsing the master's `INFO` (`spec.md` §3, Replica-specific fields).
//!
//! Owned by exactly one master's `replicas` container (Invariant 2). The
//! back-reference to the owning master is the master's *name*, a plain
//! `String` rather than a pointer — the cyclic-ownership guidance in
//! `spec.md` §9 calls for "owner containers plus non-owning references from
//! child to parent"; a name is as far from a real pointer as that gets, and
//! the parent container is what a caller already has on hand when walking a
//! `ReplicaRecord`.

use super::address::Address;
use super::flags::{InstanceFlags, MasterLinkStatus};
use super::link::InstanceLink;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub struct ReplicaRecord {
    pub addr: Address,
    pub master_name: String,
    pub runid: Option<String>,
    pub role_reported: ReportedRole,
    pub role_reported_time: Option<Instant>,

    /// When this replica was first added to the registry. `correct_drift`
    /// will not coerce a replica's config until it has been known for at
    /// least `consts::DRIFT_CORRECTION_GRACE_PERIOD`, giving a freshly
    /// discovered replica time to catch up on its own `REPLICAOF` first.
    pub discovered_at: Instant,

    /// Refcount is always 1 for a replica's own link — it is never shared
    /// with another master's record (only peer-Sentinel links are shared).
    pub link: Arc<InstanceLink>,

    pub flags: InstanceFlags,

    pub master_host: Option<String>,
    pub master_port: Option<u16>,
    pub link_status: MasterLinkStatus,
    pub master_link_down_time: Option<Instant>,

    pub repl_offset: u64,
    pub slave_priority: u16,
    pub replica_announced: bool,

    pub slave_conf_change_time: Option<Instant>,
    pub slave_reconf_sent_time: Option<Instant>,

    /// Last time an `INFO` reply was successfully parsed for this instance.
    pub info_refresh: Option<Instant>,
    /// Last raw `INFO` reply seen, for `SENTINEL INFO-CACHE`.
    pub info_cache: Option<String>,

    /// Last time a hello message was published on this replica's own
    /// connection, paced at `consts::PUBLISH_PERIOD` independently of the
    /// tick cadence.
    pub last_hello_publish: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportedRole {
    #[default]
    Unknown,
    Master,
    Slave,
}

impl ReplicaRecord {
    pub fn new(addr: Address, master_name: impl Into<String>) -> Self {
        let link = InstanceLink::new(addr.socket_addr());
        Self {
            addr,
            master_name: master_name.into(),
            runid: None,
            role_reported: ReportedRole::Unknown,
            role_reported_time: None,
            discovered_at: Instant::now(),
            link,
            flags: InstanceFlags::empty(),
            master_host: None,
            master_port: None,
            link_status: MasterLinkStatus::Unknown,
            master_link_down_time: None,
            repl_offset: 0,
            slave_priority: 100,
            replica_announced: true,
            slave_conf_change_time: None,
            slave_reconf_sent_time: None,
            info_refresh: None,
            info_cache: None,
            last_hello_publish: None,
        }
    }

    /// A replica is eligible for promotion unless disqualified by one of the
    /// `spec.md` §4.6 SELECT_SLAVE exclusion rules (evaluated by the caller,
    /// which has the timing context this record alone cannot see).
    pub fn is_down(&self) -> bool {
        self.flags
            .intersects(InstanceFlags::S_DOWN | InstanceFlags::O_DOWN)
    }
}
