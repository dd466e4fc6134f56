//! `MasterRecord`: a monitored master, its configuration, its epochs and
//! failover state, and the nested containers owning its replicas and peer
//! Sentinels (`spec.md` §3).

use super::address::Address;
use super::flags::{FailoverState, InstanceFlags, MasterLinkStatus};
use super::link::InstanceLink;
use super::peer::PeerSentinelRecord;
use super::replica::ReplicaRecord;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-master tunables, loaded from the bootstrap config and mutable at
/// runtime via `SENTINEL SET` (`spec.md` §6).
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    pub name: String,
    pub quorum: usize,

    #[serde(default = "default_down_after")]
    #[serde(with = "humantime_serde")]
    pub down_after: Duration,

    #[serde(default = "default_failover_timeout")]
    #[serde(with = "humantime_serde")]
    pub failover_timeout: Duration,

    #[serde(default = "default_parallel_syncs")]
    pub parallel_syncs: usize,

    pub auth_user: Option<String>,
    pub auth_pass: Option<String>,

    pub notification_script: Option<PathBuf>,
    pub client_reconfig_script: Option<PathBuf>,

    #[serde(default)]
    pub rename_command: HashMap<String, String>,
}

impl MasterConfig {
    /// Credentials to present to this master, its replicas, and its peer
    /// Sentinels, in the `(user, pass)` shape `SentinelClient::auth` takes.
    /// `None` when no `auth-pass` is configured, since `AUTH` with no
    /// password set is itself an error on the other side.
    pub fn auth(&self) -> Option<(&str, &str)> {
        self.auth_pass.as_deref().map(|pass| (self.auth_user.as_deref().unwrap_or(""), pass))
    }
}

pub fn default_down_after() -> Duration {
    Duration::from_millis(30_000)
}
pub fn default_failover_timeout() -> Duration {
    Duration::from_millis(180_000)
}
pub fn default_parallel_syncs() -> usize {
    1
}

#[derive(Debug)]
pub struct MasterRecord {
    pub config: MasterConfig,

    pub addr: Address,
    pub runid: Option<String>,
    pub role_reported_time: Option<Instant>,
    pub link: Arc<InstanceLink>,
    pub flags: InstanceFlags,

    pub s_down_since: Option<Instant>,
    pub slave_role_since: Option<Instant>,
    pub info_refresh: Option<Instant>,
    /// Last raw `INFO` reply seen, for `SENTINEL INFO-CACHE`.
    pub info_cache: Option<String>,
    /// Last time a hello message was published for this master, paced at
    /// `consts::PUBLISH_PERIOD` independently of the tick cadence.
    pub last_hello_publish: Option<Instant>,

    pub config_epoch: u64,
    /// The epoch and candidate this Sentinel itself last voted for, for this
    /// master (`spec.md` §3 "leader_epoch: whom I voted for and when").
    pub voted_leader: Option<String>,
    pub voted_leader_epoch: u64,
    pub failover_epoch: u64,

    pub failover_state: FailoverState,
    pub failover_state_change_time: Option<Instant>,
    pub failover_start_time: Option<Instant>,
    /// Rate-limits new failover attempts: `now - last_failover_attempt > 2 *
    /// failover_timeout` (`spec.md` §4.6).
    pub last_failover_attempt_time: Instant,
    pub promoted_replica: Option<Address>,

    pub replicas: DashMap<Address, ReplicaRecord>,
    pub peer_sentinels: DashMap<String, PeerSentinelRecord>,
}

impl MasterRecord {
    pub fn new(config: MasterConfig, addr: Address) -> Self {
        let link = InstanceLink::new(addr.socket_addr());
        Self {
            config,
            addr,
            runid: None,
            role_reported_time: None,
            link,
            flags: InstanceFlags::empty(),
            s_down_since: None,
            slave_role_since: None,
            info_refresh: None,
            info_cache: None,
            last_hello_publish: None,
            config_epoch: 0,
            voted_leader: None,
            voted_leader_epoch: 0,
            failover_epoch: 0,
            failover_state: FailoverState::None,
            failover_state_change_time: None,
            failover_start_time: None,
            last_failover_attempt_time: Instant::now() - Duration::from_secs(3600 * 24),
            promoted_replica: None,
            replicas: DashMap::new(),
            peer_sentinels: DashMap::new(),
        }
    }

    pub fn is_down(&self) -> bool {
        self.flags
            .intersects(InstanceFlags::S_DOWN | InstanceFlags::O_DOWN)
    }

    pub fn failover_in_progress(&self) -> bool {
        self.flags.contains(InstanceFlags::FAILOVER_IN_PROGRESS)
    }

    /// Transitions the failover state machine, stamping the change time.
    pub fn set_failover_state(&mut self, state: FailoverState) {
        self.failover_state = state;
        self.failover_state_change_time = Some(Instant::now());
    }

    /// Resets all failover bookkeeping (`spec.md` §4.6 Abort / §4.8 Reset).
    pub fn reset_failover(&mut self) {
        self.flags.remove(InstanceFlags::FAILOVER_IN_PROGRESS | InstanceFlags::FORCE_FAILOVER);
        for mut r in self.replicas.iter_mut() {
            r.flags.remove(
                InstanceFlags::PROMOTED
                    | InstanceFlags::RECONF_SENT
                    | InstanceFlags::RECONF_INPROG
                    | InstanceFlags::RECONF_DONE,
            );
        }
        self.failover_state = FailoverState::None;
        self.failover_state_change_time = None;
        self.failover_start_time = None;
        self.promoted_replica = None;
    }

    /// Clears replicas (and, optionally, peer Sentinels), closes their
    /// links, and resets failover/vote state (`spec.md` §4.8 Reset).
    pub fn reset(&mut self, also_peer_sentinels: bool) {
        for entry in self.replicas.iter() {
            entry.link.close(true);
        }
        self.replicas.clear();
        if also_peer_sentinels {
            for entry in self.peer_sentinels.iter() {
                entry.link.close(true);
            }
            self.peer_sentinels.clear();
        }
        self.reset_failover();
        self.voted_leader = None;
        self.voted_leader_epoch = 0;
    }

    /// Swaps in a new master address, preserving replicas by keeping the
    /// old address as a new replica entry, per `spec.md` §4.8
    /// Reset-with-address-change.
    pub fn change_address(&mut self, new_addr: Address) {
        let old_addr = self.addr.clone();
        let old_runid = self.runid.clone();
        let preserved: Vec<Address> = self
            .replicas
            .iter()
            .map(|e| e.key().clone())
            .filter(|a| *a != new_addr)
            .collect();

        self.reset(false);
        self.addr = new_addr;
        self.link = InstanceLink::new(self.addr.socket_addr());
        self.runid = None;

        let mut old_master_replica = ReplicaRecord::new(old_addr, self.config.name.clone());
        old_master_replica.runid = old_runid;
        self.replicas.insert(old_master_replica.addr.clone(), old_master_replica);

        for addr in preserved {
            let replica = ReplicaRecord::new(addr.clone(), self.config.name.clone());
            self.replicas.insert(addr, replica);
        }
    }
}
