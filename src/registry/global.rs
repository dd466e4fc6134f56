//! `GlobalState`: the Sentinel singleton (`myid`, `current_epoch`, the
//! masters map, TILT fields, announce overrides) passed explicitly to every
//! component rather than hidden behind a process-wide global, per
//! `spec.md` §9's "Global mutable state" design note.

use super::link::InstanceLink;
use super::master::MasterRecord;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct AnnounceOverrides {
    pub ip: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug)]
pub struct GlobalState {
    pub myid: String,
    pub masters: DashMap<String, Arc<Mutex<MasterRecord>>>,

    current_epoch: Mutex<u64>,

    pub tilt: AtomicBool,
    tilt_start_time: Mutex<Option<Instant>>,
    pub previous_tick_time: Mutex<Option<Instant>>,
    /// Wall-clock reading at the previous tick, for detecting a backward
    /// jump `Instant` structurally can't see (monotonic by definition).
    pub previous_wall_clock: Mutex<Option<SystemTime>>,

    pub announce: AnnounceOverrides,
    pub sentinel_user: Option<String>,
    pub sentinel_pass: Option<String>,
    pub resolve_hostnames: bool,
    pub announce_hostnames: bool,
    pub deny_scripts_reconfig: bool,

    pub state_file_path: PathBuf,

    /// Notifies the supervisor loop in `lib.rs` that a master was just added
    /// to `masters` and needs its own control loop spawned. `SENTINEL
    /// MONITOR` sends on this after inserting; nothing else should.
    pub monitor_tx: mpsc::UnboundedSender<String>,
    monitor_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl GlobalState {
    pub fn new(myid: String, state_file_path: PathBuf) -> Self {
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        Self {
            myid,
            masters: DashMap::new(),
            current_epoch: Mutex::new(0),
            tilt: AtomicBool::new(false),
            tilt_start_time: Mutex::new(None),
            previous_tick_time: Mutex::new(None),
            previous_wall_clock: Mutex::new(None),
            announce: AnnounceOverrides { ip: None, port: None },
            sentinel_user: None,
            sentinel_pass: None,
            resolve_hostnames: false,
            announce_hostnames: false,
            deny_scripts_reconfig: false,
            state_file_path,
            monitor_tx,
            monitor_rx: Mutex::new(Some(monitor_rx)),
        }
    }

    /// Takes the receive side of the runtime-monitor channel. Only the
    /// supervisor loop in `lib.rs` should call this, once, at startup;
    /// returns `None` if it already has been.
    pub fn take_monitor_rx(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.monitor_rx.lock().take()
    }

    pub fn current_epoch(&self) -> u64 {
        *self.current_epoch.lock()
    }

    /// Adopts `epoch` as `current_epoch` if it is strictly higher (Invariant
    /// 3). Returns whether an adoption happened; the caller is responsible
    /// for persisting before the new epoch is observable externally.
    pub fn adopt_epoch(&self, epoch: u64) -> bool {
        let mut current = self.current_epoch.lock();
        if epoch > *current {
            *current = epoch;
            true
        } else {
            false
        }
    }

    /// Bumps `current_epoch` by one and returns the new value, for starting
    /// a fresh failover attempt.
    pub fn bump_epoch(&self) -> u64 {
        let mut current = self.current_epoch.lock();
        *current += 1;
        *current
    }

    pub fn is_tilting(&self) -> bool {
        self.tilt.load(Ordering::Acquire)
    }

    pub fn enter_tilt(&self) {
        self.tilt.store(true, Ordering::Release);
        *self.tilt_start_time.lock() = Some(Instant::now());
    }

    pub fn exit_tilt(&self) {
        self.tilt.store(false, Ordering::Release);
        *self.tilt_start_time.lock() = None;
    }

    pub fn tilt_elapsed(&self) -> Option<std::time::Duration> {
        self.tilt_start_time.lock().map(|t| t.elapsed())
    }

    pub fn get_master(&self, name: &str) -> Option<Arc<Mutex<MasterRecord>>> {
        self.masters.get(name).map(|e| e.value().clone())
    }

    /// Finds an existing `InstanceLink` for peer Sentinel `runid` on any
    /// master other than `exclude_master`, so every master's record of the
    /// same physical peer shares one link `Arc` instead of opening a
    /// redundant connection to it (`spec.md` Design Note "shared mutable
    /// link"). Falls back to a fresh, unshared link if none is found.
    pub fn share_or_new_link(&self, runid: &str, addr: SocketAddr, exclude_master: &str) -> Arc<InstanceLink> {
        for entry in self.masters.iter() {
            if entry.key() == exclude_master {
                continue;
            }
            if let Some(peer) = entry.value().lock().peer_sentinels.get(runid) {
                return peer.link.clone();
            }
        }
        InstanceLink::new(addr)
    }
}
