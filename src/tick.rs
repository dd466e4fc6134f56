//! The per-master control loop: Prober, then Down Detector, then
//! election-help, then the Failover Driver, once per tick (`spec.md` §2).
//! Grounded in `prober_ref.rs`'s `MasterMonitor::run`/`run_tick_loop`
//! sub-task split, collapsed from that file's three `JoinSet` sub-tasks
//! (tick/info/pubsub timers) into a single timer loop plus one spawned
//! pub/sub task per link, since `InstanceLink::ensure_connected` already
//! owns that connection's lifecycle.

use crate::gossip;
use crate::info::ReportedRole;
use crate::registry::{Address, GlobalState, InstanceFlags, ReplicaRecord};
use crate::scripts::ScriptQueue;
use crate::{consts, down, failover, prober, reconfig, tilt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

fn hello_callback(global: Arc<GlobalState>, scripts: Arc<ScriptQueue>) -> Arc<dyn Fn(String) + Send + Sync> {
    Arc::new(move |payload: String| {
        gossip::process_hello(&global, &scripts, &payload);
    })
}

/// Publishes `payload` on `link` if `last_publish` is stale by
/// `consts::PUBLISH_PERIOD`, gating every connection a Sentinel gossips
/// over (master, replica, and peer alike — `spec.md` §4.3) the same way.
/// Returns the new publish time to store if a publish was attempted and
/// succeeded; `None` means the caller's stored timestamp is unchanged.
async fn maybe_publish_hello(link: &Arc<crate::registry::InstanceLink>, payload: &str, last_publish: Option<Instant>) -> Option<Instant> {
    let due = last_publish.map(|t| t.elapsed() > consts::PUBLISH_PERIOD).unwrap_or(true);
    if due && prober::publish_hello(link, payload).await {
        Some(Instant::now())
    } else {
        None
    }
}

/// Runs the control loop for one monitored master for as long as it stays
/// in the registry. Returns once the master has been removed.
pub async fn run(name: String, global: Arc<GlobalState>, scripts: Arc<ScriptQueue>) {
    let mut interval = tokio::time::interval(consts::PING_PERIOD);
    loop {
        interval.tick().await;
        let Some(master_lock) = global.get_master(&name) else {
            info!(master = %name, "master removed, stopping control loop");
            return;
        };
        run_once(&name, &master_lock, &global, &scripts).await;
    }
}

async fn run_once(
    name: &str,
    master_lock: &Arc<Mutex<crate::registry::MasterRecord>>,
    global: &Arc<GlobalState>,
    scripts: &Arc<ScriptQueue>,
) {
    tilt::check(global, Instant::now(), std::time::SystemTime::now());

    probe_master(name, master_lock, global, scripts).await;
    probe_replicas(name, master_lock, global, scripts).await;
    probe_peer_sentinels(name, master_lock, global, scripts).await;

    let is_down = {
        let mut master = master_lock.lock();
        down::evaluate_master_sdown(&mut master, Instant::now());
        down::clear_stale_master_down(&mut master, Instant::now());
        down::evaluate_odown(&mut master);
        master.flags.contains(InstanceFlags::S_DOWN)
    };

    if is_down {
        let (current_epoch, myid) = (global.current_epoch(), global.myid.clone());
        down::ask_peers_is_master_down(master_lock, current_epoch, &myid).await;
    }

    if global.is_tilting() {
        return;
    }

    reconfig::correct_drift(master_lock).await;
    failover::step(master_lock.clone(), global.clone(), scripts.clone()).await;
}

/// Connects, pings, and refreshes `INFO` for the master itself, discovering
/// replicas from its `slaveN:` advertisements (`spec.md` §4.2).
async fn probe_master(
    name: &str,
    master_lock: &Arc<Mutex<crate::registry::MasterRecord>>,
    global: &Arc<GlobalState>,
    scripts: &Arc<ScriptQueue>,
) {
    let (link, auth, down_after, info_refresh, master_healthy) = {
        let master = master_lock.lock();
        (
            master.link.clone(),
            master.config.auth().map(|(u, p)| (u.to_string(), p.to_string())),
            master.config.down_after,
            master.info_refresh,
            !master.flags.contains(InstanceFlags::S_DOWN),
        )
    };
    let auth_ref = auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));

    if prober::is_backpressured(&link) {
        debug!(master = name, "skipping probe this tick, link is backpressured");
        return;
    }

    let client_name = format!("sentinel-{name}-master");
    prober::ensure_connected(&link, &client_name, auth_ref, true, hello_callback(global.clone(), scripts.clone())).await;

    let (last_pong, last_ping) = {
        let l = link.lock();
        (l.last_pong_time, l.last_ping_time)
    };
    prober::maybe_ping(&link, last_pong, last_ping, down_after).await;

    if prober::info_due(info_refresh, !master_healthy)
        && let Some((parsed, raw)) = prober::fetch_info(&link, "replication").await
    {
        let mut master = master_lock.lock();
        master.info_refresh = Some(Instant::now());
        master.info_cache = Some(raw);
        if let Some(run_id) = parsed.run_id {
            master.runid = Some(run_id);
        }
        if parsed.role == Some(ReportedRole::Slave) {
            if master.slave_role_since.is_none() {
                master.slave_role_since = Some(Instant::now());
            }
        } else {
            master.slave_role_since = None;
        }

        for advertisement in parsed.replicas {
            let Ok(ip) = advertisement.ip.parse() else { continue };
            let addr = Address::new(advertisement.ip.clone(), ip, advertisement.port);
            if !master.replicas.contains_key(&addr) {
                info!(master = name, replica = %addr, "discovered new replica via master INFO");
                master.replicas.insert(addr.clone(), ReplicaRecord::new(addr, name.to_string()));
            }
        }
    }

    if let (Some(ip), Some(port)) = (global.announce.ip.as_deref().and_then(|s| s.parse().ok()), global.announce.port) {
        let (master_addr, config_epoch, last_publish) = {
            let master = master_lock.lock();
            (master.addr.clone(), master.config_epoch, master.last_hello_publish)
        };
        let payload = gossip::build_payload(global, ip, port, name, &master_addr, config_epoch);
        if let Some(new_publish) = maybe_publish_hello(&link, &payload, last_publish).await {
            master_lock.lock().last_hello_publish = Some(new_publish);
        }
    }
}

async fn probe_replicas(
    name: &str,
    master_lock: &Arc<Mutex<crate::registry::MasterRecord>>,
    global: &Arc<GlobalState>,
    scripts: &Arc<ScriptQueue>,
) {
    let addrs: Vec<Address> = master_lock.lock().replicas.iter().map(|r| r.addr.clone()).collect();
    let (auth, down_after, master_healthy) = {
        let master = master_lock.lock();
        (
            master.config.auth().map(|(u, p)| (u.to_string(), p.to_string())),
            master.config.down_after,
            !master.flags.contains(InstanceFlags::S_DOWN),
        )
    };
    let auth_ref = auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));

    for addr in addrs {
        let link = {
            let master = master_lock.lock();
            master.replicas.get(&addr).map(|r| r.link.clone())
        };
        let Some(link) = link else { continue };
        if prober::is_backpressured(&link) {
            debug!(master = name, replica = %addr, "skipping probe this tick, link is backpressured");
            continue;
        }

        let client_name = format!("sentinel-{name}-replica-{addr}");
        prober::ensure_connected(&link, &client_name, auth_ref, false, hello_callback(global.clone(), scripts.clone())).await;

        let (last_pong, last_ping) = {
            let l = link.lock();
            (l.last_pong_time, l.last_ping_time)
        };
        prober::maybe_ping(&link, last_pong, last_ping, down_after).await;

        let info_refresh = master_lock.lock().replicas.get(&addr).and_then(|r| r.info_refresh);
        if prober::info_due(info_refresh, !master_healthy)
            && let Some((parsed, raw)) = prober::fetch_info(&link, "replication").await
        {
            let mut master = master_lock.lock();
            if let Some(mut replica) = master.replicas.get_mut(&addr) {
                replica.info_refresh = Some(Instant::now());
                replica.info_cache = Some(raw);
                replica.runid = parsed.run_id.or(replica.runid.clone());
                replica.role_reported = match parsed.role {
                    Some(ReportedRole::Master) => crate::registry::replica::ReportedRole::Master,
                    Some(ReportedRole::Slave) => crate::registry::replica::ReportedRole::Slave,
                    None => crate::registry::replica::ReportedRole::Unknown,
                };
                replica.master_host = parsed.master_host;
                replica.master_port = parsed.master_port;
                let link_up = parsed.master_link_status_up.unwrap_or(false);
                let was_up = replica.link_status == crate::registry::MasterLinkStatus::Up;
                replica.link_status = if link_up {
                    crate::registry::MasterLinkStatus::Up
                } else {
                    crate::registry::MasterLinkStatus::Down
                };
                if !link_up && was_up {
                    replica.master_link_down_time = Some(Instant::now());
                } else if link_up {
                    replica.master_link_down_time = None;
                }
                if let Some(priority) = parsed.slave_priority {
                    replica.slave_priority = priority;
                }
                if let Some(offset) = parsed.slave_repl_offset {
                    replica.repl_offset = offset;
                }
                if let Some(announced) = parsed.replica_announced {
                    replica.replica_announced = announced;
                }
            }
            if let Some(mut replica) = master.replicas.get_mut(&addr) {
                down::evaluate_replica_sdown(&mut replica, down_after, Instant::now());
            }
        }

        if let (Some(ip), Some(port)) = (global.announce.ip.as_deref().and_then(|s| s.parse().ok()), global.announce.port) {
            let (master_addr, config_epoch, last_publish) = {
                let master = master_lock.lock();
                let last_publish = master.replicas.get(&addr).and_then(|r| r.last_hello_publish);
                (master.addr.clone(), master.config_epoch, last_publish)
            };
            let payload = gossip::build_payload(global, ip, port, name, &master_addr, config_epoch);
            if let Some(new_publish) = maybe_publish_hello(&link, &payload, last_publish).await
                && let Some(mut replica) = master_lock.lock().replicas.get_mut(&addr)
            {
                replica.last_hello_publish = Some(new_publish);
            }
        }
    }
}

async fn probe_peer_sentinels(
    name: &str,
    master_lock: &Arc<Mutex<crate::registry::MasterRecord>>,
    global: &Arc<GlobalState>,
    scripts: &Arc<ScriptQueue>,
) {
    let runids: Vec<String> = master_lock.lock().peer_sentinels.iter().map(|p| p.runid.clone()).collect();
    for runid in runids {
        let link = {
            let master = master_lock.lock();
            master.peer_sentinels.get(&runid).map(|p| p.link.clone())
        };
        let Some(link) = link else { continue };
        if prober::is_backpressured(&link) {
            debug!(peer = %runid, "skipping probe this tick, link is backpressured");
            continue;
        }
        let client_name = format!("sentinel-peer-{runid}");
        prober::ensure_connected(&link, &client_name, None, false, hello_callback(global.clone(), scripts.clone())).await;
        debug!(peer = %runid, "peer sentinel link checked");

        if let (Some(ip), Some(port)) = (global.announce.ip.as_deref().and_then(|s| s.parse().ok()), global.announce.port) {
            let (master_addr, config_epoch, last_publish) = {
                let master = master_lock.lock();
                let last_publish = master.peer_sentinels.get(&runid).and_then(|p| p.last_hello_publish);
                (master.addr.clone(), master.config_epoch, last_publish)
            };
            let payload = gossip::build_payload(global, ip, port, name, &master_addr, config_epoch);
            if let Some(new_publish) = maybe_publish_hello(&link, &payload, last_publish).await
                && let Some(mut peer) = master_lock.lock().peer_sentinels.get_mut(&runid)
            {
                peer.last_hello_publish = Some(new_publish);
            }
        }
    }
}
