//! Failover Driver: the six-state machine that promotes a replica once a
//! master is `O_DOWN` (`spec.md` §4.6). Grounded in the overall shape of
//! `failover_ref.rs`'s `start_failover`/`select_best_replica`/
//! `wait_for_promotion`/post-failover reconfiguration sequence, rewritten
//! around the spec's own six named states (`WAIT_START` through
//! `UPDATE_CONFIG`) rather than the teacher's collapsed five-state enum, and
//! without the teacher's `FAILOVER POISON` admin command, which has no
//! counterpart here.

use crate::election;
use crate::info::{ReportedRole, parse_info};
use crate::net::SentinelClient;
use crate::reconfig;
use crate::registry::{Address, FailoverState, GlobalState, InstanceFlags, MasterRecord};
use crate::scripts::ScriptQueue;
use crate::{consts, persist};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Starts a new attempt if `O_DOWN` holds, none is in progress, and the
/// rate limit (`2 * failover_timeout` since the last attempt) has elapsed.
pub fn maybe_trigger(master: &mut MasterRecord, global: &GlobalState) {
    if !master.flags.contains(InstanceFlags::O_DOWN) || master.failover_in_progress() {
        return;
    }
    if master.last_failover_attempt_time.elapsed() <= master.config.failover_timeout * 2 {
        return;
    }
    let epoch = global.bump_epoch();
    master.failover_epoch = epoch;
    master.flags.insert(InstanceFlags::FAILOVER_IN_PROGRESS);
    master.failover_start_time = Some(Instant::now());
    master.last_failover_attempt_time = Instant::now();
    master.set_failover_state(FailoverState::WaitStart);
    warn!(master = %master.config.name, epoch, "+new-epoch");
}

/// `SENTINEL FAILOVER <name>`: force a failover regardless of `O_DOWN`, by
/// setting `FORCE_FAILOVER` so `WAIT_START` bypasses the leader check.
pub fn force_trigger(master: &mut MasterRecord, global: &GlobalState) -> Result<(), &'static str> {
    if master.failover_in_progress() {
        return Err("-INPROG failover already in progress");
    }
    let epoch = global.bump_epoch();
    master.failover_epoch = epoch;
    master.flags.insert(InstanceFlags::FAILOVER_IN_PROGRESS | InstanceFlags::FORCE_FAILOVER);
    master.failover_start_time = Some(Instant::now());
    master.last_failover_attempt_time = Instant::now();
    master.set_failover_state(FailoverState::WaitStart);
    warn!(master = %master.config.name, epoch, "+new-epoch (forced)");
    Ok(())
}

fn abort(master: &mut MasterRecord, reason: &str) {
    warn!(master = %master.config.name, reason, "failover aborted");
    master.reset_failover();
}

fn state_elapsed(master: &MasterRecord) -> std::time::Duration {
    master.failover_state_change_time.map(|t| t.elapsed()).unwrap_or_default()
}

fn wait_start(master: &mut MasterRecord, global: &GlobalState) {
    let forced = master.flags.contains(InstanceFlags::FORCE_FAILOVER);
    let is_leader = forced || election::try_elect_leader(master, global).as_deref() == Some(global.myid.as_str());

    if is_leader {
        master.set_failover_state(FailoverState::SelectSlave);
        return;
    }

    let timeout = consts::ELECTION_TIMEOUT.min(master.config.failover_timeout);
    if state_elapsed(master) > timeout {
        abort(master, "no leader elected before election timeout");
    }
}

/// `spec.md` §4.6 SELECT_SLAVE: excludes any replica that is down, silent,
/// stale, or priority-zero, then sorts survivors by (priority asc, offset
/// desc, runid asc — nil runids last).
fn select_best_replica(master: &MasterRecord) -> Option<Address> {
    let now = Instant::now();
    let master_healthy = !master.flags.contains(InstanceFlags::S_DOWN);
    let info_staleness_bound = if master_healthy {
        consts::INFO_PERIOD * 3
    } else {
        consts::PING_PERIOD * 5
    };
    let link_down_bound = master
        .s_down_since
        .map(|since| now.duration_since(since) + master.config.down_after * 10)
        .unwrap_or(master.config.down_after * 10);

    let mut candidates: Vec<(Address, u16, u64, Option<String>)> = master
        .replicas
        .iter()
        .filter(|r| {
            if r.is_down() || r.slave_priority == 0 {
                return false;
            }
            let link = r.link.lock();
            if link.disconnected {
                return false;
            }
            let silent = link
                .last_pong_time
                .map(|t| now.duration_since(t) > consts::PING_PERIOD * 5)
                .unwrap_or(true);
            if silent {
                return false;
            }
            drop(link);
            let stale = r.info_refresh.map(|t| now.duration_since(t) > info_staleness_bound).unwrap_or(true);
            if stale {
                return false;
            }
            if let Some(down_since) = r.master_link_down_time
                && now.duration_since(down_since) > link_down_bound
            {
                return false;
            }
            true
        })
        .map(|r| (r.addr.clone(), r.slave_priority, r.repl_offset, r.runid.clone()))
        .collect();

    candidates.sort_by(|a, b| {
        a.1.cmp(&b.1)
            .then(b.2.cmp(&a.2))
            .then_with(|| match (&a.3, &b.3) {
                (Some(x), Some(y)) => x.cmp(y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
    });

    candidates.into_iter().next().map(|(addr, ..)| addr)
}

fn select_slave(master: &mut MasterRecord) {
    match select_best_replica(master) {
        Some(addr) => {
            master.promoted_replica = Some(addr);
            master.set_failover_state(FailoverState::SendSlaveofNoOne);
        }
        None => abort(master, "no eligible replica to promote"),
    }
}

async fn send_slaveof_no_one(master_lock: &Arc<Mutex<MasterRecord>>) {
    let (candidate, started, timeout, auth) = {
        let master = master_lock.lock();
        (
            master.promoted_replica.clone(),
            master.failover_start_time,
            master.config.failover_timeout,
            master.config.auth().map(|(u, p)| (u.to_string(), p.to_string())),
        )
    };
    let Some(candidate) = candidate else {
        master_lock.lock().reset_failover();
        return;
    };
    let auth_ref = auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));

    let mut promoted = SentinelClient::connect(candidate.socket_addr()).await.ok();
    if let Some(client) = promoted.as_mut()
        && let Some((user, pass)) = auth_ref
        && client.auth(user, pass).await.is_err()
    {
        promoted = None;
    }
    let succeeded = match promoted {
        Some(mut client) => {
            client.replicaof_no_one().await.is_ok()
                && client.config_rewrite().await.is_ok()
                && client.client_kill_type("normal").await.is_ok()
                && client.client_kill_type("pubsub").await.is_ok()
        }
        None => false,
    };

    let mut master = master_lock.lock();
    if succeeded {
        if let Some(mut replica) = master.replicas.get_mut(&candidate) {
            replica.flags.insert(InstanceFlags::PROMOTED);
        }
        master.set_failover_state(FailoverState::WaitPromotion);
        info!(master = %master.config.name, replica = %candidate, "promotion command sent");
        return;
    }

    if started.map(|t| t.elapsed() > timeout).unwrap_or(true) {
        abort(&mut master, "could not reach promotion candidate before failover_timeout");
    }
}

async fn wait_promotion(master_lock: &Arc<Mutex<MasterRecord>>, global: &GlobalState, scripts: &Arc<ScriptQueue>) {
    let (candidate, started, timeout, auth) = {
        let master = master_lock.lock();
        (
            master.promoted_replica.clone(),
            master.failover_start_time,
            master.config.failover_timeout,
            master.config.auth().map(|(u, p)| (u.to_string(), p.to_string())),
        )
    };
    let Some(candidate) = candidate else {
        master_lock.lock().reset_failover();
        return;
    };
    let auth_ref = auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));

    let observed_master = match SentinelClient::connect(candidate.socket_addr()).await {
        Ok(mut client) => {
            let authed = match auth_ref {
                Some((user, pass)) => client.auth(user, pass).await.is_ok(),
                None => true,
            };
            if authed {
                client
                    .info("replication")
                    .await
                    .map(|text| parse_info(&text).role == Some(ReportedRole::Master))
                    .unwrap_or(false)
            } else {
                false
            }
        }
        Err(_) => false,
    };

    if observed_master {
        let mut master = master_lock.lock();
        master.config_epoch = master.failover_epoch;
        master.set_failover_state(FailoverState::ReconfSlaves);
        info!(master = %master.config.name, replica = %candidate, "+promoted-slave");

        if let Some(script) = master.config.client_reconfig_script.clone() {
            scripts.enqueue_client_reconfig(
                &script,
                &master.config.name,
                "leader",
                "start",
                &master.addr.resolved_ip.to_string(),
                master.addr.port,
                &candidate.resolved_ip.to_string(),
                candidate.port,
            );
        }
        return;
    }

    if started.map(|t| t.elapsed() > timeout).unwrap_or(false) {
        warn!(master = %master_lock.lock().config.name, "promotion not observed within failover_timeout, continuing to wait (aborts are disallowed past WAIT_PROMOTION)");
    }
}

async fn update_config(master_lock: &Arc<Mutex<MasterRecord>>, global: &GlobalState) {
    let promoted = master_lock.lock().promoted_replica.clone();
    let Some(promoted) = promoted else {
        master_lock.lock().reset_failover();
        return;
    };

    let mut master = master_lock.lock();
    let old_addr = master.addr.clone();
    master.change_address(promoted.clone());
    info!(master = %master.config.name, from = %old_addr, to = %promoted, "+switch-master");
    drop(master);
    let _ = persist::rewrite(global);
}

/// Advances the failover state machine for one master by at most one step.
/// Called once per tick from the per-master control loop, after TILT is
/// checked (TILT suppresses this entirely).
pub async fn step(master_lock: Arc<Mutex<MasterRecord>>, global: Arc<GlobalState>, scripts: Arc<ScriptQueue>) {
    if global.is_tilting() {
        return;
    }

    {
        let mut master = master_lock.lock();
        maybe_trigger(&mut master, &global);
    }

    let state = master_lock.lock().failover_state;
    match state {
        FailoverState::None => {}
        FailoverState::WaitStart => {
            let mut master = master_lock.lock();
            wait_start(&mut master, &global);
        }
        FailoverState::SelectSlave => {
            let mut master = master_lock.lock();
            select_slave(&mut master);
        }
        FailoverState::SendSlaveofNoOne => send_slaveof_no_one(&master_lock).await,
        FailoverState::WaitPromotion => wait_promotion(&master_lock, &global, &scripts).await,
        FailoverState::ReconfSlaves => {
            if reconfig::drive_reconf_slaves(&master_lock).await {
                master_lock.lock().set_failover_state(FailoverState::UpdateConfig);
            }
        }
        FailoverState::UpdateConfig => update_config(&master_lock, &global).await,
    }
}
