//! Replica Reconfiguration: bounded-parallel dispatch of "follow the new
//! master" during `RECONF_SLAVES`, plus independent drift correction
//! (`spec.md` §4.6 state 5, §4.7). Grounded in
//! `spineldb::core::warden::failover::run_post_failover_reconfiguration`'s
//! polling shape, replaced with the exact SENT/INPROG/DONE tracking and
//! per-replica timeout `spec.md` specifies (the teacher's "FAILOVER POISON"
//! step has no counterpart here and is dropped).

use crate::consts;
use crate::info::ReportedRole;
use crate::net::SentinelClient;
use crate::registry::{Address, InstanceFlags, MasterRecord};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

async fn send_replicaof(addr: std::net::SocketAddr, target: &Address, auth: Option<(&str, &str)>) -> bool {
    let Ok(mut client) = SentinelClient::connect(addr).await else {
        return false;
    };
    if let Some((user, pass)) = auth
        && client.auth(user, pass).await.is_err()
    {
        return false;
    }
    client
        .replicaof(&target.resolved_ip.to_string(), &target.port.to_string())
        .await
        .is_ok()
}

async fn check_following(addr: std::net::SocketAddr, target: &Address, auth: Option<(&str, &str)>) -> Option<(bool, bool)> {
    let Ok(mut client) = SentinelClient::connect(addr).await else {
        return None;
    };
    if let Some((user, pass)) = auth {
        client.auth(user, pass).await.ok()?;
    }
    let text = client.info("replication").await.ok()?;
    let parsed = crate::info::parse_info(&text);
    if parsed.role != Some(ReportedRole::Slave) {
        return None;
    }
    let host_matches = parsed.master_host.as_deref() == Some(&target.resolved_ip.to_string())
        && parsed.master_port == Some(target.port);
    let link_up = parsed.master_link_status_up.unwrap_or(false);
    Some((host_matches, link_up))
}

/// Advances every pending replica by at most one step. Returns `true` once
/// every non-`S_DOWN` replica (other than the promoted one) is
/// `RECONF_DONE`, signalling the driver to move to `UPDATE_CONFIG`.
pub async fn drive_reconf_slaves(master_lock: &Arc<Mutex<MasterRecord>>) -> bool {
    let (promoted, parallel_syncs, in_flight, candidates, state_since, auth) = {
        let master = master_lock.lock();
        let promoted = master.promoted_replica.clone();
        let in_flight = master
            .replicas
            .iter()
            .filter(|r| r.flags.intersects(InstanceFlags::RECONF_SENT | InstanceFlags::RECONF_INPROG))
            .count();
        let candidates: Vec<Address> = master
            .replicas
            .iter()
            .filter(|r| {
                !r.flags.contains(InstanceFlags::PROMOTED)
                    && !r.flags.contains(InstanceFlags::RECONF_DONE)
                    && !r.is_down()
            })
            .map(|r| r.addr.clone())
            .collect();
        let auth = master.config.auth().map(|(u, p)| (u.to_string(), p.to_string()));
        (promoted, master.config.parallel_syncs, in_flight, candidates, master.failover_state_change_time, auth)
    };
    let auth_ref = auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));

    let Some(promoted) = promoted else {
        return false;
    };

    let mut slots_free = parallel_syncs.saturating_sub(in_flight);

    for addr in &candidates {
        let status = {
            let master = master_lock.lock();
            master.replicas.get(addr).map(|r| r.flags)
        };
        let Some(flags) = status else { continue };

        if flags.contains(InstanceFlags::RECONF_SENT) {
            let sent_time = {
                let master = master_lock.lock();
                master.replicas.get(addr).and_then(|r| r.slave_reconf_sent_time)
            };
            if let Some(sent) = sent_time
                && sent.elapsed() > consts::SLAVE_RECONF_TIMEOUT
            {
                let mut master = master_lock.lock();
                if let Some(mut r) = master.replicas.get_mut(addr) {
                    r.flags.remove(InstanceFlags::RECONF_SENT);
                    r.flags.insert(InstanceFlags::RECONF_DONE);
                }
                warn!(replica = %addr, "+slave-reconf-done (timeout, optimistic)");
                continue;
            }
            if let Some((host_matches, _)) = check_following(addr.socket_addr(), &promoted, auth_ref).await
                && host_matches
            {
                let mut master = master_lock.lock();
                if let Some(mut r) = master.replicas.get_mut(addr) {
                    r.flags.remove(InstanceFlags::RECONF_SENT);
                    r.flags.insert(InstanceFlags::RECONF_INPROG);
                }
                info!(replica = %addr, "+slave-reconf-inprog");
            }
            continue;
        }

        if flags.contains(InstanceFlags::RECONF_INPROG) {
            if let Some((_, link_up)) = check_following(addr.socket_addr(), &promoted, auth_ref).await
                && link_up
            {
                let mut master = master_lock.lock();
                if let Some(mut r) = master.replicas.get_mut(addr) {
                    r.flags.remove(InstanceFlags::RECONF_INPROG);
                    r.flags.insert(InstanceFlags::RECONF_DONE);
                }
                info!(replica = %addr, "+slave-reconf-done");
            }
            continue;
        }

        if slots_free > 0 {
            slots_free -= 1;
            if send_replicaof(addr.socket_addr(), &promoted, auth_ref).await {
                let mut master = master_lock.lock();
                if let Some(mut r) = master.replicas.get_mut(addr) {
                    r.flags.insert(InstanceFlags::RECONF_SENT);
                    r.slave_reconf_sent_time = Some(Instant::now());
                }
                info!(replica = %addr, "+slave-reconf-sent");
            }
        }
    }

    let (all_done, overall_timed_out) = {
        let master = master_lock.lock();
        let all_done = master
            .replicas
            .iter()
            .filter(|r| !r.flags.contains(InstanceFlags::PROMOTED) && !r.is_down())
            .all(|r| r.flags.contains(InstanceFlags::RECONF_DONE));
        let overall_timed_out = state_since.map(|t| t.elapsed() > master.config.failover_timeout).unwrap_or(false);
        (all_done, overall_timed_out)
    };

    if all_done {
        return true;
    }
    if overall_timed_out {
        let mut master = master_lock.lock();
        let stragglers: Vec<Address> = master
            .replicas
            .iter()
            .filter(|r| !r.flags.contains(InstanceFlags::PROMOTED) && !r.is_down() && !r.flags.contains(InstanceFlags::RECONF_DONE))
            .map(|r| r.addr.clone())
            .collect();
        for addr in &stragglers {
            if let Some(mut r) = master.replicas.get_mut(addr) {
                r.flags.insert(InstanceFlags::RECONF_DONE);
            }
        }
        drop(master);
        for addr in stragglers {
            let target = promoted.clone();
            let auth = auth.clone();
            tokio::spawn(async move {
                let auth_ref = auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
                let _ = send_replicaof(addr.socket_addr(), &target, auth_ref).await;
            });
        }
        return true;
    }
    false
}

/// Independent drift correction (`spec.md` §4.7): a replica whose reported
/// master differs from the registry's current master, or a master that
/// reports itself as `slave`, is silently coerced back into line.
pub async fn correct_drift(master_lock: &Arc<Mutex<MasterRecord>>) {
    let (current_master, master_addr, failover_active, slave_role_since, candidates, auth) = {
        let master = master_lock.lock();
        (
            master.addr.clone(),
            master.addr.socket_addr(),
            master.failover_state != crate::registry::FailoverState::None,
            master.slave_role_since,
            master
                .replicas
                .iter()
                .filter(|r| !r.is_down())
                .map(|r| (r.addr.clone(), r.discovered_at))
                .collect::<Vec<_>>(),
            master.config.auth().map(|(u, p)| (u.to_string(), p.to_string())),
        )
    };
    if failover_active {
        return;
    }
    let auth_ref = auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));

    // The master we're monitoring has itself started reporting role:slave,
    // most likely because something outside Sentinel issued it a REPLICAOF.
    // Coerce it back to master rather than letting it keep following
    // whatever it was pointed at.
    if let Some(since) = slave_role_since
        && since.elapsed() > consts::DRIFT_CORRECTION_GRACE_PERIOD
        && let Ok(mut client) = SentinelClient::connect(master_addr).await
    {
        if let Some((user, pass)) = auth_ref
            && client.auth(user, pass).await.is_err()
        {
            return;
        }
        if client.replicaof_no_one().await.is_ok() {
            info!(master = %current_master, "+convert-to-slave (reverted unexpected role:slave)");
        }
        return;
    }
    if slave_role_since.is_some() {
        // Master's own role is unconfirmed (recently started reporting
        // slave, not yet past the grace period above) — don't point
        // replicas at it until it proves out as master again.
        return;
    }

    for (addr, discovered_at) in candidates {
        if discovered_at.elapsed() < consts::DRIFT_CORRECTION_GRACE_PERIOD {
            continue;
        }
        let Some((host_matches, _)) = check_following(addr.socket_addr(), &current_master, auth_ref).await else {
            continue;
        };
        if !host_matches && send_replicaof(addr.socket_addr(), &current_master, auth_ref).await {
            debug!(replica = %addr, "+fix-slave-config");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Address, FailoverState, MasterConfig};

    fn test_master() -> Arc<Mutex<MasterRecord>> {
        let config = MasterConfig {
            name: "m".into(),
            quorum: 1,
            down_after: std::time::Duration::from_secs(30),
            failover_timeout: std::time::Duration::from_secs(180),
            parallel_syncs: 1,
            auth_user: None,
            auth_pass: None,
            notification_script: None,
            client_reconfig_script: None,
            rename_command: Default::default(),
        };
        Arc::new(Mutex::new(MasterRecord::new(config, Address::new("m", "127.0.0.1".parse().unwrap(), 6379))))
    }

    #[tokio::test]
    async fn no_promoted_replica_yet_reports_not_done() {
        let master_lock = test_master();
        assert!(!drive_reconf_slaves(&master_lock).await);
    }

    #[tokio::test]
    async fn no_candidate_replicas_is_immediately_done() {
        let master_lock = test_master();
        master_lock.lock().promoted_replica = Some(Address::new("new-master", "127.0.0.1".parse().unwrap(), 6380));
        assert!(drive_reconf_slaves(&master_lock).await);
    }

    #[tokio::test]
    async fn drift_correction_is_suppressed_during_an_active_failover() {
        let master_lock = test_master();
        master_lock.lock().set_failover_state(FailoverState::SelectSlave);
        correct_drift(&master_lock).await;
        assert_eq!(master_lock.lock().failover_state, FailoverState::SelectSlave);
    }
}
