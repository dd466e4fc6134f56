//! Subjective/objective down detection (`spec.md` §4.4). Grounded in the
//! shape of `spineldb::core::warden::worker::check_master_down` /
//! `check_replicas_down`, replaced with the spec's exact unresponsive-time
//! computation and the `is-master-down-by-addr` peer exchange.

use crate::consts;
use crate::net::SentinelClient;
use crate::protocol::RespFrame;
use crate::registry::{InstanceFlags, MasterRecord};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How long this instance has been unresponsive: the outstanding-ping time
/// if a ping is in flight, else the time since the link last became
/// available (`spec.md` §4.4).
fn unresponsive_for(link: &crate::registry::link::LinkState, now: Instant) -> Option<Duration> {
    if let Some(act_ping) = link.act_ping_time {
        return Some(now.duration_since(act_ping));
    }
    link.last_avail_time.map(|t| now.duration_since(t))
}

/// Re-evaluates `S_DOWN` on a master, including the role-downgrade rule.
/// Returns `true` if the flag changed (for `+sdown`/`-sdown` events).
pub fn evaluate_master_sdown(master: &mut MasterRecord, now: Instant) -> bool {
    let was_down = master.flags.contains(InstanceFlags::S_DOWN);

    let link_down = {
        let link = master.link.lock();
        unresponsive_for(&link, now)
            .map(|d| d > master.config.down_after)
            .unwrap_or(false)
    };

    let role_downgraded = master
        .slave_role_since
        .map(|since| now.duration_since(since) > master.config.down_after + consts::INFO_PERIOD * 2)
        .unwrap_or(false);

    let should_be_down = link_down || role_downgraded;

    if should_be_down && !was_down {
        master.flags.insert(InstanceFlags::S_DOWN);
        master.s_down_since = Some(now);
        warn!(master = %master.config.name, "+sdown");
        true
    } else if !should_be_down && was_down {
        master.flags.remove(InstanceFlags::S_DOWN | InstanceFlags::O_DOWN);
        master.s_down_since = None;
        info!(master = %master.config.name, "-sdown");
        true
    } else {
        false
    }
}

/// Re-evaluates `S_DOWN` on a replica using only the unresponsive-time rule.
pub fn evaluate_replica_sdown(
    replica: &mut crate::registry::ReplicaRecord,
    down_after: Duration,
    now: Instant,
) -> bool {
    let was_down = replica.flags.contains(InstanceFlags::S_DOWN);
    let should_be_down = {
        let link = replica.link.lock();
        unresponsive_for(&link, now).map(|d| d > down_after).unwrap_or(false)
    };
    if should_be_down && !was_down {
        replica.flags.insert(InstanceFlags::S_DOWN);
        true
    } else if !should_be_down && was_down {
        replica.flags.remove(InstanceFlags::S_DOWN | InstanceFlags::O_DOWN);
        false
    } else {
        was_down
    }
}

/// Counts peers (including self) currently believed to agree the master is
/// down, for the O_DOWN quorum check (Quorum-safety testable property).
pub fn count_master_down(master: &MasterRecord) -> usize {
    let self_count = usize::from(master.flags.contains(InstanceFlags::S_DOWN));
    let peer_count = master
        .peer_sentinels
        .iter()
        .filter(|p| p.flags.contains(InstanceFlags::MASTER_DOWN))
        .count();
    self_count + peer_count
}

/// Re-evaluates `O_DOWN` from the current `MASTER_DOWN` tally. Returns
/// `true` if the flag changed (for `+odown`/`-odown` events).
pub fn evaluate_odown(master: &mut MasterRecord) -> bool {
    if !master.flags.contains(InstanceFlags::S_DOWN) {
        return false;
    }
    let was_odown = master.flags.contains(InstanceFlags::O_DOWN);
    let concurring = count_master_down(master);
    let should_be_odown = concurring >= master.config.quorum;

    if should_be_odown && !was_odown {
        master.flags.insert(InstanceFlags::O_DOWN);
        warn!(master = %master.config.name, concurring, quorum = master.config.quorum, "+odown");
        true
    } else if !should_be_odown && was_odown {
        master.flags.remove(InstanceFlags::O_DOWN);
        info!(master = %master.config.name, "-odown");
        true
    } else {
        false
    }
}

/// Sends `SENTINEL IS-MASTER-DOWN-BY-ADDR` to every peer Sentinel watching
/// this master, updating `MASTER_DOWN` and the peer's reported vote from the
/// three-element reply (`spec.md` §4.4).
///
/// Takes the master's lock rather than `&MasterRecord` so the critical
/// section for each peer round-trip stays a brief lock/unlock pair instead
/// of holding the lock across the network `.await` (`spec.md` §5's
/// single-threaded-cooperative atomicity, realized per DESIGN.md's
/// concurrency-model decision).
pub async fn ask_peers_is_master_down(master_lock: &Arc<parking_lot::Mutex<MasterRecord>>, current_epoch: u64, vote_runid: &str) {
    let (master_addr, peer_addrs, auth) = {
        let master = master_lock.lock();
        let peer_addrs: Vec<(String, std::net::SocketAddr)> = master
            .peer_sentinels
            .iter()
            .map(|e| (e.runid.clone(), e.addr.socket_addr()))
            .collect();
        let auth = master.config.auth().map(|(u, p)| (u.to_string(), p.to_string()));
        (master.addr.clone(), peer_addrs, auth)
    };
    let auth_ref = auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));

    for (runid, addr) in peer_addrs {
        let Ok(mut client) = SentinelClient::connect(addr).await else {
            continue;
        };
        if let Some((user, pass)) = auth_ref
            && client.auth(user, pass).await.is_err()
        {
            continue;
        }
        let frame = RespFrame::array_of_bulks([
            "SENTINEL",
            "IS-MASTER-DOWN-BY-ADDR",
            &master_addr.resolved_ip.to_string(),
            &master_addr.port.to_string(),
            &current_epoch.to_string(),
            vote_runid,
        ]);
        let Ok(RespFrame::Array(parts)) = client.send_and_receive(frame).await else {
            continue;
        };
        if parts.len() != 3 {
            continue;
        }
        let down = matches!(&parts[0], RespFrame::Integer(1));
        let leader_runid = parts[1].as_str_lossy().map(|c| c.into_owned());
        let leader_epoch = match &parts[2] {
            RespFrame::Integer(n) => *n as u64,
            RespFrame::BulkString(b) => String::from_utf8_lossy(b).parse().unwrap_or(0),
            _ => 0,
        };

        let master = master_lock.lock();
        if let Some(mut peer) = master.peer_sentinels.get_mut(&runid) {
            if down {
                peer.flags.insert(InstanceFlags::MASTER_DOWN);
                peer.last_master_down_reply_time = Some(Instant::now());
            }
            if let Some(leader) = leader_runid
                && leader != "*"
            {
                peer.leader = Some(leader);
                peer.leader_epoch = leader_epoch;
            }
        }
    }
}

/// Clears a peer's `MASTER_DOWN` flag once its last reply is stale
/// (`spec.md` §4.4: older than 5x the ask period).
pub fn clear_stale_master_down(master: &mut MasterRecord, now: Instant) {
    for mut peer in master.peer_sentinels.iter_mut() {
        if peer.flags.contains(InstanceFlags::MASTER_DOWN) && peer.master_down_reply_is_stale(now, consts::ASK_PERIOD) {
            peer.flags.remove(InstanceFlags::MASTER_DOWN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Address, InstanceLink, MasterConfig, PeerSentinelRecord};

    fn test_master(quorum: usize) -> MasterRecord {
        let config = MasterConfig {
            name: "m".into(),
            quorum,
            down_after: Duration::from_millis(100),
            failover_timeout: Duration::from_secs(180),
            parallel_syncs: 1,
            auth_user: None,
            auth_pass: None,
            notification_script: None,
            client_reconfig_script: None,
            rename_command: Default::default(),
        };
        MasterRecord::new(config, Address::new("m", "127.0.0.1".parse().unwrap(), 6379))
    }

    fn test_peer(runid: &str) -> PeerSentinelRecord {
        let link = InstanceLink::new("127.0.0.1:1".parse().unwrap());
        PeerSentinelRecord::new(runid.to_string(), Address::new("p", "127.0.0.1".parse().unwrap(), 1), "m", link)
    }

    #[test]
    fn fresh_link_never_flips_to_sdown() {
        let mut master = test_master(1);
        assert!(!evaluate_master_sdown(&mut master, Instant::now()));
        assert!(!master.flags.contains(InstanceFlags::S_DOWN));
    }

    #[test]
    fn stuck_outstanding_ping_past_down_after_flips_to_sdown() {
        let mut master = test_master(1);
        master.link.lock().act_ping_time = Some(Instant::now() - Duration::from_millis(200));
        assert!(evaluate_master_sdown(&mut master, Instant::now()));
        assert!(master.flags.contains(InstanceFlags::S_DOWN));
    }

    #[test]
    fn odown_requires_quorum_of_concurring_peers() {
        let mut master = test_master(2);
        master.flags.insert(InstanceFlags::S_DOWN);
        assert!(!evaluate_odown(&mut master));
        assert!(!master.flags.contains(InstanceFlags::O_DOWN));

        let mut peer = test_peer("peer-1");
        peer.flags.insert(InstanceFlags::MASTER_DOWN);
        master.peer_sentinels.insert(peer.runid.clone(), peer);

        assert_eq!(count_master_down(&master), 2);
        assert!(evaluate_odown(&mut master));
        assert!(master.flags.contains(InstanceFlags::O_DOWN));
    }

    #[test]
    fn odown_clears_once_sdown_clears() {
        let mut master = test_master(1);
        master.flags.insert(InstanceFlags::S_DOWN | InstanceFlags::O_DOWN);
        master.flags.remove(InstanceFlags::S_DOWN);
        assert!(evaluate_odown(&mut master));
        assert!(!master.flags.contains(InstanceFlags::O_DOWN));
    }

    #[test]
    fn stale_master_down_reply_is_cleared() {
        let mut master = test_master(1);
        let mut peer = test_peer("peer-1");
        peer.flags.insert(InstanceFlags::MASTER_DOWN);
        peer.last_master_down_reply_time = Some(Instant::now() - consts::ASK_PERIOD * 6);
        master.peer_sentinels.insert(peer.runid.clone(), peer);

        clear_stale_master_down(&mut master, Instant::now());
        assert!(!master.peer_sentinels.get("peer-1").unwrap().flags.contains(InstanceFlags::MASTER_DOWN));
    }
}
