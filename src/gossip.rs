//! Hello gossip: publishing this Sentinel's view on the hello channel and
//! processing peers' views (`spec.md` §4.3). Grounded in the shape of
//! `spineldb::core::warden::worker`'s hello handling, generalized from its
//! JSON envelope to the eight-field comma-separated wire format `spec.md`
//! specifies.

use crate::persist;
use crate::registry::{Address, GlobalState, InstanceFlags, PeerSentinelRecord};
use crate::scripts::ScriptQueue;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct HelloMessage {
    pub sender_ip: IpAddr,
    pub sender_port: u16,
    pub sender_runid: String,
    pub sender_current_epoch: u64,
    pub master_name: String,
    pub master_ip: IpAddr,
    pub master_port: u16,
    pub master_config_epoch: u64,
}

/// Builds this Sentinel's hello payload for one monitored master.
pub fn build_payload(
    global: &GlobalState,
    announce_ip: IpAddr,
    announce_port: u16,
    master_name: &str,
    master_addr: &Address,
    master_config_epoch: u64,
) -> String {
    format!(
        "{},{},{},{},{},{},{},{}",
        announce_ip,
        announce_port,
        global.myid,
        global.current_epoch(),
        master_name,
        master_addr.resolved_ip,
        master_addr.port,
        master_config_epoch,
    )
}

pub fn parse_payload(payload: &str) -> Option<HelloMessage> {
    let fields: Vec<&str> = payload.split(',').collect();
    if fields.len() != 8 {
        return None;
    }
    Some(HelloMessage {
        sender_ip: fields[0].parse().ok()?,
        sender_port: fields[1].parse().ok()?,
        sender_runid: fields[2].to_string(),
        sender_current_epoch: fields[3].parse().ok()?,
        master_name: fields[4].to_string(),
        master_ip: fields[5].parse().ok()?,
        master_port: fields[6].parse().ok()?,
        master_config_epoch: fields[7].parse().ok()?,
    })
}

/// Processes one received hello payload against the full registry
/// (`spec.md` §4.3 steps 1-7).
pub fn process_hello(global: &Arc<GlobalState>, scripts: &Arc<ScriptQueue>, payload: &str) {
    let Some(hello) = parse_payload(payload) else {
        return;
    };

    // Step 1: drop gossip about a master we don't monitor (silent, per the
    // open-question resolution in SPEC_FULL.md / DESIGN.md).
    let Some(master_lock) = global.get_master(&hello.master_name) else {
        return;
    };

    // Step 2: ignore our own hello.
    if hello.sender_runid == global.myid {
        return;
    }

    // Step 5: adopt a higher current_epoch before anything else observes it.
    if global.adopt_epoch(hello.sender_current_epoch) {
        let _ = persist::rewrite(global);
    }

    let mut master = master_lock.lock();

    // Step 3/4: runid-first collision resolution (DESIGN.md Open Question
    // decision #3 — preserved exactly as specified).
    let existing_by_addr = master
        .peer_sentinels
        .iter()
        .find(|p| p.addr.resolved_ip == hello.sender_ip && p.addr.port == hello.sender_port && p.runid != hello.sender_runid)
        .map(|p| p.runid.clone());

    if let Some(stale_runid) = existing_by_addr {
        // The same address now claims a different runid than an existing
        // entry: mark the stale entry's port invalid pending a future hello.
        if let Some(mut stale) = master.peer_sentinels.get_mut(&stale_runid) {
            stale.addr.port = 0;
        }
    }

    let sender_addr = Address::new(hello.sender_ip.to_string(), hello.sender_ip, hello.sender_port);

    match master.peer_sentinels.get(&hello.sender_runid).map(|p| p.addr.clone()) {
        Some(known_addr) if known_addr != sender_addr => {
            // Re-announced under a new address: drop and recreate, sharing
            // the link with any other master that already knows this runid.
            master.peer_sentinels.remove(&hello.sender_runid);
            drop(master);
            let link = global.share_or_new_link(&hello.sender_runid, sender_addr.socket_addr(), &hello.master_name);
            master = master_lock.lock();
            let mut peer = PeerSentinelRecord::new(hello.sender_runid.clone(), sender_addr, hello.master_name.clone(), link);
            peer.last_hello_time = Some(Instant::now());
            master.peer_sentinels.insert(peer.runid.clone(), peer);
        }
        Some(_) => {
            if let Some(mut peer) = master.peer_sentinels.get_mut(&hello.sender_runid) {
                peer.last_hello_time = Some(Instant::now());
            }
        }
        None => {
            drop(master);
            let link = global.share_or_new_link(&hello.sender_runid, sender_addr.socket_addr(), &hello.master_name);
            master = master_lock.lock();
            let mut peer = PeerSentinelRecord::new(hello.sender_runid.clone(), sender_addr, hello.master_name.clone(), link);
            peer.last_hello_time = Some(Instant::now());
            master.peer_sentinels.insert(peer.runid.clone(), peer);
            debug!(runid = %hello.sender_runid, "discovered peer sentinel via hello");
        }
    }

    // Step 6: a higher master_config_epoch makes the sender's view
    // authoritative.
    if hello.master_config_epoch > master.config_epoch {
        let old_addr = master.addr.clone();
        let new_addr = Address::new(hello.master_ip.to_string(), hello.master_ip, hello.master_port);
        info!(master = %hello.master_name, from = %old_addr, to = %new_addr, "+config-update-from");
        master.change_address(new_addr);
        master.config_epoch = hello.master_config_epoch;
        master.flags.remove(InstanceFlags::S_DOWN | InstanceFlags::O_DOWN);

        if let Some(script) = master.config.client_reconfig_script.clone() {
            scripts.enqueue_client_reconfig(
                &script,
                &hello.master_name,
                "observer",
                "start",
                &old_addr.resolved_ip.to_string(),
                old_addr.port,
                &hello.master_ip.to_string(),
                hello.master_port,
            );
        }
        drop(master);
        let _ = persist::rewrite(global);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips() {
        let addr = Address::new("m", "10.0.0.5".parse().unwrap(), 6379);
        let global = GlobalState::new("a".repeat(40), "/tmp/sentinel.conf".into());
        let payload = build_payload(&global, "10.0.0.1".parse().unwrap(), 26379, "mymaster", &addr, 3);
        let parsed = parse_payload(&payload).unwrap();
        assert_eq!(parsed.master_name, "mymaster");
        assert_eq!(parsed.master_port, 6379);
        assert_eq!(parsed.master_config_epoch, 3);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(parse_payload("too,few,fields").is_none());
    }
}
