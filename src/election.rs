//! Per-epoch Raft-lite leader election (`spec.md` §4.5). The teacher's own
//! election (`spineldb::core::warden::worker`'s `VOTE-REQUEST`/`VOTE-ACK`
//! exchange) is a simpler first-to-quorum scheme; this is new code
//! implementing the exact majority-AND-quorum tally and `SENTINEL_MAX_DESYNC`
//! deferral `spec.md` specifies.

use crate::consts;
use crate::registry::{GlobalState, MasterRecord};
use rand::Rng;
use std::collections::HashMap;
use std::time::Instant;

/// Records (or refuses) a vote request for this master, per `spec.md` §4.5
/// step 2. Returns `(granted_runid, epoch)` the caller replies with.
///
/// Adopting a higher epoch here does not itself persist; the caller (the
/// inbound `IS-MASTER-DOWN-BY-ADDR` handler) must persist before the reply
/// is observable, per `spec.md` §5's durability rule.
pub fn vote(master: &mut MasterRecord, global: &GlobalState, req_epoch: u64, req_runid: &str) -> (String, u64) {
    if req_epoch > global.current_epoch() {
        global.adopt_epoch(req_epoch);
    }

    let already_voted_this_epoch_or_later = master
        .voted_leader
        .is_some()
        && master.voted_leader_epoch >= req_epoch;

    if !already_voted_this_epoch_or_later {
        master.voted_leader = Some(req_runid.to_string());
        master.voted_leader_epoch = global.current_epoch();
        if req_runid != global.myid {
            let desync_ms = rand::thread_rng().gen_range(0..=consts::MAX_DESYNC.as_millis() as u64);
            master.failover_start_time = Some(Instant::now() + std::time::Duration::from_millis(desync_ms));
        }
    }

    (
        master.voted_leader.clone().unwrap_or_else(|| "*".to_string()),
        master.voted_leader_epoch,
    )
}

/// Tallies peer votes at the current epoch, casts this Sentinel's own vote
/// for the plurality candidate (or itself, if none), and returns `Some(
/// leader_runid)` if that candidate has both a majority of voters and at
/// least `quorum` votes (`spec.md` §4.5 steps 1-4).
pub fn try_elect_leader(master: &mut MasterRecord, global: &GlobalState) -> Option<String> {
    let current_epoch = global.current_epoch();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for peer in master.peer_sentinels.iter() {
        if peer.leader_epoch == current_epoch
            && let Some(leader) = &peer.leader
        {
            *counts.entry(leader.clone()).or_insert(0) += 1;
        }
    }

    let plurality = counts.iter().max_by_key(|(_, c)| **c).map(|(k, _)| k.clone());
    let candidate = plurality.unwrap_or_else(|| global.myid.clone());

    let (leader, _epoch) = vote(master, global, current_epoch, &candidate);
    let tally = counts.get(&leader).copied().unwrap_or(0) + 1;
    let voters = master.peer_sentinels.len() + 1;

    if tally > voters / 2 && tally >= master.config.quorum {
        Some(leader)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Address, MasterConfig};
    use std::path::PathBuf;

    fn test_master(quorum: usize) -> MasterRecord {
        let config = MasterConfig {
            name: "m".into(),
            quorum,
            down_after: std::time::Duration::from_secs(30),
            failover_timeout: std::time::Duration::from_secs(180),
            parallel_syncs: 1,
            auth_user: None,
            auth_pass: None,
            notification_script: None,
            client_reconfig_script: None,
            rename_command: Default::default(),
        };
        MasterRecord::new(config, Address::new("m", "127.0.0.1".parse().unwrap(), 6379))
    }

    #[test]
    fn single_vote_per_epoch_is_stable() {
        let global = GlobalState::new("myid-0".repeat(5), PathBuf::from("/tmp/x"));
        let mut master = test_master(1);
        let (a, _) = vote(&mut master, &global, 1, "candidate-a");
        let (b, _) = vote(&mut master, &global, 1, "candidate-b");
        assert_eq!(a, "candidate-a");
        assert_eq!(b, "candidate-a");
    }

    #[test]
    fn self_election_needs_majority_and_quorum() {
        let global = GlobalState::new("myid-0".repeat(5), PathBuf::from("/tmp/x"));
        global.bump_epoch();
        let mut master = test_master(3);
        assert!(try_elect_leader(&mut master, &global).is_none());
    }
}
