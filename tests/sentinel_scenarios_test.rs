//! End-to-end scenario tests exercising several modules together, in the
//! style of the teacher's `tests/*.rs` direct-unit-call suites: no real TCP
//! server is spun up, but the same public entry points a live deployment
//! would call are invoked directly against hand-built registry state.

use ignis_sentinel::commands;
use ignis_sentinel::registry::{
    Address, FailoverState, GlobalState, InstanceFlags, InstanceLink, MasterConfig, MasterRecord, PeerSentinelRecord, ReplicaRecord,
};
use ignis_sentinel::scripts::ScriptQueue;
use ignis_sentinel::{down, election, failover, gossip};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn bulk(frame: &ignis_sentinel::protocol::RespFrame) -> String {
    match frame {
        ignis_sentinel::protocol::RespFrame::BulkString(b) => String::from_utf8_lossy(b).into_owned(),
        other => panic!("expected a bulk string, got {other:?}"),
    }
}

fn array(frame: ignis_sentinel::protocol::RespFrame) -> Vec<ignis_sentinel::protocol::RespFrame> {
    match frame {
        ignis_sentinel::protocol::RespFrame::Array(items) => items,
        other => panic!("expected an array, got {other:?}"),
    }
}

fn field(pairs: &[ignis_sentinel::protocol::RespFrame], key: &str) -> String {
    let mut it = pairs.iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        if bulk(k) == key {
            return bulk(v);
        }
    }
    panic!("field '{key}' not present");
}

fn test_global() -> Arc<GlobalState> {
    Arc::new(GlobalState::new("a".repeat(40), std::env::temp_dir().join("ignis-sentinel-test.conf")))
}

fn master_config(name: &str, quorum: usize) -> MasterConfig {
    MasterConfig {
        name: name.to_string(),
        quorum,
        down_after: Duration::from_millis(100),
        failover_timeout: Duration::from_secs(180),
        parallel_syncs: 1,
        auth_user: None,
        auth_pass: None,
        notification_script: None,
        client_reconfig_script: None,
        rename_command: Default::default(),
    }
}

/// Scenario 1: single-master boot, no replicas.
#[test]
fn single_master_boot_reports_expected_fields() {
    let global = test_global();
    let scripts = Arc::new(ScriptQueue::new());

    let reply = commands::dispatch(
        &[
            ignis_sentinel::protocol::RespFrame::bulk("SENTINEL"),
            ignis_sentinel::protocol::RespFrame::bulk("MONITOR"),
            ignis_sentinel::protocol::RespFrame::bulk("mymaster"),
            ignis_sentinel::protocol::RespFrame::bulk("127.0.0.1"),
            ignis_sentinel::protocol::RespFrame::bulk("6379"),
            ignis_sentinel::protocol::RespFrame::bulk("1"),
        ],
        &global,
        &scripts,
    );
    assert_eq!(reply, ignis_sentinel::protocol::RespFrame::SimpleString("OK".to_string()));

    let reply = commands::dispatch(
        &[
            ignis_sentinel::protocol::RespFrame::bulk("SENTINEL"),
            ignis_sentinel::protocol::RespFrame::bulk("MASTER"),
            ignis_sentinel::protocol::RespFrame::bulk("mymaster"),
        ],
        &global,
        &scripts,
    );
    let pairs = array(reply);
    assert_eq!(field(&pairs, "name"), "mymaster");
    assert_eq!(field(&pairs, "ip"), "127.0.0.1");
    assert_eq!(field(&pairs, "port"), "6379");
    assert_eq!(field(&pairs, "quorum"), "1");
    assert_eq!(field(&pairs, "flags"), "master");

    let reply = commands::dispatch(
        &[
            ignis_sentinel::protocol::RespFrame::bulk("SENTINEL"),
            ignis_sentinel::protocol::RespFrame::bulk("GET-MASTER-ADDR-BY-NAME"),
            ignis_sentinel::protocol::RespFrame::bulk("mymaster"),
        ],
        &global,
        &scripts,
    );
    let addr = array(reply);
    assert_eq!(bulk(&addr[0]), "127.0.0.1");
    assert_eq!(bulk(&addr[1]), "6379");
}

/// Scenario 2: replica auto-discovery, as `tick::probe_master` would record
/// it after parsing a `slave0:` advertisement from the master's `INFO`.
#[test]
fn discovered_replica_is_visible_via_sentinel_replicas() {
    let global = test_global();
    let scripts = Arc::new(ScriptQueue::new());
    let master = MasterRecord::new(master_config("mymaster", 1), Address::new("127.0.0.1", "127.0.0.1".parse().unwrap(), 6379));
    global.masters.insert("mymaster".to_string(), Arc::new(Mutex::new(master)));

    let replica_addr = Address::new("127.0.0.1", "127.0.0.1".parse().unwrap(), 6380);
    {
        let master = global.get_master("mymaster").unwrap();
        let mut master = master.lock();
        master.replicas.insert(replica_addr.clone(), ReplicaRecord::new(replica_addr, "mymaster"));
    }

    let reply = commands::dispatch(
        &[
            ignis_sentinel::protocol::RespFrame::bulk("SENTINEL"),
            ignis_sentinel::protocol::RespFrame::bulk("REPLICAS"),
            ignis_sentinel::protocol::RespFrame::bulk("mymaster"),
        ],
        &global,
        &scripts,
    );
    let replicas = array(reply);
    assert_eq!(replicas.len(), 1);
    let fields = array(replicas.into_iter().next().unwrap());
    assert_eq!(field(&fields, "ip"), "127.0.0.1");
    assert_eq!(field(&fields, "port"), "6380");
    assert_eq!(field(&fields, "flags"), "slave");
}

/// Scenario 3: S_DOWN then O_DOWN with quorum 2 and two Sentinels, via the
/// `down` module's own flag transitions and quorum tally.
#[test]
fn sdown_plus_one_concurring_peer_reaches_odown_at_quorum_two() {
    let mut master = MasterRecord::new(master_config("mymaster", 2), Address::new("127.0.0.1", "127.0.0.1".parse().unwrap(), 6379));

    master.link.lock().act_ping_time = Some(Instant::now() - Duration::from_millis(200));
    assert!(down::evaluate_master_sdown(&mut master, Instant::now()));
    assert!(master.flags.contains(InstanceFlags::S_DOWN));
    assert!(!down::evaluate_odown(&mut master));

    let link = InstanceLink::new("127.0.0.1:1".parse().unwrap());
    let mut peer = PeerSentinelRecord::new("peer-b".to_string(), Address::new("b", "127.0.0.1".parse().unwrap(), 26380), "mymaster", link);
    peer.flags.insert(InstanceFlags::MASTER_DOWN);
    master.peer_sentinels.insert(peer.runid.clone(), peer);

    assert_eq!(down::count_master_down(&master), 2);
    assert!(down::evaluate_odown(&mut master));
    assert!(master.flags.contains(InstanceFlags::O_DOWN));
}

/// Scenario 4 (the deterministic half): a forced failover on a healthy
/// master reaches `SELECT_SLAVE` and picks the one eligible replica without
/// any peer voting, since `SENTINEL FAILOVER` bypasses the leader check.
#[tokio::test]
async fn forced_failover_bypasses_leader_election_and_selects_a_replica() {
    let global = test_global();
    let scripts = Arc::new(ScriptQueue::new());
    let master_lock = Arc::new(Mutex::new(MasterRecord::new(
        master_config("mymaster", 1),
        Address::new("127.0.0.1", "127.0.0.1".parse().unwrap(), 6379),
    )));

    let replica_addr = Address::new("127.0.0.1", "127.0.0.1".parse().unwrap(), 6380);
    {
        let mut master = master_lock.lock();
        let mut replica = ReplicaRecord::new(replica_addr.clone(), "mymaster");
        replica.link.lock().disconnected = false;
        replica.link.record_ping_reply(Instant::now(), true);
        replica.info_refresh = Some(Instant::now());
        master.replicas.insert(replica_addr.clone(), replica);

        failover::force_trigger(&mut master, &global).expect("no failover already running");
        assert!(master.flags.contains(InstanceFlags::FORCE_FAILOVER));
        assert_eq!(master.failover_state, FailoverState::WaitStart);
    }

    // WAIT_START: forced, so no peer vote is needed to reach SELECT_SLAVE.
    failover::step(master_lock.clone(), global.clone(), scripts.clone()).await;
    assert_eq!(master_lock.lock().failover_state, FailoverState::SelectSlave);

    // SELECT_SLAVE: the only replica is healthy and reachable, so it's chosen.
    failover::step(master_lock.clone(), global.clone(), scripts.clone()).await;
    let master = master_lock.lock();
    assert_eq!(master.failover_state, FailoverState::SendSlaveofNoOne);
    assert_eq!(master.promoted_replica, Some(replica_addr));
}

/// Scenario 6: address change via gossip. A HELLO with a higher
/// `master_config_epoch` must switch the monitored address and retain the
/// old master as a replica of the new one.
#[test]
fn hello_with_higher_config_epoch_switches_master_address() {
    let global = test_global();
    let scripts = Arc::new(ScriptQueue::new());
    let old_addr = Address::new("127.0.0.1", "127.0.0.1".parse().unwrap(), 6379);
    let master = MasterRecord::new(master_config("mymaster", 1), old_addr.clone());
    global.masters.insert("mymaster".to_string(), Arc::new(Mutex::new(master)));

    let new_ip: IpAddr = "127.0.0.2".parse().unwrap();
    let payload = format!("127.0.0.9,26379,other-sentinel-runid,0,mymaster,{new_ip},6381,1");

    gossip::process_hello(&global, &scripts, &payload);

    let master = global.get_master("mymaster").unwrap();
    let master = master.lock();
    assert_eq!(master.addr.resolved_ip, new_ip);
    assert_eq!(master.addr.port, 6381);
    assert_eq!(master.config_epoch, 1);
    assert!(master.replicas.contains_key(&old_addr));
}

/// Leader majority (`spec.md` §8): a lone Sentinel can only elect itself
/// once its own vote alone is both a majority of voters and meets quorum.
#[test]
fn lone_sentinel_elects_itself_when_quorum_is_one() {
    let global = test_global();
    let mut master = MasterRecord::new(master_config("mymaster", 1), Address::new("127.0.0.1", "127.0.0.1".parse().unwrap(), 6379));
    global.bump_epoch();
    let leader = election::try_elect_leader(&mut master, &global);
    assert_eq!(leader, Some(global.myid.clone()));
}
