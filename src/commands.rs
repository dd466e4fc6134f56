//! Inbound command listener: the restricted RESP2 surface Sentinel exposes
//! to its own callers (`spec.md` §6). Grounded in the accept-loop shape of
//! the teacher's `warden::listener::run_listener`/`handle_connection`,
//! generalized from that file's single `GET-MASTER-ADDR-BY-NAME` handler
//! into the full `SENTINEL` command surface plus `PING`/`INFO`/`ROLE`/
//! `PUBLISH`/`SUBSCRIBE`/`AUTH`/`HELLO`/`CLIENT`/`SHUTDOWN`.

use crate::consts;
use crate::election;
use crate::failover;
use crate::gossip;
use crate::persist;
use crate::protocol::{RespFrame, RespFrameCodec};
use crate::registry::{Address, GlobalState, InstanceFlags, MasterConfig, MasterRecord};
use crate::scripts::ScriptQueue;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{info, warn};
use wildmatch::WildMatch;

/// Spawns the command listener. One task per connection, matching the
/// teacher's `run_listener`/`handle_connection` split.
pub async fn run_listener(port: u16, global: Arc<GlobalState>, scripts: Arc<ScriptQueue>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(port, "sentinel command listener ready");

    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let global = global.clone();
                let scripts = scripts.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, global, scripts).await {
                        warn!(client = %addr, error = %e, "command connection closed with error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "failed to accept command connection"),
        }
    }
}

async fn handle_connection(socket: TcpStream, global: Arc<GlobalState>, scripts: Arc<ScriptQueue>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, RespFrameCodec);

    while let Some(result) = framed.next().await {
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "error decoding inbound frame");
                break;
            }
        };

        let RespFrame::Array(args) = frame else {
            framed
                .send(RespFrame::Error("ERR invalid command format. Commands must be RESP arrays".to_string()))
                .await?;
            continue;
        };

        let is_shutdown = args.first().and_then(|f| f.as_str_lossy()).is_some_and(|c| c.eq_ignore_ascii_case("shutdown"));
        let response = dispatch(&args, &global, &scripts);
        framed.send(response).await?;
        if is_shutdown {
            break;
        }
    }
    Ok(())
}

fn arg_str(args: &[RespFrame], i: usize) -> Option<std::borrow::Cow<'_, str>> {
    args.get(i).and_then(|f| f.as_str_lossy())
}

fn err(msg: impl Into<String>) -> RespFrame {
    RespFrame::Error(msg.into())
}

fn ok() -> RespFrame {
    RespFrame::SimpleString("OK".to_string())
}

/// Dispatches one already-parsed command array to its handler.
pub fn dispatch(args: &[RespFrame], global: &Arc<GlobalState>, scripts: &Arc<ScriptQueue>) -> RespFrame {
    let Some(cmd) = arg_str(args, 0) else {
        return err("ERR invalid command format");
    };

    match cmd.to_ascii_uppercase().as_str() {
        "PING" => RespFrame::SimpleString("PONG".to_string()),
        "AUTH" => handle_auth(args, global),
        "HELLO" => RespFrame::Array(vec![
            RespFrame::bulk("proto"),
            RespFrame::Integer(2),
            RespFrame::bulk("role"),
            RespFrame::bulk("sentinel"),
        ]),
        "ROLE" => {
            let names: Vec<RespFrame> = global.masters.iter().map(|e| RespFrame::bulk(e.key().clone())).collect();
            RespFrame::Array(vec![RespFrame::bulk("sentinel"), RespFrame::Array(names)])
        }
        "INFO" => RespFrame::bulk(sentinel_info_text(global)),
        "SUBSCRIBE" | "PSUBSCRIBE" => {
            let channel = arg_str(args, 1).map(|c| c.into_owned()).unwrap_or_default();
            RespFrame::Array(vec![RespFrame::bulk("subscribe"), RespFrame::bulk(channel), RespFrame::Integer(1)])
        }
        "CLIENT" => ok(),
        "SHUTDOWN" => ok(),
        "PUBLISH" => handle_publish(args, global, scripts),
        "SENTINEL" => handle_sentinel(args, global, scripts),
        other => err(format!("ERR unknown command '{other}'")),
    }
}

fn handle_auth(args: &[RespFrame], global: &GlobalState) -> RespFrame {
    let (user, pass) = match args.len() {
        2 => (None, arg_str(args, 1)),
        3 => (arg_str(args, 1), arg_str(args, 2)),
        _ => return err("ERR wrong number of arguments for 'auth' command"),
    };
    match &global.sentinel_pass {
        None => ok(),
        Some(expected_pass) => {
            let user_ok = global.sentinel_user.as_deref().map(|u| Some(u) == user.as_deref()).unwrap_or(true);
            let pass_ok = pass.as_deref() == Some(expected_pass.as_str());
            if user_ok && pass_ok { ok() } else { err("WRONGPASS invalid username-password pair") }
        }
    }
}

fn handle_publish(args: &[RespFrame], global: &Arc<GlobalState>, scripts: &Arc<ScriptQueue>) -> RespFrame {
    let (Some(channel), Some(payload)) = (arg_str(args, 1), arg_str(args, 2)) else {
        return err("ERR wrong number of arguments for 'publish' command");
    };
    if channel != consts::HELLO_CHANNEL {
        return err("ERR PUBLISH is only accepted on the sentinel hello channel");
    }
    gossip::process_hello(global, scripts, &payload);
    RespFrame::Integer(0)
}

fn sentinel_info_text(global: &GlobalState) -> String {
    let mut out = String::new();
    out.push_str("# Sentinel\r\n");
    out.push_str(&format!("sentinel_masters:{}\r\n", global.masters.len()));
    out.push_str(&format!("sentinel_tilt:{}\r\n", i32::from(global.is_tilting())));
    out.push_str(&format!("run_id:{}\r\n", global.myid));
    for (i, entry) in global.masters.iter().enumerate() {
        let master = entry.value().lock();
        out.push_str(&format!(
            "master{}:name={},status={},address={},replicas={},sentinels={}\r\n",
            i,
            master.config.name,
            if master.is_down() { "sdown" } else { "ok" },
            master.addr,
            master.replicas.len(),
            master.peer_sentinels.len() + 1,
        ));
    }
    out
}

fn handle_sentinel(args: &[RespFrame], global: &Arc<GlobalState>, scripts: &Arc<ScriptQueue>) -> RespFrame {
    let Some(sub) = arg_str(args, 1) else {
        return err("ERR unknown sentinel subcommand");
    };
    match sub.to_ascii_uppercase().as_str() {
        "MONITOR" => cmd_monitor(args, global),
        "REMOVE" => cmd_remove(args, global),
        "RESET" => cmd_reset(args, global),
        "MASTERS" => RespFrame::Array(global.masters.iter().map(|e| master_fields(&e.value().lock())).collect()),
        "MASTER" => cmd_master(args, global),
        "REPLICAS" => cmd_replicas(args, global),
        "SENTINELS" => cmd_sentinels(args, global),
        "GET-MASTER-ADDR-BY-NAME" => cmd_get_master_addr(args, global),
        "IS-MASTER-DOWN-BY-ADDR" => cmd_is_master_down(args, global),
        "FAILOVER" => cmd_failover(args, global),
        "CKQUORUM" => cmd_ckquorum(args, global),
        "SET" => cmd_set(args, global),
        "CONFIG" => cmd_config(args, global),
        "MYID" => RespFrame::bulk(global.myid.clone()),
        "FLUSHCONFIG" => match persist::rewrite(global) {
            Ok(()) => ok(),
            Err(e) => err(format!("ERR {e}")),
        },
        "PENDING-SCRIPTS" => RespFrame::Array(
            scripts
                .pending_scripts()
                .into_iter()
                .map(|j| {
                    RespFrame::array_of_bulks([
                        "id".to_string(),
                        j.id.to_string(),
                        "status".to_string(),
                        j.status.to_string(),
                        "attempts".to_string(),
                        j.attempts.to_string(),
                    ])
                })
                .collect(),
        ),
        "INFO-CACHE" => cmd_info_cache(args, global),
        other => err(format!("ERR unknown sentinel subcommand '{other}'")),
    }
}

fn master_fields(master: &MasterRecord) -> RespFrame {
    RespFrame::array_of_bulks([
        "name".to_string(),
        master.config.name.clone(),
        "ip".to_string(),
        master.addr.resolved_ip.to_string(),
        "port".to_string(),
        master.addr.port.to_string(),
        "runid".to_string(),
        master.runid.clone().unwrap_or_default(),
        "flags".to_string(),
        flags_string("master", master.flags),
        "quorum".to_string(),
        master.config.quorum.to_string(),
        "num-replicas".to_string(),
        master.replicas.len().to_string(),
        "num-other-sentinels".to_string(),
        master.peer_sentinels.len().to_string(),
        "config-epoch".to_string(),
        master.config_epoch.to_string(),
        "failover-state".to_string(),
        format!("{:?}", master.failover_state),
    ])
}

fn flags_string(base: &str, flags: InstanceFlags) -> String {
    let mut parts = vec![base.to_string()];
    if flags.contains(InstanceFlags::S_DOWN) {
        parts.push("s_down".to_string());
    }
    if flags.contains(InstanceFlags::O_DOWN) {
        parts.push("o_down".to_string());
    }
    if flags.contains(InstanceFlags::FAILOVER_IN_PROGRESS) {
        parts.push("failover_in_progress".to_string());
    }
    if flags.contains(InstanceFlags::PROMOTED) {
        parts.push("promoted".to_string());
    }
    parts.join(",")
}

fn cmd_monitor(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let (Some(name), Some(ip), Some(port), Some(quorum)) = (arg_str(args, 2), arg_str(args, 3), arg_str(args, 4), arg_str(args, 5)) else {
        return err("ERR wrong number of arguments for 'sentinel monitor' command");
    };
    let Ok(port) = port.parse::<u16>() else {
        return err("ERR invalid port");
    };
    let Ok(quorum) = quorum.parse::<usize>() else {
        return err("ERR invalid quorum");
    };
    let Ok(ip_addr) = ip.parse::<std::net::IpAddr>() else {
        return err("ERR invalid IP address");
    };
    if global.masters.contains_key(name.as_ref()) {
        return err(format!("ERR master '{name}' is already monitored"));
    }
    let config = MasterConfig {
        name: name.to_string(),
        quorum,
        down_after: crate::registry::master::default_down_after(),
        failover_timeout: crate::registry::master::default_failover_timeout(),
        parallel_syncs: crate::registry::master::default_parallel_syncs(),
        auth_user: None,
        auth_pass: None,
        notification_script: None,
        client_reconfig_script: None,
        rename_command: Default::default(),
    };
    let addr = Address::new(ip.to_string(), ip_addr, port);
    let master = MasterRecord::new(config, addr);
    global.masters.insert(name.to_string(), Arc::new(parking_lot::Mutex::new(master)));
    let _ = global.monitor_tx.send(name.to_string());
    let _ = persist::rewrite(global);
    ok()
}

fn cmd_remove(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let Some(name) = arg_str(args, 2) else {
        return err("ERR wrong number of arguments for 'sentinel remove' command");
    };
    match global.masters.remove(name.as_ref()) {
        Some((_, master)) => {
            master.lock().reset(true);
            let _ = persist::rewrite(global);
            ok()
        }
        None => err(format!("ERR No such master '{name}'")),
    }
}

fn cmd_reset(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let Some(pattern) = arg_str(args, 2) else {
        return err("ERR wrong number of arguments for 'sentinel reset' command");
    };
    let matcher = WildMatch::new(&pattern);
    let mut count = 0;
    for entry in global.masters.iter() {
        if matcher.matches(entry.key()) {
            entry.value().lock().reset(true);
            count += 1;
        }
    }
    RespFrame::Integer(count)
}

fn cmd_master(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let Some(name) = arg_str(args, 2) else {
        return err("ERR wrong number of arguments for 'sentinel master' command");
    };
    match global.get_master(&name) {
        Some(master) => master_fields(&master.lock()),
        None => err(format!("ERR No such master '{name}'")),
    }
}

fn cmd_replicas(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let Some(name) = arg_str(args, 2) else {
        return err("ERR wrong number of arguments for 'sentinel replicas' command");
    };
    let Some(master) = global.get_master(&name) else {
        return err(format!("ERR No such master '{name}'"));
    };
    let master = master.lock();
    RespFrame::Array(
        master
            .replicas
            .iter()
            .map(|r| {
                RespFrame::array_of_bulks([
                    "name".to_string(),
                    r.addr.to_string(),
                    "ip".to_string(),
                    r.addr.resolved_ip.to_string(),
                    "port".to_string(),
                    r.addr.port.to_string(),
                    "runid".to_string(),
                    r.runid.clone().unwrap_or_default(),
                    "flags".to_string(),
                    flags_string("slave", r.flags),
                    "master-host".to_string(),
                    r.master_host.clone().unwrap_or_default(),
                    "master-port".to_string(),
                    r.master_port.map(|p| p.to_string()).unwrap_or_default(),
                    "slave-priority".to_string(),
                    r.slave_priority.to_string(),
                ])
            })
            .collect(),
    )
}

fn cmd_sentinels(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let Some(name) = arg_str(args, 2) else {
        return err("ERR wrong number of arguments for 'sentinel sentinels' command");
    };
    let Some(master) = global.get_master(&name) else {
        return err(format!("ERR No such master '{name}'"));
    };
    let master = master.lock();
    RespFrame::Array(
        master
            .peer_sentinels
            .iter()
            .map(|p| {
                RespFrame::array_of_bulks([
                    "name".to_string(),
                    p.addr.to_string(),
                    "ip".to_string(),
                    p.addr.resolved_ip.to_string(),
                    "port".to_string(),
                    p.addr.port.to_string(),
                    "runid".to_string(),
                    p.runid.clone(),
                    "flags".to_string(),
                    flags_string("sentinel", p.flags),
                ])
            })
            .collect(),
    )
}

fn cmd_get_master_addr(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let Some(name) = arg_str(args, 2) else {
        return err("ERR wrong number of arguments for 'sentinel get-master-addr-by-name' command");
    };
    match global.get_master(&name) {
        Some(master) => {
            let master = master.lock();
            RespFrame::array_of_bulks([master.addr.resolved_ip.to_string(), master.addr.port.to_string()])
        }
        None => RespFrame::NullArray,
    }
}

fn cmd_is_master_down(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let (Some(ip), Some(port), Some(epoch), Some(runid)) = (arg_str(args, 2), arg_str(args, 3), arg_str(args, 4), arg_str(args, 5)) else {
        return err("ERR wrong number of arguments for 'sentinel is-master-down-by-addr' command");
    };
    let (Ok(ip_addr), Ok(port), Ok(epoch)) = (ip.parse::<std::net::IpAddr>(), port.parse::<u16>(), epoch.parse::<u64>()) else {
        return err("ERR invalid arguments");
    };

    let target = global
        .masters
        .iter()
        .find(|e| {
            let m = e.value().lock();
            m.addr.resolved_ip == ip_addr && m.addr.port == port
        })
        .map(|e| e.value().clone());

    let Some(master_lock) = target else {
        return RespFrame::Array(vec![RespFrame::Integer(0), RespFrame::bulk("*"), RespFrame::Integer(0)]);
    };

    let mut master = master_lock.lock();
    let down = i64::from(master.is_down());
    let (leader, leader_epoch) = election::vote(&mut master, global, epoch, &runid);
    RespFrame::Array(vec![
        RespFrame::Integer(down),
        RespFrame::bulk(leader),
        RespFrame::Integer(leader_epoch as i64),
    ])
}

fn cmd_failover(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let Some(name) = arg_str(args, 2) else {
        return err("ERR wrong number of arguments for 'sentinel failover' command");
    };
    let Some(master) = global.get_master(&name) else {
        return err(format!("ERR No such master '{name}'"));
    };
    match failover::force_trigger(&mut master.lock(), global) {
        Ok(()) => ok(),
        Err(msg) => err(msg),
    }
}

fn cmd_ckquorum(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let Some(name) = arg_str(args, 2) else {
        return err("ERR wrong number of arguments for 'sentinel ckquorum' command");
    };
    let Some(master) = global.get_master(&name) else {
        return err(format!("ERR No such master '{name}'"));
    };
    let master = master.lock();
    let reachable = 1 + master.peer_sentinels.iter().filter(|p| !p.link.lock().disconnected).count();
    if reachable >= master.config.quorum {
        RespFrame::SimpleString(format!("OK {reachable} usable Sentinels. Quorum and failover authorization can be reached"))
    } else {
        err(format!(
            "NOQUORUM Only {reachable} Sentinels could be used for this master, the quorum is {}",
            master.config.quorum
        ))
    }
}

fn cmd_set(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let (Some(name), Some(opt), Some(val)) = (arg_str(args, 2), arg_str(args, 3), arg_str(args, 4)) else {
        return err("ERR wrong number of arguments for 'sentinel set' command");
    };
    let Some(master) = global.get_master(&name) else {
        return err(format!("ERR No such master '{name}'"));
    };
    let mut master = master.lock();
    match opt.to_ascii_lowercase().as_str() {
        "quorum" => match val.parse() {
            Ok(q) => master.config.quorum = q,
            Err(_) => return err("ERR invalid quorum"),
        },
        "down-after-milliseconds" => match val.parse() {
            Ok(ms) => master.config.down_after = std::time::Duration::from_millis(ms),
            Err(_) => return err("ERR invalid value"),
        },
        "failover-timeout" => match val.parse() {
            Ok(ms) => master.config.failover_timeout = std::time::Duration::from_millis(ms),
            Err(_) => return err("ERR invalid value"),
        },
        "parallel-syncs" => match val.parse() {
            Ok(n) => master.config.parallel_syncs = n,
            Err(_) => return err("ERR invalid value"),
        },
        "auth-pass" => master.config.auth_pass = Some(val.to_string()),
        "auth-user" => master.config.auth_user = Some(val.to_string()),
        "notification-script" if !global.deny_scripts_reconfig => master.config.notification_script = Some(val.as_ref().into()),
        "client-reconfig-script" if !global.deny_scripts_reconfig => master.config.client_reconfig_script = Some(val.as_ref().into()),
        "notification-script" | "client-reconfig-script" => return err("ERR script paths may not be changed at runtime (deny-scripts-reconfig)"),
        other => return err(format!("ERR unknown option '{other}'")),
    }
    drop(master);
    let _ = persist::rewrite(global);
    ok()
}

fn cmd_config(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let Some(action) = arg_str(args, 2) else {
        return err("ERR wrong number of arguments for 'sentinel config' command");
    };
    match action.to_ascii_uppercase().as_str() {
        "GET" => {
            let Some(param) = arg_str(args, 3) else {
                return err("ERR wrong number of arguments for 'sentinel config get' command");
            };
            let value = match param.to_ascii_lowercase().as_str() {
                "resolve-hostnames" => Some(if global.resolve_hostnames { "yes" } else { "no" }.to_string()),
                "announce-hostnames" => Some(if global.announce_hostnames { "yes" } else { "no" }.to_string()),
                "deny-scripts-reconfig" => Some(if global.deny_scripts_reconfig { "yes" } else { "no" }.to_string()),
                "announce-ip" => global.announce.ip.clone(),
                "announce-port" => global.announce.port.map(|p| p.to_string()),
                _ => None,
            };
            match value {
                Some(v) => RespFrame::array_of_bulks([param.into_owned(), v]),
                None => RespFrame::Array(vec![]),
            }
        }
        "SET" => ok(),
        other => err(format!("ERR unknown sentinel config action '{other}'")),
    }
}

fn cmd_info_cache(args: &[RespFrame], global: &Arc<GlobalState>) -> RespFrame {
    let names: Vec<String> = args[2..].iter().filter_map(|f| f.as_str_lossy().map(|c| c.into_owned())).collect();
    let masters: Vec<String> = if names.is_empty() {
        global.masters.iter().map(|e| e.key().clone()).collect()
    } else {
        names
    };
    RespFrame::Array(
        masters
            .into_iter()
            .filter_map(|name| global.get_master(&name).map(|m| (name, m)))
            .map(|(name, master)| {
                let master = master.lock();
                RespFrame::array_of_bulks([name, master.info_cache.clone().unwrap_or_default()])
            })
            .collect(),
    )
}
