//! Bootstrap configuration and persisted-state loading: a line-oriented
//! parser for the directive grammar `spec.md` §6 describes — the same
//! format `persist::rewrite` writes, since Sentinel's bootstrap file and its
//! self-rewritten state file are one and the same. Generalizes
//! `warden::config::WardenConfig`/`MonitoredMaster`'s `serde`+`toml` shape
//! into that grammar; `serde`/`humantime_serde` remain in use for
//! `MasterConfig`'s in-memory shape.

use crate::error::SentinelError;
use crate::registry::{GlobalState, MasterConfig, MasterRecord, PeerSentinelRecord, ReplicaRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_PORT: u16 = 26379;

#[derive(Debug, Default)]
struct MasterDirectives {
    ip: String,
    port: u16,
    quorum: usize,
    down_after: Option<Duration>,
    failover_timeout: Option<Duration>,
    parallel_syncs: Option<usize>,
    notification_script: Option<PathBuf>,
    client_reconfig_script: Option<PathBuf>,
    auth_user: Option<String>,
    auth_pass: Option<String>,
    rename_command: HashMap<String, String>,
    config_epoch: u64,
    leader_epoch: u64,
    known_replicas: Vec<(String, u16)>,
    known_sentinels: Vec<(String, u16, String)>,
}

#[derive(Debug, Default)]
struct ParsedFile {
    port: u16,
    myid: Option<String>,
    announce_ip: Option<String>,
    announce_port: Option<u16>,
    sentinel_user: Option<String>,
    sentinel_pass: Option<String>,
    resolve_hostnames: bool,
    announce_hostnames: bool,
    deny_scripts_reconfig: bool,
    current_epoch: u64,
    masters: HashMap<String, MasterDirectives>,
    master_order: Vec<String>,
}

fn yes(v: &str) -> bool {
    v.eq_ignore_ascii_case("yes") || v == "1"
}

fn bad(lineno: usize, why: &str) -> SentinelError {
    SentinelError::Config(format!("line {}: {why}", lineno + 1))
}

fn master_entry<'a>(out: &'a mut ParsedFile, name: &str) -> &'a mut MasterDirectives {
    if !out.masters.contains_key(name) {
        out.master_order.push(name.to_string());
    }
    out.masters.entry(name.to_string()).or_default()
}

fn parse_lines(text: &str) -> Result<ParsedFile, SentinelError> {
    let mut out = ParsedFile {
        port: DEFAULT_PORT,
        ..Default::default()
    };

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens[0].eq_ignore_ascii_case("port") {
            out.port = tokens.get(1).ok_or_else(|| bad(lineno, "port needs a value"))?.parse()?;
            continue;
        }
        if !tokens[0].eq_ignore_ascii_case("sentinel") {
            continue;
        }
        let Some(directive) = tokens.get(1) else { continue };
        let args = &tokens[2..];

        match directive.to_ascii_lowercase().as_str() {
            "myid" => out.myid = args.first().map(|s| s.to_string()),
            "current-epoch" => out.current_epoch = args.first().and_then(|s| s.parse().ok()).unwrap_or(0),
            "announce-ip" => out.announce_ip = args.first().map(|s| s.to_string()),
            "announce-port" => out.announce_port = args.first().and_then(|s| s.parse().ok()),
            "sentinel-user" => out.sentinel_user = args.first().map(|s| s.to_string()),
            "sentinel-pass" => out.sentinel_pass = args.first().map(|s| s.to_string()),
            "resolve-hostnames" => out.resolve_hostnames = args.first().map(|s| yes(s)).unwrap_or(false),
            "announce-hostnames" => out.announce_hostnames = args.first().map(|s| yes(s)).unwrap_or(false),
            "deny-scripts-reconfig" => out.deny_scripts_reconfig = args.first().map(|s| yes(s)).unwrap_or(false),

            "monitor" => match args {
                [name, ip, port, quorum] => {
                    let port: u16 = port.parse().map_err(|_| bad(lineno, "bad port"))?;
                    let quorum: usize = quorum.parse().map_err(|_| bad(lineno, "bad quorum"))?;
                    let entry = master_entry(&mut out, name);
                    entry.ip = ip.to_string();
                    entry.port = port;
                    entry.quorum = quorum;
                }
                _ => return Err(bad(lineno, "monitor needs <name> <ip> <port> <quorum>")),
            },
            "down-after-milliseconds" => match args {
                [name, ms] => {
                    let ms: u64 = ms.parse().map_err(|_| bad(lineno, "bad ms"))?;
                    master_entry(&mut out, name).down_after = Some(Duration::from_millis(ms));
                }
                _ => return Err(bad(lineno, "down-after-milliseconds needs <name> <ms>")),
            },
            "failover-timeout" => match args {
                [name, ms] => {
                    let ms: u64 = ms.parse().map_err(|_| bad(lineno, "bad ms"))?;
                    master_entry(&mut out, name).failover_timeout = Some(Duration::from_millis(ms));
                }
                _ => return Err(bad(lineno, "failover-timeout needs <name> <ms>")),
            },
            "parallel-syncs" => match args {
                [name, n] => master_entry(&mut out, name).parallel_syncs = Some(n.parse().map_err(|_| bad(lineno, "bad count"))?),
                _ => return Err(bad(lineno, "parallel-syncs needs <name> <n>")),
            },
            "notification-script" => match args {
                [name, path] => master_entry(&mut out, name).notification_script = Some(PathBuf::from(path)),
                _ => return Err(bad(lineno, "notification-script needs <name> <path>")),
            },
            "client-reconfig-script" => match args {
                [name, path] => master_entry(&mut out, name).client_reconfig_script = Some(PathBuf::from(path)),
                _ => return Err(bad(lineno, "client-reconfig-script needs <name> <path>")),
            },
            "auth-pass" => match args {
                [name, pass] => master_entry(&mut out, name).auth_pass = Some(pass.to_string()),
                _ => return Err(bad(lineno, "auth-pass needs <name> <pass>")),
            },
            "auth-user" => match args {
                [name, user] => master_entry(&mut out, name).auth_user = Some(user.to_string()),
                _ => return Err(bad(lineno, "auth-user needs <name> <user>")),
            },
            "rename-command" => match args {
                [name, from, to] => {
                    master_entry(&mut out, name).rename_command.insert(from.to_string(), to.to_string());
                }
                _ => return Err(bad(lineno, "rename-command needs <name> <from> <to>")),
            },
            "config-epoch" => match args {
                [name, n] => master_entry(&mut out, name).config_epoch = n.parse().map_err(|_| bad(lineno, "bad epoch"))?,
                _ => return Err(bad(lineno, "config-epoch needs <name> <n>")),
            },
            "leader-epoch" => match args {
                [name, n] => master_entry(&mut out, name).leader_epoch = n.parse().map_err(|_| bad(lineno, "bad epoch"))?,
                _ => return Err(bad(lineno, "leader-epoch needs <name> <n>")),
            },
            "known-replica" => match args {
                [name, ip, port] => {
                    let port: u16 = port.parse().map_err(|_| bad(lineno, "bad port"))?;
                    master_entry(&mut out, name).known_replicas.push((ip.to_string(), port));
                }
                _ => return Err(bad(lineno, "known-replica needs <name> <ip> <port>")),
            },
            "known-sentinel" => match args {
                [name, ip, port, runid] => {
                    let port: u16 = port.parse().map_err(|_| bad(lineno, "bad port"))?;
                    master_entry(&mut out, name).known_sentinels.push((ip.to_string(), port, runid.to_string()));
                }
                _ => return Err(bad(lineno, "known-sentinel needs <name> <ip> <port> <runid>")),
            },
            other => {
                info!(directive = other, "ignoring unrecognized sentinel directive");
            }
        }
    }

    Ok(out)
}

/// A freshly generated or previously persisted 40-hex-character id.
fn myid_or_generate(existing: Option<String>) -> String {
    existing.unwrap_or_else(|| {
        let mut bytes = [0u8; 20];
        getrandom::fill(&mut bytes).expect("system RNG unavailable");
        hex::encode(bytes)
    })
}

/// Loads the bootstrap/state file at `path` and builds a fully populated
/// `GlobalState`, including any `known-replica`/`known-sentinel` seed lines.
/// If `path` does not exist yet, starts from an empty configuration (a
/// fresh `myid` is generated and will be persisted on first rewrite).
pub async fn load(path: &Path) -> Result<(Arc<GlobalState>, u16), SentinelError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let parsed = parse_lines(&text)?;

    let myid = myid_or_generate(parsed.myid);
    let mut global = GlobalState::new(myid, path.to_path_buf());
    global.sentinel_user = parsed.sentinel_user;
    global.sentinel_pass = parsed.sentinel_pass;
    global.resolve_hostnames = parsed.resolve_hostnames;
    global.announce_hostnames = parsed.announce_hostnames;
    global.deny_scripts_reconfig = parsed.deny_scripts_reconfig;
    global.announce.ip = parsed.announce_ip;
    global.announce.port = parsed.announce_port;
    if parsed.current_epoch > 0 {
        global.adopt_epoch(parsed.current_epoch);
    }

    for name in &parsed.master_order {
        let directives = &parsed.masters[name];
        if directives.ip.is_empty() || directives.port == 0 {
            return Err(SentinelError::Config(format!("master '{name}' has tunables but no monitor directive")));
        }
        let addr = crate::registry::address::resolve(&directives.ip, directives.port).await?;

        let config = MasterConfig {
            name: name.clone(),
            quorum: directives.quorum,
            down_after: directives.down_after.unwrap_or_else(crate::registry::master::default_down_after),
            failover_timeout: directives.failover_timeout.unwrap_or_else(crate::registry::master::default_failover_timeout),
            parallel_syncs: directives.parallel_syncs.unwrap_or_else(crate::registry::master::default_parallel_syncs),
            auth_user: directives.auth_user.clone(),
            auth_pass: directives.auth_pass.clone(),
            notification_script: directives.notification_script.clone(),
            client_reconfig_script: directives.client_reconfig_script.clone(),
            rename_command: directives.rename_command.clone(),
        };

        let mut master = MasterRecord::new(config, addr);
        master.config_epoch = directives.config_epoch;
        master.voted_leader_epoch = directives.leader_epoch;

        for (ip, port) in &directives.known_replicas {
            if let Ok(replica_addr) = crate::registry::address::resolve(ip, *port).await {
                let replica = ReplicaRecord::new(replica_addr.clone(), name.clone());
                master.replicas.insert(replica_addr, replica);
            }
        }
        for (ip, port, runid) in &directives.known_sentinels {
            if let Ok(peer_addr) = crate::registry::address::resolve(ip, *port).await {
                let link = global.share_or_new_link(runid, peer_addr.socket_addr(), name);
                let peer = PeerSentinelRecord::new(runid.clone(), peer_addr.clone(), name.clone(), link);
                master.peer_sentinels.insert(runid.clone(), peer);
            }
        }

        global.masters.insert(name.clone(), Arc::new(parking_lot::Mutex::new(master)));
    }

    Ok((Arc::new(global), parsed.port))
}
