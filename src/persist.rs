//! Config Rewriter: persists the current view (epoch, known peers,
//! addresses) to a user-editable file, atomically (`spec.md` §4.8/§6). No
//! direct teacher counterpart — `spineldb`'s warden has no durable state
//! file — so this is new code grounded in the general write-temp-then-rename
//! idiom the rest of the pack uses for durable writes.

use crate::error::SentinelError;
use crate::registry::GlobalState;
use std::io::Write;
use tracing::warn;

/// Serializes the full registry to the directive-line format `spec.md` §6
/// describes and writes it atomically: write to a sibling temp file, fsync,
/// then rename over the destination.
pub fn rewrite(global: &GlobalState) -> Result<(), SentinelError> {
    let mut out = String::new();
    out.push_str(&format!("sentinel myid {}\n", global.myid));
    out.push_str(&format!("sentinel current-epoch {}\n", global.current_epoch()));
    if let Some(ip) = &global.announce.ip {
        out.push_str(&format!("sentinel announce-ip {ip}\n"));
    }
    if let Some(port) = global.announce.port {
        out.push_str(&format!("sentinel announce-port {port}\n"));
    }
    if let Some(user) = &global.sentinel_user {
        out.push_str(&format!("sentinel sentinel-user {user}\n"));
    }
    if let Some(pass) = &global.sentinel_pass {
        out.push_str(&format!("sentinel sentinel-pass {pass}\n"));
    }
    out.push_str(&format!(
        "sentinel resolve-hostnames {}\n",
        if global.resolve_hostnames { "yes" } else { "no" }
    ));
    out.push_str(&format!(
        "sentinel announce-hostnames {}\n",
        if global.announce_hostnames { "yes" } else { "no" }
    ));
    out.push_str(&format!(
        "sentinel deny-scripts-reconfig {}\n",
        if global.deny_scripts_reconfig { "yes" } else { "no" }
    ));

    for entry in global.masters.iter() {
        let master = entry.value().lock();
        out.push_str(&format!(
            "sentinel monitor {} {} {} {}\n",
            master.config.name, master.addr.resolved_ip, master.addr.port, master.config.quorum
        ));
        out.push_str(&format!(
            "sentinel down-after-milliseconds {} {}\n",
            master.config.name,
            master.config.down_after.as_millis()
        ));
        out.push_str(&format!(
            "sentinel failover-timeout {} {}\n",
            master.config.name,
            master.config.failover_timeout.as_millis()
        ));
        out.push_str(&format!(
            "sentinel parallel-syncs {} {}\n",
            master.config.name, master.config.parallel_syncs
        ));
        if let Some(script) = &master.config.notification_script {
            out.push_str(&format!(
                "sentinel notification-script {} {}\n",
                master.config.name,
                script.display()
            ));
        }
        if let Some(script) = &master.config.client_reconfig_script {
            out.push_str(&format!(
                "sentinel client-reconfig-script {} {}\n",
                master.config.name,
                script.display()
            ));
        }
        if let Some(pass) = &master.config.auth_pass {
            out.push_str(&format!("sentinel auth-pass {} {}\n", master.config.name, pass));
        }
        if let Some(user) = &master.config.auth_user {
            out.push_str(&format!("sentinel auth-user {} {}\n", master.config.name, user));
        }
        for (from, to) in &master.config.rename_command {
            out.push_str(&format!(
                "sentinel rename-command {} {} {}\n",
                master.config.name, from, to
            ));
        }
        out.push_str(&format!(
            "sentinel config-epoch {} {}\n",
            master.config.name, master.config_epoch
        ));
        out.push_str(&format!(
            "sentinel leader-epoch {} {}\n",
            master.config.name, master.voted_leader_epoch
        ));
        for replica in master.replicas.iter() {
            out.push_str(&format!(
                "sentinel known-replica {} {} {}\n",
                master.config.name, replica.addr.resolved_ip, replica.addr.port
            ));
        }
        for peer in master.peer_sentinels.iter() {
            out.push_str(&format!(
                "sentinel known-sentinel {} {} {} {}\n",
                master.config.name, peer.addr.resolved_ip, peer.addr.port, peer.runid
            ));
        }
    }

    write_atomic(&global.state_file_path, out.as_bytes()).map_err(|e| {
        warn!(error = %e, "failed to rewrite sentinel config, continuing");
        SentinelError::Persistence(e.to_string())
    })
}

fn write_atomic(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("sentinel-state")
    ));
    {
        let mut tmp = std::fs::File::create(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    if let Ok(dir_handle) = std::fs::File::open(dir) {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Address, MasterConfig, MasterRecord};

    #[test]
    fn rewrite_is_atomic_and_round_trips_myid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.conf");
        let global = GlobalState::new("a".repeat(40), path.clone());

        let config = MasterConfig {
            name: "mymaster".into(),
            quorum: 2,
            down_after: std::time::Duration::from_secs(30),
            failover_timeout: std::time::Duration::from_secs(180),
            parallel_syncs: 1,
            auth_user: None,
            auth_pass: None,
            notification_script: None,
            client_reconfig_script: None,
            rename_command: Default::default(),
        };
        let master = MasterRecord::new(config, Address::new("m", "127.0.0.1".parse().unwrap(), 6379));
        global.masters.insert("mymaster".to_string(), std::sync::Arc::new(parking_lot::Mutex::new(master)));

        rewrite(&global).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains(&format!("sentinel myid {}", "a".repeat(40))));
        assert!(written.contains("sentinel monitor mymaster 127.0.0.1 6379 2"));
    }
}
