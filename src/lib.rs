//! Ignis Sentinel: a high-availability coordinator for Ignis masters and
//! their replicas. Monitors instance health by quorum, gossips peer views
//! over pub/sub, and drives automated failover (`spec.md`).

pub mod commands;
pub mod config;
pub mod consts;
pub mod down;
pub mod election;
pub mod error;
pub mod failover;
pub mod gossip;
pub mod info;
pub mod net;
pub mod persist;
pub mod prober;
pub mod protocol;
pub mod reconfig;
pub mod registry;
pub mod scripts;
pub mod tick;
pub mod tilt;

use anyhow::{Result, anyhow};
use scripts::ScriptQueue;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Interval at which the script executor's retry/backoff queue is serviced,
/// independent of any single master's control loop.
const SCRIPT_TICK_PERIOD: std::time::Duration = std::time::Duration::from_millis(100);

/// Loads `config_path`, then runs every monitored master's control loop, the
/// script executor, and the command listener until one of them exits.
/// Grounded in `spineldb::core::warden::run`'s "one `JoinSet`, fail loud if
/// anything returns" shape.
pub async fn run(config_path: &Path) -> Result<()> {
    let (global, port) = config::load(config_path).await?;
    info!(myid = %global.myid, masters = global.masters.len(), "Ignis Sentinel starting");

    let scripts = Arc::new(ScriptQueue::new());

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    for entry in global.masters.iter() {
        spawn_master_loop(&mut tasks, entry.key().clone(), global.clone(), scripts.clone());
    }

    tasks.spawn(run_script_loop(scripts.clone()));
    tasks.spawn(commands::run_listener(port, global.clone(), scripts.clone()));

    let mut monitor_rx = global.take_monitor_rx().expect("monitor receiver taken twice");

    loop {
        tokio::select! {
            Some(res) = tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("a Sentinel task completed unexpectedly without an error"),
                    Ok(Err(e)) => error!("a Sentinel task failed: {e}"),
                    Err(e) => error!("a Sentinel task panicked: {e}"),
                }
            }
            Some(name) = monitor_rx.recv() => {
                info!(master = %name, "starting control loop for a master added via SENTINEL MONITOR");
                spawn_master_loop(&mut tasks, name, global.clone(), scripts.clone());
            }
            else => break,
        }
    }

    Err(anyhow!("all Sentinel tasks have terminated"))
}

/// Spawns one master's control loop into `tasks`, shared by the boot-time
/// loop above and the runtime `SENTINEL MONITOR` handoff.
fn spawn_master_loop(tasks: &mut JoinSet<Result<()>>, name: String, global: Arc<registry::GlobalState>, scripts: Arc<ScriptQueue>) {
    tasks.spawn(async move {
        tick::run(name.clone(), global, scripts).await;
        Err(anyhow!("control loop for master '{name}' exited unexpectedly"))
    });
}

async fn run_script_loop(scripts: Arc<ScriptQueue>) -> Result<()> {
    let mut interval = tokio::time::interval(SCRIPT_TICK_PERIOD);
    loop {
        interval.tick().await;
        scripts.tick();
    }
}
