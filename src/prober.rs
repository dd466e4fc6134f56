//! Periodic Prober: PING/INFO/PUBLISH scheduling (`spec.md` §4.2). Realized
//! as plain functions over a link rather than a task-per-master object like
//! `spineldb::core::warden::worker::MasterMonitor`, since the per-master tick
//! in `tick.rs` already provides the "one task per concern" structure the
//! teacher used `MasterMonitor`'s sub-tasks for.

use crate::consts;
use crate::info::{ParsedInfo, parse_info};
use crate::registry::InstanceLink;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opens the link if needed. Mirrors `spec.md` §4.1 `ensure_connected`.
/// `on_hello` forwards any hello payload received on this link's pub/sub
/// subscription to the gossip processor.
pub async fn ensure_connected(
    link: &Arc<InstanceLink>,
    client_name: &str,
    auth: Option<(&str, &str)>,
    also_pubsub: bool,
    on_hello: Arc<dyn Fn(String) + Send + Sync>,
) -> bool {
    link.ensure_connected(client_name, auth, also_pubsub, consts::HELLO_CHANNEL, on_hello).await
}

/// Sends PING if due. Returns `None` if no client is attached, `Some(bool)`
/// (availability) otherwise.
pub async fn maybe_ping(link: &Arc<InstanceLink>, last_pong: Option<Instant>, last_ping: Option<Instant>, down_after: Duration) -> Option<bool> {
    let now = Instant::now();
    let ping_interval = down_after.min(consts::PING_PERIOD);
    let due = last_pong.map(|t| now.duration_since(t) > ping_interval).unwrap_or(true)
        && last_ping.map(|t| now.duration_since(t) > ping_interval / 2).unwrap_or(true);
    if !due {
        return None;
    }
    send_ping(link).await
}

pub async fn send_ping(link: &Arc<InstanceLink>) -> Option<bool> {
    let mut client = link.take_client()?;
    link.record_ping_sent(Instant::now());
    let result = client.ping().await;
    match result {
        Ok(available) => {
            link.record_ping_reply(Instant::now(), available);
            link.put_client(Some(client));
            Some(available)
        }
        Err(_) => {
            link.put_client(None);
            None
        }
    }
}

/// Sends `INFO` and parses the reply, if the client is connected. Returns
/// the raw text alongside the parse so callers can populate `INFO-CACHE`.
pub async fn fetch_info(link: &Arc<InstanceLink>, section: &str) -> Option<(ParsedInfo, String)> {
    let mut client = link.take_client()?;
    let result = client.info(section).await;
    match result {
        Ok(text) => {
            link.put_client(Some(client));
            let parsed = parse_info(&text);
            Some((parsed, text))
        }
        Err(_) => {
            link.put_client(None);
            None
        }
    }
}

/// Whether an `INFO` refresh is due, per `spec.md` §4.2's base/fast period
/// rule (fast period applies when the replica's master looks unhealthy).
pub fn info_due(last_refresh: Option<Instant>, fast: bool) -> bool {
    let period = if fast { consts::INFO_PERIOD_FAST } else { consts::INFO_PERIOD };
    last_refresh.map(|t| t.elapsed() > period).unwrap_or(true)
}

/// Publishes the hello payload on the instance's command connection.
pub async fn publish_hello(link: &Arc<InstanceLink>, payload: &str) -> bool {
    let Some(mut client) = link.take_client() else {
        return false;
    };
    let ok = client.publish(consts::HELLO_CHANNEL, payload).await.is_ok();
    link.put_client(Some(client));
    ok
}

/// Drains any pub/sub messages the background subscriber task has queued.
/// The subscriber itself runs inside `InstanceLink::ensure_connected`'s
/// spawned task; higher layers observe its effects through the registry
/// rather than polling this module directly.
pub fn backpressured(pending_commands: usize, refcount: usize) -> bool {
    pending_commands >= consts::MAX_PENDING_COMMANDS * refcount
}

/// Checks `backpressured` against a link's live `pending_commands` and
/// `Arc` refcount, so every caller about to issue a new probe command
/// shares one up-to-date reading instead of snapshotting it separately.
pub fn is_backpressured(link: &Arc<InstanceLink>) -> bool {
    let pending = link.lock().pending_commands;
    backpressured(pending, Arc::strong_count(link))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn maybe_ping_without_a_connected_client_is_a_noop() {
        let link = InstanceLink::new("127.0.0.1:1".parse().unwrap());
        assert!(maybe_ping(&link, None, None, Duration::from_secs(30)).await.is_none());
    }

    #[test]
    fn backpressure_scales_with_refcount() {
        assert!(!backpressured(150, 2));
        assert!(backpressured(250, 2));
    }
}
