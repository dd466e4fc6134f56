//! `InstanceLink`: the pair of long-lived connections (command + pub/sub) to
//! one monitored peer, shareable across every master record that watches the
//! same physical peer Sentinel (`spec.md` §4.1, Design Note "shared mutable
//! link").
//!
//! Sharing and reference counting are realized with a plain `Arc`: cloning
//! the `Arc` *is* taking a reference, and `Arc::strong_count` *is* the
//! refcount `spec.md` describes as an explicit field — duplicating it as a
//! hand-maintained counter would just be a second source of truth for the
//! same number. The last owner dropping the `Arc` runs `Drop`, which aborts
//! the pub/sub task and lets the command socket close synchronously; this is
//! the "last drop closes both connections" invariant.
//!
//! The spec's "discarding sink" requirement for in-flight callbacks after
//! teardown is realized structurally: there are no free-floating callback
//! objects to rebind in the first place. Every in-flight request is an
//! `.await` on that connection's own `send_and_receive` future; closing the
//! link drops the socket, which makes that future resolve to an `Err` the
//! caller already treats as a transient link error (`spec.md` §7) rather than
//! a panic against freed state.

use crate::net::client::SentinelClient;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Minimum time between reconnect attempts for one link (`spec.md` §4.1).
pub const MIN_LINK_RECONNECT_PERIOD: Duration = Duration::from_secs(15);

#[derive(Debug, Default)]
struct ConnState {
    connected_since: Option<Instant>,
    last_connect_attempt: Option<Instant>,
}

/// Mutable state behind the shared link.
#[derive(Debug)]
pub struct LinkState {
    pub addr: SocketAddr,
    pub disconnected: bool,
    pub pending_commands: usize,
    cmd: ConnState,
    pubsub: ConnState,
    pubsub_task: Option<JoinHandle<()>>,
    pub act_ping_time: Option<Instant>,
    pub last_ping_time: Option<Instant>,
    pub last_pong_time: Option<Instant>,
    pub last_avail_time: Option<Instant>,
    pub pubsub_last_activity: Option<Instant>,
    pub last_reconn_time: Option<Instant>,
    client: Option<SentinelClient>,
}

impl LinkState {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            disconnected: true,
            pending_commands: 0,
            cmd: ConnState::default(),
            pubsub: ConnState::default(),
            pubsub_task: None,
            act_ping_time: None,
            last_ping_time: None,
            last_pong_time: None,
            last_avail_time: None,
            pubsub_last_activity: None,
            last_reconn_time: None,
            client: None,
        }
    }

    /// True when the command connection has been up long enough that a
    /// stuck ping or stale pong indicates a broken (not merely slow) peer.
    pub fn is_broken(&self, now: Instant, down_after: Duration) -> bool {
        let Some(connected_since) = self.cmd.connected_since else {
            return false;
        };
        if now.duration_since(connected_since) < MIN_LINK_RECONNECT_PERIOD {
            return false;
        }
        let half = down_after / 2;
        let ping_stuck = self
            .act_ping_time
            .is_some_and(|t| now.duration_since(t) > half);
        let pong_stale = self
            .last_pong_time
            .map(|t| now.duration_since(t) > half)
            .unwrap_or(true);
        ping_stuck && pong_stale
    }

    /// True when the pub/sub channel has been silent for too long relative
    /// to the publish cadence (`spec.md` §4.1: 3x the publish period).
    pub fn is_pubsub_idle(&self, now: Instant, publish_period: Duration) -> bool {
        self.pubsub.connected_since.is_some()
            && self
                .pubsub_last_activity
                .map(|t| now.duration_since(t) > publish_period * 3)
                .unwrap_or(true)
    }

    pub fn can_attempt_reconnect(&self, now: Instant, min_period: Duration) -> bool {
        self.cmd
            .last_connect_attempt
            .map(|t| now.duration_since(t) >= min_period)
            .unwrap_or(true)
    }

    pub fn client_mut(&mut self) -> Option<&mut SentinelClient> {
        self.client.as_mut()
    }
}

impl InstanceLink {
    /// Takes the command-connection client out of the link for the duration
    /// of an async call, so the synchronous lock is never held across an
    /// `.await`. Returns `None` if disconnected or already borrowed.
    pub fn take_client(&self) -> Option<SentinelClient> {
        let mut state = self.inner.lock();
        let client = state.client.take();
        if client.is_some() {
            state.pending_commands += 1;
        }
        client
    }

    /// Returns a borrowed client after use. If the probe determined the
    /// connection is no longer healthy, pass `None` to leave it absent (the
    /// link then looks disconnected to later observers until reconnected).
    pub fn put_client(&self, client: Option<SentinelClient>) {
        let mut state = self.inner.lock();
        state.pending_commands = state.pending_commands.saturating_sub(1);
        if client.is_none() {
            state.disconnected = true;
            state.cmd = ConnState::default();
        }
        state.client = client;
    }

    pub fn record_ping_sent(&self, now: Instant) {
        let mut state = self.inner.lock();
        state.last_ping_time = Some(now);
        if state.act_ping_time.is_none() {
            state.act_ping_time = Some(now);
        }
    }

    pub fn record_ping_reply(&self, now: Instant, available: bool) {
        let mut state = self.inner.lock();
        state.last_pong_time = Some(now);
        if available {
            state.last_avail_time = Some(now);
            state.act_ping_time = None;
        }
    }
}

/// A refcounted handle to a shared link. `Arc::clone` is the refcount
/// increment; dropping the last `Arc` runs `Drop` below.
#[derive(Debug)]
pub struct InstanceLink {
    inner: Mutex<LinkState>,
}

impl InstanceLink {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LinkState::new(addr)),
        })
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, LinkState> {
        self.inner.lock()
    }

    /// Opens the command connection (and, for masters/replicas, the pub/sub
    /// connection) if disconnected and the minimum reconnect delay has
    /// elapsed. Returns `true` if a (re)connection was attempted.
    ///
    /// `on_hello` is invoked with each message payload the pub/sub task
    /// receives on `hello_channel`, from inside that task — callers hand in
    /// a closure that forwards into `gossip::process_hello` rather than
    /// polling this link for messages.
    pub async fn ensure_connected(
        self: &Arc<Self>,
        client_name: &str,
        auth: Option<(&str, &str)>,
        also_pubsub: bool,
        hello_channel: &'static str,
        on_hello: Arc<dyn Fn(String) + Send + Sync>,
    ) -> bool {
        let (should_connect, addr) = {
            let mut state = self.inner.lock();
            let now = Instant::now();
            if !state.disconnected
                || !state.can_attempt_reconnect(now, MIN_LINK_RECONNECT_PERIOD)
            {
                (false, state.addr)
            } else {
                state.cmd.last_connect_attempt = Some(now);
                state.last_reconn_time = Some(now);
                (true, state.addr)
            }
        };
        if !should_connect {
            return false;
        }

        match SentinelClient::connect(addr).await {
            Ok(mut client) => {
                if let Some((user, pass)) = auth {
                    let _ = client.auth(user, pass).await;
                }
                let _ = client.set_name(client_name).await;
                let now = Instant::now();
                let ping_ok = client.ping().await.is_ok();
                {
                    let mut state = self.inner.lock();
                    state.disconnected = false;
                    state.cmd.connected_since = Some(now);
                    state.last_ping_time = Some(now);
                    if ping_ok {
                        state.last_pong_time = Some(now);
                        state.last_avail_time = Some(now);
                        state.act_ping_time = None;
                    } else {
                        state.act_ping_time = Some(now);
                    }
                    state.client = Some(client);
                }
                if also_pubsub {
                    self.spawn_pubsub(
                        addr,
                        format!("{client_name}-pubsub"),
                        auth.map(|(u, p)| (u.to_string(), p.to_string())),
                        hello_channel,
                        on_hello,
                    );
                }
                true
            }
            Err(_) => {
                let mut state = self.inner.lock();
                state.disconnected = true;
                true
            }
        }
    }

    /// Subscribes on a dedicated connection and forwards every received
    /// payload to `on_hello` until the connection errors, at which point the
    /// task exits and `pubsub` reverts to disconnected so the next
    /// `ensure_connected` respawns it.
    fn spawn_pubsub(
        self: &Arc<Self>,
        addr: SocketAddr,
        _name: String,
        auth: Option<(String, String)>,
        hello_channel: &'static str,
        on_hello: Arc<dyn Fn(String) + Send + Sync>,
    ) {
        let link = self.clone();
        let handle = tokio::spawn(async move {
            let Ok(mut client) = SentinelClient::connect(addr).await else {
                return;
            };
            if let Some((user, pass)) = &auth {
                let _ = client.auth(user, pass).await;
            }
            if client.subscribe(hello_channel).await.is_err() {
                return;
            }
            let now = Instant::now();
            {
                let mut state = link.inner.lock();
                state.pubsub.connected_since = Some(now);
                state.pubsub_last_activity = Some(now);
            }
            loop {
                match client.read_message().await {
                    Ok((channel, payload)) => {
                        link.inner.lock().pubsub_last_activity = Some(Instant::now());
                        if channel == hello_channel {
                            on_hello(String::from_utf8_lossy(&payload).into_owned());
                        }
                    }
                    Err(_) => break,
                }
            }
            let mut state = link.inner.lock();
            state.pubsub = ConnState::default();
        });
        let mut state = self.inner.lock();
        if let Some(old) = state.pubsub_task.replace(handle) {
            old.abort();
        }
    }

    /// Closes one or both connections and marks the link disconnected so the
    /// next tick retries. `which_pubsub` closes the pub/sub side too.
    pub fn close(&self, which_pubsub: bool) {
        let mut state = self.inner.lock();
        state.disconnected = true;
        state.client = None;
        state.cmd = ConnState::default();
        if which_pubsub {
            if let Some(task) = state.pubsub_task.take() {
                task.abort();
            }
            state.pubsub = ConnState::default();
        }
    }
}

impl Drop for InstanceLink {
    fn drop(&mut self) {
        if let Some(task) = self.inner.lock().pubsub_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharing_is_plain_arc_refcounting() {
        let link = InstanceLink::new("127.0.0.1:1".parse().unwrap());
        assert_eq!(Arc::strong_count(&link), 1);
        let shared = link.clone();
        assert_eq!(Arc::strong_count(&link), 2);
        drop(shared);
        assert_eq!(Arc::strong_count(&link), 1);
    }

    #[test]
    fn fresh_link_is_disconnected_and_not_broken() {
        let link = InstanceLink::new("127.0.0.1:1".parse().unwrap());
        let state = link.lock();
        assert!(state.disconnected);
        assert!(!state.is_broken(Instant::now(), Duration::from_secs(30)));
    }
}
