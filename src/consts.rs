//! Named timing constants from `spec.md`, collected in one place the way
//! `spineldb`'s own modules group their tunable defaults near the top of a
//! file. Values match the real Sentinel's well-known defaults, which
//! `spec.md` names but does not always spell out numerically.

use std::time::Duration;

pub const MIN_LINK_RECONNECT_PERIOD: Duration = Duration::from_secs(15);
pub const INFO_PERIOD: Duration = Duration::from_secs(10);
pub const INFO_PERIOD_FAST: Duration = Duration::from_secs(1);
pub const PING_PERIOD: Duration = Duration::from_secs(1);
pub const PUBLISH_PERIOD: Duration = Duration::from_secs(2);
pub const MAX_PENDING_COMMANDS: usize = 100;
pub const ASK_PERIOD: Duration = Duration::from_secs(1);
pub const ELECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const SLAVE_RECONF_TIMEOUT: Duration = Duration::from_secs(10);
pub const TILT_TRIGGER: Duration = Duration::from_secs(2);
pub const TILT_PERIOD: Duration = Duration::from_secs(30);
pub const MAX_DESYNC: Duration = Duration::from_millis(1000);
pub const DRIFT_CORRECTION_GRACE_PERIOD: Duration = Duration::from_secs(30);

pub const HELLO_CHANNEL: &str = "__sentinel__:hello";
