//! Role and state flags carried by every monitored instance, and the
//! failover state machine's six states.
//!
//! The original keeps role and liveness/failover state in one bitmask field
//! on the instance record; this crate separates "which kind of instance is
//! this" into `InstanceKind` (a tagged variant per `spec.md` §9's "sum type
//! with shared header" option) and keeps only the liveness/failover bits as
//! a `bitflags!` mask, since `InstanceKind` already disambiguates role.

use bitflags::bitflags;

bitflags! {
    /// Liveness and failover-progress bits from `spec.md` §3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstanceFlags: u32 {
        /// Subjectively down: this Sentinel's own local judgment.
        const S_DOWN = 1 << 0;
        /// Objectively down: quorum of peers concur.
        const O_DOWN = 1 << 1;
        /// A peer Sentinel has told us it also believes the master is down.
        const MASTER_DOWN = 1 << 2;
        const FAILOVER_IN_PROGRESS = 1 << 3;
        /// This replica was just promoted to master by the failover driver.
        const PROMOTED = 1 << 4;
        const RECONF_SENT = 1 << 5;
        const RECONF_INPROG = 1 << 6;
        const RECONF_DONE = 1 << 7;
        /// Set by `SENTINEL FAILOVER`: bypass the leader check in WAIT_START.
        const FORCE_FAILOVER = 1 << 8;
    }
}

/// The six states of the Failover Driver (`spec.md` §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailoverState {
    #[default]
    None,
    WaitStart,
    SelectSlave,
    SendSlaveofNoOne,
    WaitPromotion,
    ReconfSlaves,
    UpdateConfig,
}

/// What kind of peer INFO/role reports for a replica's link to its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MasterLinkStatus {
    #[default]
    Unknown,
    Up,
    Down,
}
