//! TILT Safeguard: detects clock jumps or long pauses and suspends acting
//! decisions while telemetry collection continues (`spec.md` §4.9). No
//! teacher counterpart; grounded in the tick-loop shape `tick.rs` drives.

use crate::consts;
use crate::registry::GlobalState;
use std::time::{Instant, SystemTime};
use tracing::{info, warn};

/// Called once per tick, before any other component runs. `now` drives pause
/// detection (a tick that took too long, per `Instant`'s monotonic clock);
/// `now_wall` drives backward-jump detection, which needs a clock that can
/// actually regress — `Instant` can't, so it only ever catches forward
/// jumps and long pauses.
pub fn check(global: &GlobalState, now: Instant, now_wall: SystemTime) {
    let previous = *global.previous_tick_time.lock();
    *global.previous_tick_time.lock() = Some(now);
    let previous_wall = *global.previous_wall_clock.lock();
    *global.previous_wall_clock.lock() = Some(now_wall);

    if let Some(previous) = previous {
        let paused_or_jumped_forward = now.duration_since(previous) > consts::TILT_TRIGGER;
        let jumped_backward = previous_wall.is_some_and(|p| now_wall < p);
        if (paused_or_jumped_forward || jumped_backward) && !global.is_tilting() {
            warn!("+tilt");
            global.enter_tilt();
        }
    }

    if global.is_tilting()
        && let Some(elapsed) = global.tilt_elapsed()
        && elapsed > consts::TILT_PERIOD
    {
        info!("-tilt");
        global.exit_tilt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn large_forward_jump_enters_tilt() {
        let global = GlobalState::new("a".repeat(40), PathBuf::from("/tmp/x"));
        let t0 = Instant::now();
        let w0 = SystemTime::now();
        check(&global, t0, w0);
        let jumped = t0 + consts::TILT_TRIGGER + std::time::Duration::from_secs(1);
        check(&global, jumped, w0 + std::time::Duration::from_secs(1));
        assert!(global.is_tilting());
    }

    #[test]
    fn steady_ticks_never_tilt() {
        let global = GlobalState::new("a".repeat(40), PathBuf::from("/tmp/x"));
        let t0 = Instant::now();
        let w0 = SystemTime::now();
        check(&global, t0, w0);
        check(&global, t0 + std::time::Duration::from_millis(100), w0 + std::time::Duration::from_millis(100));
        assert!(!global.is_tilting());
    }

    #[test]
    fn backward_wall_clock_jump_enters_tilt_even_with_steady_instant() {
        let global = GlobalState::new("a".repeat(40), PathBuf::from("/tmp/x"));
        let t0 = Instant::now();
        let w0 = SystemTime::now();
        check(&global, t0, w0);
        let regressed = w0 - std::time::Duration::from_secs(3600);
        check(&global, t0 + std::time::Duration::from_millis(100), regressed);
        assert!(global.is_tilting());
    }
}
