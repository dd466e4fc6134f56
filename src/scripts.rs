//! Script Executor: a bounded FIFO of notification / client-reconfig script
//! jobs, with retry and timeout (`spec.md` §4.10). No teacher counterpart in
//! `warden/`; grounded in `tokio::process::Command` plus a bounded-retry
//! queue in the idiom of the teacher's `run_pubsub_loop` backoff doubling.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub const MAX_QUEUE_DEPTH: usize = 256;
pub const MAX_CONCURRENT: usize = 16;
pub const MAX_RETRIES: u32 = 10;
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(30);
pub const JOB_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
}

#[derive(Debug, Clone)]
pub struct ScriptJob {
    pub id: u64,
    pub argv: Vec<String>,
    pub attempts: u32,
    pub next_eligible_time: Instant,
    pub status: JobStatus,
}

#[derive(Debug, Clone)]
pub struct PendingScriptInfo {
    pub id: u64,
    pub argv: Vec<String>,
    pub attempts: u32,
    pub status: &'static str,
}

struct Inner {
    jobs: VecDeque<ScriptJob>,
    next_id: u64,
}

/// The bounded FIFO itself. Shared via `Arc` across the per-master tick
/// tasks that enqueue notification/reconfig scripts.
pub struct ScriptQueue {
    inner: parking_lot::Mutex<Inner>,
    permits: Semaphore,
}

impl Default for ScriptQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptQueue {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                jobs: VecDeque::new(),
                next_id: 1,
            }),
            permits: Semaphore::new(MAX_CONCURRENT),
        }
    }

    /// Enqueues a job, dropping it if the FIFO is already at capacity.
    pub fn enqueue(&self, argv: Vec<String>) -> bool {
        let mut inner = self.inner.lock();
        if inner.jobs.len() >= MAX_QUEUE_DEPTH {
            warn!(depth = inner.jobs.len(), "script queue at capacity, dropping job");
            return false;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.jobs.push_back(ScriptJob {
            id,
            argv,
            attempts: 0,
            next_eligible_time: Instant::now(),
            status: JobStatus::Pending,
        });
        true
    }

    pub fn enqueue_notification(&self, script: &PathBuf, event_type: &str, message: &str) {
        self.enqueue(vec![
            script.to_string_lossy().into_owned(),
            event_type.to_string(),
            message.to_string(),
        ]);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_client_reconfig(
        &self,
        script: &PathBuf,
        master_name: &str,
        role: &str,
        state: &str,
        from_ip: &str,
        from_port: u16,
        to_ip: &str,
        to_port: u16,
    ) {
        self.enqueue(vec![
            script.to_string_lossy().into_owned(),
            master_name.to_string(),
            role.to_string(),
            state.to_string(),
            from_ip.to_string(),
            from_port.to_string(),
            to_ip.to_string(),
            to_port.to_string(),
        ]);
    }

    pub fn pending_scripts(&self) -> Vec<PendingScriptInfo> {
        self.inner
            .lock()
            .jobs
            .iter()
            .map(|j| PendingScriptInfo {
                id: j.id,
                argv: j.argv.clone(),
                attempts: j.attempts,
                status: match j.status {
                    JobStatus::Pending => "pending",
                    JobStatus::Running => "running",
                },
            })
            .collect()
    }

    fn requeue_or_drop(&self, mut job: ScriptJob) {
        job.attempts += 1;
        if job.attempts > MAX_RETRIES {
            warn!(id = job.id, argv = ?job.argv, "script exhausted retries, dropping");
            return;
        }
        let backoff = INITIAL_BACKOFF * 2u32.saturating_pow(job.attempts.saturating_sub(1).min(8));
        job.next_eligible_time = Instant::now() + backoff;
        job.status = JobStatus::Pending;
        self.inner.lock().jobs.push_back(job);
    }

    /// One tick: launches every eligible pending job up to the concurrency
    /// cap. Each spawned job retries itself on failure per the policy above.
    pub fn tick(self: &std::sync::Arc<Self>) {
        let now = Instant::now();
        let ready: Vec<ScriptJob> = {
            let mut inner = self.inner.lock();
            let mut ready = Vec::new();
            let pending_count = inner.jobs.len();
            let mut remaining = VecDeque::with_capacity(pending_count);
            while let Some(job) = inner.jobs.pop_front() {
                if job.status == JobStatus::Pending
                    && job.next_eligible_time <= now
                    && self.permits.available_permits() > ready.len()
                {
                    ready.push(job);
                } else {
                    remaining.push_back(job);
                }
            }
            inner.jobs = remaining;
            ready
        };

        for job in ready {
            let queue = self.clone();
            tokio::spawn(async move {
                let Ok(_permit) = queue.permits.acquire().await else {
                    return;
                };
                let Some((program, args)) = job.argv.split_first() else {
                    return;
                };
                let mut cmd = Command::new(program);
                cmd.args(args);
                let spawn_result = cmd.spawn();
                let Ok(mut child) = spawn_result else {
                    queue.requeue_or_drop(job);
                    return;
                };
                let outcome = tokio::time::timeout(JOB_TIMEOUT, child.wait()).await;
                match outcome {
                    Ok(Ok(status)) if status.success() => {
                        debug!(id = job.id, "script job completed");
                    }
                    Ok(Ok(_)) | Ok(Err(_)) => {
                        queue.requeue_or_drop(job);
                    }
                    Err(_) => {
                        let _ = child.start_kill();
                        queue.requeue_or_drop(job);
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_respects_capacity() {
        let queue = ScriptQueue::new();
        for _ in 0..MAX_QUEUE_DEPTH {
            assert!(queue.enqueue(vec!["true".to_string()]));
        }
        assert!(!queue.enqueue(vec!["true".to_string()]));
    }

    #[test]
    fn pending_scripts_reports_queued_jobs() {
        let queue = ScriptQueue::new();
        queue.enqueue(vec!["echo".to_string(), "hi".to_string()]);
        let pending = queue.pending_scripts();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, "pending");
    }
}
