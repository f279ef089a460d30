//! Bounded async operation queue with per-key exclusion.
//!
//! Every file-system mutation of the mirror flows through an [`OpQueue`],
//! partitioned by the absolute target path: at most one task per key runs at
//! a time, tasks for the same key run in submission order, and at most
//! `max_concurrency` distinct keys run at once.
//!
//! A task may declare a timeout. When it elapses the key's running slot is
//! released. The task body is not interrupted, but its eventual completion
//! is discarded through a monotonically increasing run id, so a successor
//! task for the same key cannot be torn down by a straggler.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// A queued unit of work. The future must resolve exactly once; errors are
/// logged at the task boundary and do not wedge the queue.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Debug, thiserror::Error)]
#[error("queue is stopped")]
pub struct QueueStopped;

struct QueueItem {
    partition_key: String,
    timeout: Option<Duration>,
    task: TaskFuture,
}

struct RunningTask {
    run_id: u64,
    expires_at: Option<Instant>,
}

struct QueueState {
    pending: VecDeque<QueueItem>,
    running: HashMap<String, RunningTask>,
    next_run_id: u64,
    accepting: bool,
}

pub struct OpQueue {
    state: Mutex<QueueState>,
    max_concurrency: usize,
    /// Signalled whenever the queue may have become idle; [`OpQueue::drain`]
    /// re-checks under the lock.
    idle: Notify,
}

impl OpQueue {
    /// Creates the queue and starts its reaper. The reaper lives until
    /// `cancel` fires; cancel it only after the final [`OpQueue::drain`],
    /// because draining relies on the reaper to release timed-out slots.
    pub fn new(
        max_concurrency: usize,
        reaper_interval: Duration,
        cancel: &CancellationToken,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: HashMap::new(),
                next_run_id: 0,
                accepting: true,
            }),
            max_concurrency,
            idle: Notify::new(),
        });

        tokio::spawn({
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            async move {
                let mut ticker = tokio::time::interval(reaper_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => queue.reap(),
                    }
                }
            }
        });

        queue
    }

    /// Enqueues a task for `partition_key`. Never blocks: if the key is busy
    /// the task is deferred, preserving per-key submission order.
    pub fn submit(
        self: &Arc<Self>,
        partition_key: String,
        timeout: Option<Duration>,
        task: TaskFuture,
    ) -> Result<(), QueueStopped> {
        let mut state = self.lock_state();
        if !state.accepting {
            return Err(QueueStopped);
        }
        state.pending.push_back(QueueItem {
            partition_key,
            timeout,
            task,
        });
        self.dispatch_locked(&mut state);
        Ok(())
    }

    /// Refuses new submissions. With `immediate`, additionally discards all
    /// not-yet-started tasks; already-running tasks are never interrupted.
    pub fn stop(self: &Arc<Self>, immediate: bool) {
        let mut state = self.lock_state();
        state.accepting = false;
        if immediate {
            let discarded = state.pending.len();
            state.pending.clear();
            if discarded > 0 {
                warn!("discarded {discarded} queued tasks on immediate stop");
            }
        }
        self.notify_if_idle(&state);
    }

    /// Waits for all outstanding tasks to finish, up to `timeout`. When the
    /// timeout elapses the graceful stop is upgraded to an immediate one and
    /// the remaining pending tasks are discarded. Returns whether the queue
    /// fully drained.
    pub async fn drain(self: &Arc<Self>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for the idle notification before checking, so a
            // completion between the check and the await is not lost.
            let mut notified = std::pin::pin!(self.idle.notified());
            notified.as_mut().enable();
            if self.is_idle() {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("queue drain timed out, upgrading to immediate stop");
                    self.stop(true);
                    return self.is_idle();
                }
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock_state();
        state.pending.is_empty() && state.running.is_empty()
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("queue lock poisoned")
    }

    /// Starts every pending task whose key is free, up to the concurrency
    /// cap. Scanning front to back keeps per-key FIFO order: an earlier
    /// submission for a key always starts before a later one.
    fn dispatch_locked(self: &Arc<Self>, state: &mut MutexGuard<'_, QueueState>) {
        let mut index = 0;
        while index < state.pending.len() {
            if state.running.len() >= self.max_concurrency {
                break;
            }
            if state
                .running
                .contains_key(&state.pending[index].partition_key)
            {
                index += 1;
                continue;
            }

            let item = state
                .pending
                .remove(index)
                .expect("index bounded by loop condition");
            let run_id = state.next_run_id;
            state.next_run_id += 1;
            state.running.insert(
                item.partition_key.clone(),
                RunningTask {
                    run_id,
                    expires_at: item.timeout.map(|timeout| Instant::now() + timeout),
                },
            );

            let queue = Arc::clone(self);
            let partition_key = item.partition_key;
            let task = item.task;
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    error!("queued task for {partition_key:?} failed: {e:#}");
                }
                queue.complete(&partition_key, run_id);
            });
        }
    }

    fn complete(self: &Arc<Self>, partition_key: &str, run_id: u64) {
        let mut state = self.lock_state();
        match state.running.get(partition_key) {
            Some(running) if running.run_id == run_id => {
                state.running.remove(partition_key);
                self.dispatch_locked(&mut state);
                self.notify_if_idle(&state);
            }
            _ => {
                // The reaper evicted this run (and a successor may already
                // hold the slot): the completion belongs to an abandoned
                // task and must not release anything.
                debug!("discarding late completion for {partition_key:?} (run {run_id})");
            }
        }
    }

    /// Evicts running entries whose timeout has expired and hands their keys
    /// to waiting tasks.
    fn reap(self: &Arc<Self>) {
        let mut state = self.lock_state();
        let now = Instant::now();
        let expired: Vec<String> = state
            .running
            .iter()
            .filter(|(_, running)| matches!(running.expires_at, Some(at) if at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for key in expired {
            warn!("task for {key:?} exceeded its timeout, releasing the key");
            state.running.remove(&key);
        }
        self.dispatch_locked(&mut state);
        self.notify_if_idle(&state);
    }

    fn notify_if_idle(&self, state: &MutexGuard<'_, QueueState>) {
        if state.pending.is_empty() && state.running.is_empty() {
            self.idle.notify_waiters();
        }
    }
}
