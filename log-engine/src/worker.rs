// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The worker pool and its quiesce barrier.
//!
//! Workers are plain async loops spawned on the shared runtime. Every
//! loop passes a [`Checkpoint`] at its top; the main thread's sync
//! barrier ([`WorkerPool::sync_call`]) flips the pool gate, waits until
//! each member has finished its current event and parked at the
//! checkpoint, runs the critical section, and releases. Long waits
//! inside a worker (idle, backoff) must select on
//! [`Checkpoint::drain_signalled`] so the barrier is reached promptly.
//!
//! Shutdown runs through the same barrier: everyone parks, the stop
//! token fires inside the critical section, and the loops exit at their
//! checkpoints with no delivery in flight. Worker state that must
//! outlive a shutdown (the queues) lives outside the workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long the barrier waits for stragglers before proceeding.
const BARRIER_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for a loop to exit before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Gate {
    /// True while the barrier holds the pool.
    drain: watch::Sender<bool>,
    /// Members currently parked at their checkpoint.
    parked: AtomicUsize,
    parked_changed: Notify,
}

/// A worker's view of its pool: the barrier yield point and the stop
/// signal.
#[derive(Clone)]
pub struct Checkpoint {
    gate: Arc<Gate>,
    stop: CancellationToken,
}

impl Checkpoint {
    /// The yield point at the top of every worker loop.
    ///
    /// Parks while the barrier is held; returns `false` once the pool is
    /// stopping and the loop should exit.
    pub async fn pause_point(&self) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        let mut drain = self.gate.drain.subscribe();
        if !*drain.borrow_and_update() {
            return true;
        }

        self.gate.parked.fetch_add(1, Ordering::AcqRel);
        self.gate.parked_changed.notify_waiters();
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                changed = drain.changed() => {
                    if changed.is_err() || !*drain.borrow_and_update() {
                        break;
                    }
                }
            }
        }
        self.gate.parked.fetch_sub(1, Ordering::AcqRel);
        self.gate.parked_changed.notify_waiters();
        !self.stop.is_cancelled()
    }

    /// Resolves when the barrier wants the pool quiesced. Long waits in
    /// a worker select on this so they fall through to the checkpoint.
    pub async fn drain_signalled(&self) {
        let mut drain = self.gate.drain.subscribe();
        while !*drain.borrow_and_update() {
            if drain.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }
}

struct Member {
    name: String,
    task: JoinHandle<()>,
}

/// Owns the worker tasks of one engine graph.
pub struct WorkerPool {
    gate: Arc<Gate>,
    stop: CancellationToken,
    members: Vec<Member>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool::new()
    }
}

impl WorkerPool {
    pub fn new() -> WorkerPool {
        let (drain, _) = watch::channel(false);
        WorkerPool {
            gate: Arc::new(Gate {
                drain,
                parked: AtomicUsize::new(0),
                parked_changed: Notify::new(),
            }),
            stop: CancellationToken::new(),
            members: Vec::new(),
        }
    }

    /// Spawn one worker loop. The loop owns its state; it is handed a
    /// [`Checkpoint`] and is expected to pass it on every iteration.
    pub fn spawn<F, Fut>(&mut self, name: &str, rt: &Handle, work: F)
    where
        F: FnOnce(Checkpoint) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let checkpoint = Checkpoint {
            gate: Arc::clone(&self.gate),
            stop: self.stop.child_token(),
        };
        let task = rt.spawn(work(checkpoint));
        self.members.push(Member {
            name: name.to_string(),
            task,
        });
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The worker sync barrier: quiesce every member, run the critical
    /// section with the pool parked, then release.
    ///
    /// The critical section may touch state the workers otherwise own;
    /// no event is in flight while it runs.
    pub async fn sync_call<R>(&self, critical: impl FnOnce() -> R) -> R {
        self.gate.drain.send_replace(true);
        let deadline = tokio::time::Instant::now() + BARRIER_TIMEOUT;
        loop {
            let live = self
                .members
                .iter()
                .filter(|member| !member.task.is_finished())
                .count();
            if self.gate.parked.load(Ordering::Acquire) >= live {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("sync barrier timed out waiting for workers");
                break;
            }
            tokio::select! {
                _ = self.gate.parked_changed.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(5)) => {}
            }
        }
        let result = critical();
        self.gate.drain.send_replace(false);
        result
    }

    /// Park everyone, fire the stop token while nothing is in flight,
    /// then wait for the loops to exit through their checkpoints.
    pub async fn shutdown(self) {
        self.sync_call(|| self.stop.cancel()).await;
        for mut member in self.members {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut member.task)
                .await
                .is_err()
            {
                member.task.abort();
                tracing::warn!(worker = member.name.as_str(), "worker stalled at shutdown, aborted");
            }
        }
    }
}
