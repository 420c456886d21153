// Copyright 2026 bingo Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deferred task execution with bounded retries.

use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bingo_common::error::{Error, ErrorKind, Result};
use futures_core::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static>;

tokio::task_local! {
    /// Id of the task running on the current tokio task.
    static CURRENT_TASK: String;
}

/// A deferred unit of work with a fixed identity.
#[derive(Clone)]
pub struct Task {
    id: String,
    delay: Duration,
    run: TaskFn,
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("delay", &self.delay)
            .finish()
    }
}

impl Task {
    /// Create a task. `f` is called once per attempt.
    pub fn new<F, FU>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> FU + Send + Sync + 'static,
        FU: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            delay: Duration::ZERO,
            run: Arc::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(f()) }),
        }
    }

    /// Delay the first attempt.
    ///
    /// Default: no delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Task identity.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Result of [`TaskScheduler::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The task is queued.
    Queued,
    /// A task with the same id is already queued or running, the submission is a no-op.
    AlreadyQueued,
}

/// Retry policy of failed task attempts, exponential backoff capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first one.
    pub max_attempts: usize,
    /// Backoff after the first failure.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given failed attempt, counting from 1.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as u32;
        self.base_backoff.saturating_mul(1 << exp).min(self.max_backoff)
    }
}

/// Deferred execution with at-least-once delivery.
///
/// Submitting a task whose id is already queued, or running, is a no-op. The one exception is a running task
/// submitting its own successor, which is queued.
pub trait TaskScheduler: Send + Sync + Debug + 'static {
    /// Queue a task.
    fn submit(&self, task: Task) -> Result<SubmitOutcome>;
}

#[derive(Debug, Default)]
struct TaskIds {
    pending: HashSet<String>,
    // A successor may start before its predecessor returns.
    running: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    ids: Mutex<TaskIds>,
    closed: AtomicBool,
}

impl SchedulerState {
    fn start(self: &Arc<Self>, id: &str) -> Running {
        let mut ids = self.ids.lock();
        ids.pending.remove(id);
        *ids.running.entry(id.to_string()).or_default() += 1;
        Running {
            id: id.to_string(),
            state: self.clone(),
        }
    }
}

/// Marks a task as running until dropped.
struct Running {
    id: String,
    state: Arc<SchedulerState>,
}

impl Drop for Running {
    fn drop(&mut self) {
        let mut ids = self.state.ids.lock();
        if let Some(count) = ids.running.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                ids.running.remove(&self.id);
            }
        }
    }
}

/// [`TaskScheduler`] running tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
    retry: RetryPolicy,
    state: Arc<SchedulerState>,
}

impl TokioScheduler {
    /// Create a scheduler on the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            retry: RetryPolicy::default(),
            state: Arc::default(),
        }
    }

    /// Create a scheduler on the current runtime.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::new(ErrorKind::Scheduler, "no tokio runtime in context").with_source(e))?;
        Ok(Self::new(handle))
    }

    /// Set the retry policy.
    ///
    /// Default: 8 attempts, backoff from 1s up to 60s.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns `true` if a task with the given id is queued and not started yet.
    pub fn is_pending(&self, id: &str) -> bool {
        self.state.ids.lock().pending.contains(id)
    }

    /// Returns `true` if a task with the given id is running, retries and backoffs included.
    pub fn is_running(&self, id: &str) -> bool {
        self.state.ids.lock().running.contains_key(id)
    }

    /// Reject further submissions and drop queued tasks that have not started.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
    }

    /// Returns `true` if the scheduler is closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    async fn run(task: Task, retry: RetryPolicy, state: Arc<SchedulerState>) {
        tokio::time::sleep(task.delay).await;
        let _running = state.start(&task.id);

        let mut attempt = 0;
        loop {
            if state.closed.load(Ordering::Acquire) {
                tracing::debug!("[scheduler]: scheduler closed, drop task {}", task.id);
                return;
            }
            attempt += 1;
            match (task.run)().await {
                Ok(()) => return,
                Err(e) if attempt >= retry.max_attempts => {
                    tracing::error!(
                        "[scheduler]: task {} failed {attempt} times, give up, error: {e}",
                        task.id
                    );
                    return;
                }
                Err(e) => {
                    let backoff = retry.backoff(attempt);
                    tracing::warn!(
                        "[scheduler]: task {} failed, retry in {backoff:?}, attempt: {attempt}, error: {e}",
                        task.id
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

impl TaskScheduler for TokioScheduler {
    fn submit(&self, task: Task) -> Result<SubmitOutcome> {
        if self.is_closed() {
            return Err(Error::new(ErrorKind::Closed, "scheduler is closed").with_context("task", &task.id));
        }
        let successor = CURRENT_TASK.try_with(|current| current == &task.id).unwrap_or(false);
        {
            let mut ids = self.state.ids.lock();
            if ids.pending.contains(&task.id) {
                tracing::trace!("[scheduler]: task {} is already queued", task.id);
                return Ok(SubmitOutcome::AlreadyQueued);
            }
            if ids.running.contains_key(&task.id) && !successor {
                tracing::trace!("[scheduler]: task {} is running", task.id);
                return Ok(SubmitOutcome::AlreadyQueued);
            }
            ids.pending.insert(task.id.clone());
        }
        let id = task.id.clone();
        self.handle.spawn(CURRENT_TASK.scope(id, Self::run(task, self.retry.clone(), self.state.clone())));
        Ok(SubmitOutcome::Queued)
    }
}
