//! In-process workflow runtime.
//!
//! Long-lived per-entity loops are registered under a stable id. Each loop
//! iteration parks on `select(timer, signal)`, runs activities on a bounded
//! worker pool, and either continues-as-new (a fresh context with the next
//! input) or completes. Inputs, signal payloads and activity arguments and
//! results all cross the boundary as MessagePack.
//!
//! Signals are coalescing: any number of sends before the loop next parks
//! wake it exactly once, carrying the latest payload.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::time::Instant;

use crate::error::{EngineError, EngineResult, ErrorReporter};

/// Finished workflow ids are remembered this long for reuse checks.
const FINISHED_RETENTION: Duration = Duration::from_secs(24 * 3600);

pub fn encode<T: Serialize + ?Sized>(value: &T) -> EngineResult<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> EngineResult<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Exponential backoff with jitter between activity attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    pub cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_ms: 500,
            factor: 2.0,
            jitter: 0.2,
            cap_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1) as f64;
        let mut delay = (self.base_ms as f64 * self.factor.powf(exp)).min(self.cap_ms as f64);
        if self.jitter > 0.0 {
            let jitter = rand::thread_rng().gen_range(-self.jitter..self.jitter);
            delay *= 1.0 + jitter;
        }
        Duration::from_millis(delay.max(0.0).round() as u64)
    }
}

#[derive(Clone, Debug)]
pub struct ActivityOptions {
    pub schedule_to_start: Duration,
    pub start_to_close: Duration,
    pub heartbeat: Duration,
    pub retry: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        ActivityOptions {
            schedule_to_start: Duration::from_secs(60),
            start_to_close: Duration::from_secs(60),
            heartbeat: Duration::from_secs(20),
            retry: RetryPolicy::default(),
        }
    }
}

/// What happens when a workflow is started under an id already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdReusePolicy {
    /// No-op while running, restart once finished.
    AllowDuplicate,
    /// No-op while running and after it finished: at most one run per id.
    RejectDuplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    AlreadyFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// How one execution ended.
#[derive(Debug)]
pub enum Next<I> {
    ContinueAsNew(I),
    Complete,
}

#[derive(Debug)]
pub enum Selected<T> {
    Timer,
    Signal(T),
}

#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut WorkflowContext, input: Self::Input) -> EngineResult<Next<Self::Input>>;
}

/// Liveness handle given to each activity attempt.
#[derive(Clone)]
pub struct Heartbeat {
    last: Arc<Mutex<Instant>>,
}

impl Heartbeat {
    fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn beat(&self) {
        *self.last.lock() = Instant::now();
    }

    async fn expired(&self, timeout: Duration) {
        loop {
            let deadline = *self.last.lock() + timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

#[derive(Default)]
struct SignalSlot {
    notify: Notify,
    latest: Mutex<Option<Vec<u8>>>,
}

#[derive(Default)]
struct Signals {
    slots: Mutex<HashMap<String, Arc<SignalSlot>>>,
}

impl Signals {
    fn slot(&self, name: &str) -> Arc<SignalSlot> {
        self.slots
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

struct Entry {
    status: WorkflowStatus,
    signals: Arc<Signals>,
    cancel: watch::Sender<bool>,
    finished_at: Option<Instant>,
}

struct Inner {
    workflows: Mutex<HashMap<String, Entry>>,
    workers: Arc<Semaphore>,
    options: ActivityOptions,
    reporter: Arc<dyn ErrorReporter>,
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub fn new(workers: usize, options: ActivityOptions, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                workflows: Mutex::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(workers.max(1))),
                options,
                reporter,
            }),
        }
    }

    pub fn reporter(&self) -> &Arc<dyn ErrorReporter> {
        &self.inner.reporter
    }

    pub fn start_workflow<W: Workflow>(
        &self,
        id: &str,
        workflow: Arc<W>,
        input: W::Input,
        policy: IdReusePolicy,
    ) -> EngineResult<StartOutcome> {
        let encoded = encode(&input)?;
        let (signals, cancel_rx) = {
            let mut workflows = self.inner.workflows.lock();
            let now = Instant::now();
            workflows.retain(|_, e| e.finished_at.map_or(true, |at| now - at < FINISHED_RETENTION));

            if let Some(existing) = workflows.get(id) {
                if existing.status == WorkflowStatus::Running {
                    return Ok(StartOutcome::AlreadyRunning);
                }
                if policy == IdReusePolicy::RejectDuplicate {
                    return Ok(StartOutcome::AlreadyFinished);
                }
            }

            let signals = Arc::new(Signals::default());
            let (cancel, cancel_rx) = watch::channel(false);
            workflows.insert(
                id.to_string(),
                Entry {
                    status: WorkflowStatus::Running,
                    signals: signals.clone(),
                    cancel,
                    finished_at: None,
                },
            );
            (signals, cancel_rx)
        };

        tracing::debug!(workflow_id = id, workflow = workflow.name(), "workflow started");
        tokio::spawn(drive(self.clone(), id.to_string(), workflow, encoded, signals, cancel_rx));
        Ok(StartOutcome::Started)
    }

    /// Pushes a message into a workflow's named signal channel.
    pub fn signal<T: Serialize>(&self, id: &str, name: &str, payload: &T) -> EngineResult<()> {
        let bytes = encode(payload)?;
        let signals = {
            let workflows = self.inner.workflows.lock();
            match workflows.get(id) {
                Some(entry) if entry.status == WorkflowStatus::Running => entry.signals.clone(),
                _ => return Err(EngineError::not_found(format!("workflow {id}"))),
            }
        };
        let slot = signals.slot(name);
        *slot.latest.lock() = Some(bytes);
        slot.notify.notify_one();
        Ok(())
    }

    /// Cancellation takes effect at the workflow's next suspension point.
    pub fn cancel(&self, id: &str) -> EngineResult<()> {
        let workflows = self.inner.workflows.lock();
        let entry = workflows
            .get(id)
            .ok_or_else(|| EngineError::not_found(format!("workflow {id}")))?;
        let _ = entry.cancel.send(true);
        Ok(())
    }

    pub fn shutdown(&self) {
        for entry in self.inner.workflows.lock().values() {
            let _ = entry.cancel.send(true);
        }
    }

    pub fn status(&self, id: &str) -> Option<WorkflowStatus> {
        self.inner.workflows.lock().get(id).map(|e| e.status)
    }

    pub fn running(&self) -> usize {
        self.inner
            .workflows
            .lock()
            .values()
            .filter(|e| e.status == WorkflowStatus::Running)
            .count()
    }

    fn finish(&self, id: &str, status: WorkflowStatus) {
        if let Some(entry) = self.inner.workflows.lock().get_mut(id) {
            entry.status = status;
            entry.finished_at = Some(Instant::now());
        }
    }

    async fn run_activity<I, O, F, Fut>(&self, name: &str, f: &F, input: I) -> EngineResult<Vec<u8>>
    where
        I: Send,
        O: Serialize + Send,
        F: Fn(Heartbeat, I) -> Fut + Send + Sync,
        Fut: Future<Output = EngineResult<O>> + Send,
    {
        let options = &self.inner.options;
        let _permit = tokio::time::timeout(
            options.schedule_to_start,
            self.inner.workers.clone().acquire_owned(),
        )
        .await
        .map_err(|_| EngineError::Timeout {
            activity: name.to_string(),
            stage: "schedule-to-start",
        })?
        .map_err(|_| EngineError::Cancelled)?;

        let heartbeat = Heartbeat::new();
        let output = tokio::select! {
            result = tokio::time::timeout(options.start_to_close, f(heartbeat.clone(), input)) => {
                result.map_err(|_| EngineError::Timeout {
                    activity: name.to_string(),
                    stage: "start-to-close",
                })??
            }
            _ = heartbeat.expired(options.heartbeat) => {
                return Err(EngineError::Timeout {
                    activity: name.to_string(),
                    stage: "heartbeat",
                });
            }
        };
        encode(&output)
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn drive<W: Workflow>(
    runtime: Runtime,
    id: String,
    workflow: Arc<W>,
    mut encoded: Vec<u8>,
    signals: Arc<Signals>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut run: u64 = 0;
    loop {
        let input: W::Input = match decode(&encoded) {
            Ok(input) => input,
            Err(err) => {
                runtime.inner.reporter.report(&id, &err);
                runtime.finish(&id, WorkflowStatus::Failed);
                return;
            }
        };
        let mut ctx = WorkflowContext {
            id: id.clone(),
            run,
            runtime: runtime.clone(),
            signals: signals.clone(),
        };

        let result = tokio::select! {
            result = workflow.run(&mut ctx, input) => result,
            _ = wait_cancelled(&mut cancel) => {
                tracing::info!(workflow_id = %id, "workflow cancelled");
                runtime.finish(&id, WorkflowStatus::Cancelled);
                return;
            }
        };

        match result {
            Ok(Next::ContinueAsNew(next)) => match encode(&next) {
                Ok(bytes) => {
                    encoded = bytes;
                    run += 1;
                }
                Err(err) => {
                    runtime.inner.reporter.report(&id, &err);
                    runtime.finish(&id, WorkflowStatus::Failed);
                    return;
                }
            },
            Ok(Next::Complete) => {
                tracing::debug!(workflow_id = %id, "workflow completed");
                runtime.finish(&id, WorkflowStatus::Completed);
                return;
            }
            Err(EngineError::StopRenew) => {
                tracing::info!(workflow_id = %id, "workflow stopped renewing");
                runtime.finish(&id, WorkflowStatus::Completed);
                return;
            }
            Err(err) => {
                runtime.inner.reporter.report(&id, &err);
                runtime.finish(&id, WorkflowStatus::Failed);
                return;
            }
        }
    }
}

/// Per-execution handle a workflow uses to suspend, run activities and
/// start children. A new one is built for every continue-as-new.
pub struct WorkflowContext {
    id: String,
    run: u64,
    runtime: Runtime,
    signals: Arc<Signals>,
}

impl WorkflowContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// How many times this workflow has continued-as-new.
    pub fn run_number(&self) -> u64 {
        self.run
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Parks until `after` elapses or signal `name` arrives, whichever is
    /// first. Taking the signal drops the timer.
    pub async fn select_timer_or_signal<T: DeserializeOwned>(
        &mut self,
        name: &str,
        after: Duration,
    ) -> EngineResult<Selected<T>> {
        let slot = self.signals.slot(name);
        tokio::select! {
            _ = slot.notify.notified() => {
                let bytes = slot.latest.lock().take();
                let payload = match bytes {
                    Some(bytes) => bytes,
                    None => encode(&())?,
                };
                Ok(Selected::Signal(decode(&payload)?))
            }
            _ = tokio::time::sleep(after) => Ok(Selected::Timer),
        }
    }

    pub async fn timer(&mut self, after: Duration) {
        tokio::time::sleep(after).await;
    }

    /// Runs `f` as an activity: input and output are encoded across the
    /// boundary, the attempt is bounded by the runtime's timeouts and
    /// retried with backoff while the error is transient.
    pub async fn execute_activity<I, O, F, Fut>(&self, name: &str, input: &I, f: F) -> EngineResult<O>
    where
        I: Serialize + DeserializeOwned + Send + Sync,
        O: Serialize + DeserializeOwned + Send,
        F: Fn(Heartbeat, I) -> Fut + Send + Sync,
        Fut: Future<Output = EngineResult<O>> + Send,
    {
        let encoded = encode(input)?;
        let retry = self.runtime.inner.options.retry.clone();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let input: I = decode(&encoded)?;
            match self.runtime.run_activity(name, &f, input).await {
                Ok(bytes) => return decode(&bytes),
                Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.next_delay(attempt);
                    tracing::warn!(
                        workflow_id = %self.id,
                        activity = name,
                        attempt,
                        error = %err,
                        "activity failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn start_child<W: Workflow>(
        &self,
        id: &str,
        workflow: Arc<W>,
        input: W::Input,
        policy: IdReusePolicy,
    ) -> EngineResult<StartOutcome> {
        self.runtime.start_workflow(id, workflow, input, policy)
    }
}
