//! Retryable asynchronous operations composed into sequential pipelines.
//!
//! Each operation wraps one unit of work that signals `Continue` (done,
//! proceed) or `Retry` (run again, up to the retry bound). An operation that
//! exhausts its retries still lets the surrounding sequence proceed: recovery
//! is best effort, never all-or-nothing. Cancellation stops a not-yet-started
//! operation cold and lets an in-flight attempt finish without scheduling
//! another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

/// What one execution of a step's body reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Retry,
}

#[async_trait]
pub trait SyncStep<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, cx: &mut C) -> StepOutcome;
}

/// Shared cancellation flag. Cloning hands out another handle to the same
/// flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationExit {
    Finished,
    RetriesExhausted,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct OperationReport {
    pub name: &'static str,
    pub exit: OperationExit,
    pub executions: usize,
}

/// One retryable unit of work. Terminal once finished or cancelled: a second
/// `execute` returns the recorded report without running the body again.
pub struct RetryableOperation<C: Send> {
    step: Box<dyn SyncStep<C>>,
    max_retries: usize,
    retry_delay: Duration,
    cancel: CancellationHandle,
    report: Option<OperationReport>,
}

impl<C: Send> RetryableOperation<C> {
    pub fn new(step: impl SyncStep<C> + 'static, max_retries: usize, retry_delay: Duration) -> Self {
        Self {
            step: Box::new(step),
            max_retries,
            retry_delay,
            cancel: CancellationHandle::new(),
            report: None,
        }
    }

    pub fn with_cancellation(mut self, handle: CancellationHandle) -> Self {
        self.cancel = handle;
        self
    }

    pub fn cancellation(&self) -> CancellationHandle {
        self.cancel.clone()
    }

    pub async fn execute(&mut self, cx: &mut C) -> OperationReport {
        if let Some(report) = self.report {
            return report;
        }
        let name = self.step.name();

        if self.cancel.is_cancelled() {
            return *self.report.insert(OperationReport {
                name,
                exit: OperationExit::Cancelled,
                executions: 0,
            });
        }

        let mut executions = 0;
        let mut retries = 0;
        let exit = loop {
            executions += 1;
            let outcome = self.step.run(cx).await;
            if self.cancel.is_cancelled() {
                // The in-flight attempt is observed but nothing further is
                // scheduled, whatever the body asked for.
                break OperationExit::Finished;
            }
            match outcome {
                StepOutcome::Continue => break OperationExit::Finished,
                StepOutcome::Retry => {
                    if retries >= self.max_retries {
                        warn!(step = name, executions, "retries exhausted; proceeding");
                        break OperationExit::RetriesExhausted;
                    }
                    retries += 1;
                    debug!(step = name, retry = retries, "step asked to retry");
                    tokio::time::sleep(backoff(self.retry_delay, retries)).await;
                }
            }
        };
        *self.report.insert(OperationReport {
            name,
            exit,
            executions,
        })
    }
}

fn backoff(base: Duration, attempt: usize) -> Duration {
    let scaled = base.saturating_mul(attempt as u32);
    if scaled.is_zero() {
        return scaled;
    }
    let jitter_ceiling = (scaled.as_millis() as u64 / 5).max(1);
    scaled + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ceiling))
}

/// Strictly sequential composition: each operation waits for the previous to
/// finish, and all of them share one mutable context.
pub struct OperationSequence<C: Send> {
    name: &'static str,
    ops: Vec<RetryableOperation<C>>,
    cancel: CancellationHandle,
}

impl<C: Send> OperationSequence<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ops: Vec::new(),
            cancel: CancellationHandle::new(),
        }
    }

    pub fn with_cancellation(mut self, handle: CancellationHandle) -> Self {
        self.cancel = handle;
        self
    }

    pub fn push(&mut self, op: RetryableOperation<C>) {
        self.ops.push(op.with_cancellation(self.cancel.clone()));
    }

    pub fn cancellation(&self) -> CancellationHandle {
        self.cancel.clone()
    }

    pub async fn run(&mut self, cx: &mut C) -> Vec<OperationReport> {
        let mut reports = Vec::with_capacity(self.ops.len());
        for op in &mut self.ops {
            let report = op.execute(cx).await;
            match report.exit {
                OperationExit::Finished => {
                    debug!(sequence = self.name, step = report.name, executions = report.executions, "step finished")
                }
                OperationExit::RetriesExhausted => {
                    warn!(sequence = self.name, step = report.name, "step gave up; continuing")
                }
                OperationExit::Cancelled => {
                    debug!(sequence = self.name, step = report.name, "step cancelled")
                }
            }
            reports.push(report);
        }
        reports
    }
}
