use std::any::Any;
use std::fmt;

use thiserror::Error;

/// Error raised by a unit of work.
#[derive(Debug, Error)]
pub enum TaskError {
    /// An ordinary failure; the worker keeps pulling further work.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
    /// The designated abort signal: remaining work in the pool is abandoned
    /// as soon as possible.
    #[error("work aborted: {0}")]
    Abort(anyhow::Error),
}

impl TaskError {
    /// Raises the abort signal with the given message.
    pub fn abort(message: impl fmt::Display) -> Self {
        TaskError::Abort(anyhow::anyhow!("{message}"))
    }
}

/// Error returned when work is offered to a pool that has fully terminated.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("work pool is closed")]
pub struct PoolClosed;

/// Error returned by the draining pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The aggregated failure record of the drained work. The pool itself
    /// drained successfully.
    #[error(transparent)]
    Execution(#[from] ExecutionFailure),
    /// The cancellation monitor fired while waiting for the drain. The pool
    /// is still alive with its outstanding work.
    #[error("wait for the pool to drain was cancelled")]
    WaitCancelled,
    /// The pool was already permanently closed.
    #[error(transparent)]
    Closed(#[from] PoolClosed),
}

/// The most severe failure category present in an [`ExecutionFailure`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// At least one unit of work raised an ordinary failure (or panicked).
    Failed,
    /// At least one unit of work raised the abort signal.
    Aborted,
    /// Execution was cancelled and offered work was left undone.
    Cancelled,
}

/// The aggregated failure record of a pool, surfaced at synchronization
/// points (`close`, `reset`).
///
/// Every captured failure is carried, never only the first. The
/// [`kind`](Self::kind) reflects the most severe category present:
/// ordinary failures win over aborts, which win over cancellations;
/// cancellations alone count only when offered work was actually left
/// undone.
#[derive(Debug)]
pub struct ExecutionFailure {
    kind: FailureKind,
    failures: Vec<anyhow::Error>,
    aborts: Vec<anyhow::Error>,
    cancellations: Vec<String>,
}

impl ExecutionFailure {
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Ordinary failures raised by units of work, including panics.
    pub fn failures(&self) -> &[anyhow::Error] {
        &self.failures
    }

    /// Abort signals raised by units of work.
    pub fn aborts(&self) -> &[anyhow::Error] {
        &self.aborts
    }

    /// Reasons recorded for cancellations.
    pub fn cancellations(&self) -> &[String] {
        &self.cancellations
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Failed => {
                write!(f, "{} unit(s) of work failed", self.failures.len())?
            }
            FailureKind::Aborted => {
                write!(f, "execution aborted by {} unit(s) of work", self.aborts.len())?
            }
            FailureKind::Cancelled => write!(f, "execution cancelled with work left undone")?,
        }
        if !self.aborts.is_empty() && self.kind != FailureKind::Aborted {
            write!(f, "; {} abort(s)", self.aborts.len())?;
        }
        if !self.cancellations.is_empty() && self.kind != FailureKind::Cancelled {
            write!(f, "; {} cancellation(s)", self.cancellations.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutionFailure {}

/// The accumulating failure record shared by all pool variants. Guarded by
/// the owning pool's state lock.
#[derive(Debug, Default)]
pub(crate) struct FailureLog {
    failures: Vec<anyhow::Error>,
    aborts: Vec<anyhow::Error>,
    cancellations: Vec<String>,
}

impl FailureLog {
    pub(crate) fn record(&mut self, err: TaskError) {
        match err {
            TaskError::Failed(err) => {
                tracing::warn!(error = %err, "unit of work failed");
                self.failures.push(err);
            }
            TaskError::Abort(err) => {
                tracing::warn!(error = %err, "unit of work raised the abort signal");
                self.aborts.push(err);
            }
        }
    }

    pub(crate) fn record_panic(&mut self, payload: Box<dyn Any + Send>) {
        let message = panic_message(payload.as_ref());
        tracing::error!(message, "unit of work panicked");
        self.failures
            .push(anyhow::anyhow!("unit of work panicked: {message}"));
    }

    pub(crate) fn record_failure(&mut self, err: anyhow::Error) {
        tracing::error!(error = %err, "pool failure");
        self.failures.push(err);
    }

    pub(crate) fn record_cancellation(&mut self, reason: impl Into<String>) {
        self.cancellations.push(reason.into());
    }

    pub(crate) fn has_abort(&self) -> bool {
        !self.aborts.is_empty()
    }

    pub(crate) fn take(&mut self) -> FailureLog {
        std::mem::take(self)
    }

    /// Converts the record into the exception surfaced to the caller, or
    /// `None` when there is nothing to report.
    pub(crate) fn into_failure(self, work_left_undone: bool) -> Option<ExecutionFailure> {
        let kind = if !self.failures.is_empty() {
            FailureKind::Failed
        } else if !self.aborts.is_empty() {
            FailureKind::Aborted
        } else if !self.cancellations.is_empty() && work_left_undone {
            FailureKind::Cancelled
        } else {
            return None;
        };
        Some(ExecutionFailure {
            kind,
            failures: self.failures,
            aborts: self.aborts,
            cancellations: self.cancellations,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_take_precedence_over_aborts_and_cancels() {
        let mut log = FailureLog::default();
        log.record(TaskError::abort("stop"));
        log.record(TaskError::Failed(anyhow::anyhow!("broken")));
        log.record_cancellation("monitor");

        let failure = log.into_failure(true).unwrap();
        assert_eq!(failure.kind(), FailureKind::Failed);
        // Nothing is discarded.
        assert_eq!(failure.failures().len(), 1);
        assert_eq!(failure.aborts().len(), 1);
        assert_eq!(failure.cancellations().len(), 1);
    }

    #[test]
    fn cancellations_count_only_with_undone_work() {
        let mut log = FailureLog::default();
        log.record_cancellation("monitor");
        assert!(log.take().into_failure(false).is_none());

        let mut log = FailureLog::default();
        log.record_cancellation("monitor");
        let failure = log.into_failure(true).unwrap();
        assert_eq!(failure.kind(), FailureKind::Cancelled);
    }

    #[test]
    fn empty_log_reports_nothing() {
        assert!(FailureLog::default().into_failure(true).is_none());
    }
}
