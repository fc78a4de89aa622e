//! Pollable, awaitable and cancellable operation handles.
//!
//! A long-running operation is split into two halves:
//!
//! ```text
//! ProgressReporter (one writer)  ──watch──▶  Progress (many readers, cheap clone)
//!        ▲                                        │
//!        └────────── CancellationToken ◀──────────┘  cancel()
//! ```
//!
//! The reporter owns the write side. Percent is aggregated from weighted
//! operations, never decreases, and stays below 100 until the operation
//! completes successfully. The result slot is written once; later writes are
//! ignored. Cancellation only sets a flag: the writer observes it at its own
//! checkpoints.

use ovfimport_shared::errors::{ImportError, ImportResult, codes};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Snapshot of an operation's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    /// What the whole operation does ("Importing appliance ...").
    pub description: String,
    /// Aggregate completion, 0..=100.
    pub percent: u8,
    /// Label of the operation currently running.
    pub operation: String,
    /// 1-based index of the current operation, 0 before the first one.
    pub operation_index: u32,
    /// Number of operations, 0 when unknown.
    pub operation_count: u32,
    pub cancel_requested: bool,
    pub completed: bool,
    /// Set exactly once, together with `completed`.
    pub result: Option<ImportResult<()>>,
}

impl ProgressState {
    fn new(description: String) -> Self {
        Self {
            description,
            percent: 0,
            operation: String::new(),
            operation_index: 0,
            operation_count: 0,
            cancel_requested: false,
            completed: false,
            result: None,
        }
    }
}

struct Shared {
    state: watch::Sender<ProgressState>,
    cancel: CancellationToken,
}

/// Reader handle for a long-running operation.
#[derive(Clone)]
pub struct Progress {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Progress")
            .field("description", &state.description)
            .field("percent", &state.percent)
            .field("completed", &state.completed)
            .finish()
    }
}

impl Progress {
    /// Create a progress handle and its single writer.
    ///
    /// `total_weight` is the sum of the weights of all operations the writer
    /// will report; zero is treated as one.
    pub fn new(description: impl Into<String>, total_weight: u64) -> (Progress, ProgressReporter) {
        let (state, _) = watch::channel(ProgressState::new(description.into()));
        let shared = Arc::new(Shared {
            state,
            cancel: CancellationToken::new(),
        });

        let reporter = ProgressReporter {
            shared: Arc::clone(&shared),
            total_weight: total_weight.max(1),
            done_weight: 0,
            current_weight: 0,
            finished: false,
        };

        (Progress { shared }, reporter)
    }

    /// Current state snapshot.
    pub fn state(&self) -> ProgressState {
        self.shared.state.borrow().clone()
    }

    pub fn percent(&self) -> u8 {
        self.shared.state.borrow().percent
    }

    pub fn operation(&self) -> String {
        self.shared.state.borrow().operation.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state.borrow().completed
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Request cooperative cancellation.
    ///
    /// Returns false if the operation already completed. The writer stops at
    /// its next checkpoint, so completion may take a while after this call.
    pub fn cancel(&self) -> bool {
        if self.is_completed() {
            return false;
        }

        self.shared.cancel.cancel();
        self.shared.state.send_modify(|state| {
            state.cancel_requested = true;
        });
        tracing::debug!(
            description = %self.shared.state.borrow().description,
            "Cancellation requested"
        );
        true
    }

    /// Wait until the operation completes.
    ///
    /// With `timeout = None` waits indefinitely. Returns `Ok(true)` once
    /// completed and `Ok(false)` if the timeout elapsed first.
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> ImportResult<bool> {
        let mut rx = self.shared.state.subscribe();
        let wait = async move {
            rx.wait_for(|state| state.completed)
                .await
                .map(|_| ())
                .map_err(|_| ImportError::Internal("progress channel closed".into()))
        };

        match timeout {
            None => wait.await.map(|_| true),
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(result) => result.map(|_| true),
                Err(_) => Ok(false),
            },
        }
    }

    /// Final result, `None` while the operation is still running.
    pub fn result(&self) -> Option<ImportResult<()>> {
        self.shared.state.borrow().result.clone()
    }

    /// Numeric result code: `Some(0)` on success, the error's code on
    /// failure, `None` while running.
    pub fn result_code(&self) -> Option<i32> {
        self.shared
            .state
            .borrow()
            .result
            .as_ref()
            .map(|result| match result {
                Ok(()) => codes::SUCCESS,
                Err(e) => e.code(),
            })
    }

    /// Receiver that is notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.shared.state.subscribe()
    }
}

/// The single writer of a [`Progress`].
///
/// Not cloneable. Dropping a reporter that never completed settles the
/// progress with an internal error so that waiters are released.
pub struct ProgressReporter {
    shared: Arc<Shared>,
    total_weight: u64,
    done_weight: u64,
    current_weight: u64,
    finished: bool,
}

impl ProgressReporter {
    /// Start the next weighted operation, closing the previous one.
    pub fn begin_operation(&mut self, label: impl Into<String>, weight: u64) {
        self.done_weight = self.done_weight.saturating_add(self.current_weight);
        self.current_weight = weight;

        let label = label.into();
        let percent = self.percent_for(0);
        self.shared.state.send_modify(|state| {
            if state.completed {
                return;
            }
            state.operation = label;
            state.operation_index += 1;
            state.percent = state.percent.max(percent);
        });
    }

    /// Announce how many operations will be reported.
    pub fn set_operation_count(&mut self, count: u32) {
        self.shared.state.send_modify(|state| {
            state.operation_count = count;
        });
    }

    /// Report completion of the current operation, 0..=100.
    pub fn set_operation_percent(&mut self, percent: u8) {
        let percent = self.percent_for(percent.min(100));
        self.shared.state.send_modify(|state| {
            if !state.completed {
                state.percent = state.percent.max(percent);
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Token to await cancellation, e.g. inside `tokio::select!`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Fail with `Cancelled` once cancellation was requested.
    pub fn checkpoint(&self) -> ImportResult<()> {
        if self.is_cancelled() {
            let operation = self.shared.state.borrow().operation.clone();
            return Err(ImportError::Cancelled(if operation.is_empty() {
                "cancelled before start".to_string()
            } else {
                format!("cancelled during '{}'", operation)
            }));
        }
        Ok(())
    }

    /// Write the final result. Only the first call has an effect.
    pub fn complete(&mut self, result: ImportResult<()>) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Err(ref e) = result {
            tracing::debug!(error = %e, "Operation completed with error");
        }

        self.shared.state.send_modify(|state| {
            if result.is_ok() {
                state.percent = 100;
            }
            state.completed = true;
            state.result = Some(result);
        });
    }

    /// Reader handle for the same operation.
    pub fn progress(&self) -> Progress {
        Progress {
            shared: Arc::clone(&self.shared),
        }
    }

    fn percent_for(&self, operation_percent: u8) -> u8 {
        let partial = self.current_weight.saturating_mul(u64::from(operation_percent)) / 100;
        let done = self.done_weight.saturating_add(partial);
        let percent = done.saturating_mul(100) / self.total_weight;
        percent.min(99) as u8
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Progress reporter dropped before completion");
            self.complete(Err(ImportError::Internal(
                "operation ended without reporting a result".into(),
            )));
        }
    }
}
