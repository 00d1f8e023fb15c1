//! Single-threaded cooperative work scheduler.
//!
//! The scheduler owns every active Work and advances each one step per
//! `crank`. There is no parallelism inside one crank — order of progress is
//! the order works were added — which keeps interleavings reproducible for
//! tests driving the loop through [`crank_until`](WorkScheduler::crank_until).

use std::time::{Duration, Instant};

use miette::Diagnostic;
use thiserror::Error;
use tracing::{info, warn};

use super::{Work, WorkStep};
use crate::app::AppContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkState {
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
}

impl WorkState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkState::Success | WorkState::Failed | WorkState::Aborted)
    }
}

/// Identifies one scheduled work for later state queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkHandle(usize);

#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("crank_until timed out after {elapsed:?}")]
    #[diagnostic(
        code(chronicle::scheduler::timeout),
        help("The predicate never held within the wall-clock budget; treat the driven operation as failed.")
    )]
    Timeout { elapsed: Duration },
}

struct Slot {
    work: Box<dyn Work>,
    state: WorkState,
}

/// Owns and advances the node's active works.
#[derive(Default)]
pub struct WorkScheduler {
    slots: Vec<Slot>,
}

impl WorkScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_work(&mut self, work: Box<dyn Work>) -> WorkHandle {
        self.slots.push(Slot {
            work,
            state: WorkState::Pending,
        });
        WorkHandle(self.slots.len() - 1)
    }

    #[must_use]
    pub fn state_of(&self, handle: WorkHandle) -> WorkState {
        self.slots[handle.0].state
    }

    /// No work is pending or running.
    #[must_use]
    pub fn all_done(&self) -> bool {
        self.slots.iter().all(|s| s.state.is_terminal())
    }

    #[must_use]
    pub fn any_failed(&self) -> bool {
        self.slots.iter().any(|s| s.state == WorkState::Failed)
    }

    /// Advance every live work one step; returns how many are still live.
    pub async fn crank(&mut self, ctx: &AppContext) -> usize {
        let mut live = 0;
        for slot in &mut self.slots {
            if slot.state.is_terminal() {
                continue;
            }
            slot.state = WorkState::Running;
            match slot.work.on_run(ctx).await {
                Ok(WorkStep::Running) => live += 1,
                Ok(WorkStep::Complete) => {
                    info!(work = slot.work.name(), "work complete");
                    slot.state = WorkState::Success;
                }
                Err(e) => {
                    warn!(work = slot.work.name(), error = %e, "work failed");
                    slot.state = WorkState::Failed;
                }
            }
        }
        live
    }

    /// Crank until `predicate` holds with the scheduler idle, or the
    /// wall-clock budget runs out.
    pub async fn crank_until<P>(
        &mut self,
        ctx: &AppContext,
        mut predicate: P,
        timeout: Duration,
    ) -> Result<(), SchedulerError>
    where
        P: FnMut() -> bool,
    {
        let start = Instant::now();
        loop {
            if self.all_done() && predicate() {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(SchedulerError::Timeout {
                    elapsed: start.elapsed(),
                });
            }
            self.crank(ctx).await;
            tokio::task::yield_now().await;
        }
    }

    /// Abort every live work, tearing children down.
    pub async fn abort_all(&mut self) {
        for slot in &mut self.slots {
            if slot.state.is_terminal() {
                continue;
            }
            if slot.work.on_abort().await {
                slot.state = WorkState::Aborted;
            }
        }
    }

    /// Forget finished works, keeping handles of live ones invalid-free.
    pub fn prune_terminal(&mut self) {
        // Handles are positional; only safe when nothing holds one. Callers
        // do this between operations, not mid-flight.
        self.slots.retain(|s| !s.state.is_terminal());
    }
}
