//! Cooperative units of history work.
//!
//! Everything that can block — archive transfers, gzip, bucket merges,
//! database statements — runs inside a [`Work`]. A Work makes one bounded
//! step of progress per `on_run` call and reports whether it is still
//! running, which is what lets the single-threaded scheduler interleave
//! publish and catchup deterministically under test cranking.
//!
//! Composition follows the pattern used throughout the crate: shared
//! behaviour is a trait, ordered composition is [`Sequence`].

pub mod scheduler;

pub use scheduler::{SchedulerError, WorkHandle, WorkScheduler, WorkState};

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tracing::warn;

use crate::app::AppContext;
use crate::archive::ArchiveError;
use crate::buckets::BucketError;
use crate::catchup::verify::VerifyError;
use crate::catchup::CatchupError;
use crate::history::HistoryFileError;
use crate::ledger::LedgerError;
use crate::publish::PublishError;
use crate::tmp::TmpDirError;

/// Result of one bounded step of progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkStep {
    Running,
    Complete,
}

/// Failure of a work unit, classified along the history error taxonomy.
#[derive(Debug, Error, Diagnostic)]
pub enum WorkError {
    #[error("transient i/o during {action}: {message}")]
    #[diagnostic(code(chronicle::work::transient))]
    Transient {
        action: &'static str,
        message: String,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bucket(#[from] BucketError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    HistoryFile(#[from] HistoryFileError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Catchup(#[from] CatchupError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tmp(#[from] TmpDirError),
}

impl WorkError {
    /// Transient failures earn one in-Work retry; everything else is
    /// terminal for the Work.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            WorkError::Transient { .. } => true,
            WorkError::Archive(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// A unit of the cooperative scheduler.
#[async_trait]
pub trait Work: Send {
    fn name(&self) -> &str;

    /// Make one bounded step of progress.
    async fn on_run(&mut self, ctx: &AppContext) -> Result<WorkStep, WorkError>;

    /// Return to the initial state; a subsequent `on_run` starts over.
    fn on_reset(&mut self) {}

    /// Tear down; returns true once the Work is safe to drop.
    ///
    /// Aborting must not touch durable queue state.
    async fn on_abort(&mut self) -> bool {
        true
    }
}

/// Run a fallible step, retrying once when the failure is transient.
pub async fn retry_once<T, F, Fut>(action: &'static str, mut step: F) -> Result<T, WorkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorkError>>,
{
    match step().await {
        Err(e) if e.is_transient() => {
            warn!(action, error = %e, "transient failure; retrying once");
            step().await
        }
        other => other,
    }
}

/// Ordered composition: children run to completion one after another.
pub struct Sequence {
    name: String,
    children: Vec<Box<dyn Work>>,
    index: usize,
}

impl Sequence {
    #[must_use]
    pub fn new(name: impl Into<String>, children: Vec<Box<dyn Work>>) -> Self {
        Self {
            name: name.into(),
            children,
            index: 0,
        }
    }
}

#[async_trait]
impl Work for Sequence {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_run(&mut self, ctx: &AppContext) -> Result<WorkStep, WorkError> {
        let Some(child) = self.children.get_mut(self.index) else {
            return Ok(WorkStep::Complete);
        };
        match child.on_run(ctx).await? {
            WorkStep::Running => Ok(WorkStep::Running),
            WorkStep::Complete => {
                self.index += 1;
                if self.index == self.children.len() {
                    Ok(WorkStep::Complete)
                } else {
                    Ok(WorkStep::Running)
                }
            }
        }
    }

    fn on_reset(&mut self) {
        for child in &mut self.children {
            child.on_reset();
        }
        self.index = 0;
    }

    async fn on_abort(&mut self) -> bool {
        match self.children.get_mut(self.index) {
            Some(child) => child.on_abort().await,
            None => true,
        }
    }
}
