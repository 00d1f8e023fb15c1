//! Work scheduler behaviour with synthetic works.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use chronicle::app::{App, AppContext};
use chronicle::archive::ArchiveError;
use chronicle::work::{
    retry_once, Sequence, Work, WorkError, WorkScheduler, WorkState, WorkStep,
};
use common::accelerated_config;

struct StepWork {
    name: &'static str,
    remaining: u32,
    log: Arc<AtomicU32>,
}

#[async_trait]
impl Work for StepWork {
    fn name(&self) -> &str {
        self.name
    }

    async fn on_run(&mut self, _ctx: &AppContext) -> Result<WorkStep, WorkError> {
        self.log.fetch_add(1, Ordering::SeqCst);
        if self.remaining == 0 {
            return Ok(WorkStep::Complete);
        }
        self.remaining -= 1;
        Ok(WorkStep::Running)
    }
}

struct FailingWork;

#[async_trait]
impl Work for FailingWork {
    fn name(&self) -> &str {
        "failing"
    }

    async fn on_run(&mut self, _ctx: &AppContext) -> Result<WorkStep, WorkError> {
        Err(ArchiveError::Unavailable {
            name: "main".into(),
            message: "down".into(),
        }
        .into())
    }
}

async fn test_ctx() -> AppContext {
    App::build(accelerated_config(), vec![])
        .await
        .unwrap()
        .context()
        .clone()
}

#[tokio::test]
async fn works_advance_one_step_per_crank() {
    let ctx = test_ctx().await;
    let steps = Arc::new(AtomicU32::new(0));
    let mut scheduler = WorkScheduler::new();
    let handle = scheduler.add_work(Box::new(StepWork {
        name: "steps",
        remaining: 2,
        log: steps.clone(),
    }));

    assert_eq!(scheduler.crank(&ctx).await, 1);
    assert_eq!(steps.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.state_of(handle), WorkState::Running);
    scheduler.crank(&ctx).await;
    assert_eq!(scheduler.crank(&ctx).await, 0);
    assert_eq!(scheduler.state_of(handle), WorkState::Success);
    assert!(scheduler.all_done());
}

#[tokio::test]
async fn sequences_run_children_in_declared_order() {
    let ctx = test_ctx().await;
    let log = Arc::new(AtomicU32::new(0));
    let first = StepWork {
        name: "first",
        remaining: 0,
        log: log.clone(),
    };
    let second = StepWork {
        name: "second",
        remaining: 1,
        log: log.clone(),
    };
    let mut scheduler = WorkScheduler::new();
    let handle = scheduler.add_work(Box::new(Sequence::new(
        "pipeline",
        vec![Box::new(first), Box::new(second)],
    )));

    // first completes on crank 1; second needs two more cranks.
    scheduler.crank(&ctx).await;
    assert_eq!(log.load(Ordering::SeqCst), 1);
    scheduler.crank(&ctx).await;
    scheduler.crank(&ctx).await;
    assert_eq!(scheduler.state_of(handle), WorkState::Success);
    assert_eq!(log.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn reset_returns_a_sequence_to_its_first_child() {
    let ctx = test_ctx().await;
    let log = Arc::new(AtomicU32::new(0));
    let mut sequence = Sequence::new(
        "resettable",
        vec![
            Box::new(StepWork {
                name: "a",
                remaining: 0,
                log: log.clone(),
            }),
            Box::new(StepWork {
                name: "b",
                remaining: 0,
                log: log.clone(),
            }),
        ],
    );
    while sequence.on_run(&ctx).await.unwrap() == WorkStep::Running {}
    assert_eq!(log.load(Ordering::SeqCst), 2);

    sequence.on_reset();
    while sequence.on_run(&ctx).await.unwrap() == WorkStep::Running {}
    assert_eq!(log.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn failures_are_terminal_and_abort_tears_down() {
    let ctx = test_ctx().await;
    let mut scheduler = WorkScheduler::new();
    let failing = scheduler.add_work(Box::new(FailingWork));
    let live = scheduler.add_work(Box::new(StepWork {
        name: "live",
        remaining: 100,
        log: Arc::new(AtomicU32::new(0)),
    }));

    scheduler.crank(&ctx).await;
    assert_eq!(scheduler.state_of(failing), WorkState::Failed);
    assert!(scheduler.any_failed());

    scheduler.abort_all().await;
    assert_eq!(scheduler.state_of(live), WorkState::Aborted);
    assert!(scheduler.all_done());
}

#[tokio::test]
async fn crank_until_times_out_when_the_predicate_never_holds() {
    let ctx = test_ctx().await;
    let mut scheduler = WorkScheduler::new();
    let err = scheduler
        .crank_until(&ctx, || false, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn transient_failures_get_exactly_one_retry() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result: Result<u32, WorkError> = retry_once("get", || {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ArchiveError::Io {
                    message: "flaky".into(),
                }
                .into())
            } else {
                Ok(7)
            }
        }
    })
    .await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // Non-transient failures do not retry.
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result: Result<u32, WorkError> = retry_once("get", || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ArchiveError::NotFound {
                path: "x".into(),
            }
            .into())
        }
    })
    .await;
    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
