//! Autonomous runs: one decision per iteration against a fresh snapshot.

use async_trait::async_trait;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use webpilot::controller::MIN_ITERATION_DELAY;
use webpilot::test_support::{ProviderCall, ScriptedInference, ScriptedProvider};
use webpilot::{
    Action, CompletionOptions, Controller, ControllerConfig, ControllerError, ExecutionErrorKind,
    Executor, InferenceError, InferenceService, IterationOutcome, LoopStatus, ProgressEvent,
    ProviderFault, ValidationError,
};

fn controller<I: InferenceService>(inference: I) -> Controller<I> {
    Controller::new(inference, Executor::default(), ControllerConfig::default())
}

fn limit(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap()
}

/// Never answers.
struct StalledInference;

#[async_trait]
impl InferenceService for StalledInference {
    async fn complete(
        &self,
        _prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, InferenceError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn done_on_first_iteration_reaches_goal() {
    let inference =
        ScriptedInference::new([r#"{"action": "done", "reasoning": "already there"}"#]);
    let mut provider = ScriptedProvider::new();

    let run = controller(inference)
        .run_autonomous(&mut provider, "check the page", limit(5), &CancellationToken::new())
        .await;

    assert_eq!(run.status, LoopStatus::GoalReached);
    assert_eq!(run.iterations_run(), 1);
    assert_eq!(run.iterations[0].outcome, IterationOutcome::Stop);
    assert_eq!(run.last_reasoning(), Some("already there"));
    assert_eq!(provider.calls(), &[ProviderCall::Snapshot]);
}

#[tokio::test(start_paused = true)]
async fn malformed_output_every_time_exhausts_the_limit() {
    let inference = ScriptedInference::repeating("Sure! Let me think about that.");
    let mut provider = ScriptedProvider::new();

    let run = controller(inference)
        .run_autonomous(&mut provider, "goal", limit(3), &CancellationToken::new())
        .await;

    assert_eq!(run.status, LoopStatus::IterationLimitReached);
    assert_eq!(run.iterations_run(), 3);
    for (i, record) in run.iterations.iter().enumerate() {
        assert_eq!(record.iteration, i as u32 + 1);
        assert!(matches!(
            record.outcome,
            IterationOutcome::ValidationFailed {
                error: ValidationError::Malformed { .. }
            }
        ));
    }
    assert_eq!(provider.snapshot_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn every_iteration_decides_from_a_fresh_snapshot() {
    let inference = ScriptedInference::new([
        r#"{"action": "navigate", "url": "https://news.test"}"#,
        r##"{"action": "click", "selector": "#top-story"}"##,
        r#"{"action": "done"}"#,
    ]);
    let mut provider = ScriptedProvider::new();

    let ctl = controller(inference);
    let run = ctl
        .run_autonomous(&mut provider, "open the top story", limit(3), &CancellationToken::new())
        .await;

    assert_eq!(run.status, LoopStatus::GoalReached);
    assert_eq!(provider.snapshot_count(), 3);
    let urls: Vec<_> = run.iterations.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(urls, ["about:blank", "https://news.test", "https://news.test"]);

    let prompts = ctl.inference().prompts();
    assert!(prompts[0].contains("Iteration 1/3"));
    assert!(prompts[0].contains("URL: about:blank"));
    assert!(prompts[1].contains("Iteration 2/3"));
    assert!(prompts[1].contains("URL: https://news.test"));
}

#[tokio::test(start_paused = true)]
async fn a_failed_action_is_recorded_and_the_loop_continues() {
    let inference = ScriptedInference::new([
        r##"{"action": "click", "selector": "#missing"}"##,
        r#"{"action": "done"}"#,
    ]);
    let mut provider = ScriptedProvider::new()
        .fail_on("#missing", ProviderFault::ElementNotFound("#missing".into()));

    let run = controller(inference)
        .run_autonomous(&mut provider, "goal", limit(5), &CancellationToken::new())
        .await;

    assert_eq!(run.status, LoopStatus::GoalReached);
    let IterationOutcome::Executed { ref outcome, .. } = run.iterations[0].outcome else {
        panic!("expected an executed action");
    };
    assert_eq!(outcome.error_kind(), Some(ExecutionErrorKind::ProviderFault));
}

#[tokio::test(start_paused = true)]
async fn a_hanging_action_times_out_without_ending_the_run() {
    let inference = ScriptedInference::new([
        r#"{"action": "click", "selector": "button.slow"}"#,
        r#"{"action": "done"}"#,
    ]);
    let mut provider = ScriptedProvider::new().hang_on("button.slow");

    let run = controller(inference)
        .run_autonomous(&mut provider, "goal", limit(5), &CancellationToken::new())
        .await;

    assert_eq!(run.status, LoopStatus::GoalReached);
    let IterationOutcome::Executed { ref outcome, .. } = run.iterations[0].outcome else {
        panic!("expected an executed action");
    };
    assert_eq!(outcome.error_kind(), Some(ExecutionErrorKind::Timeout));
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_runs_nothing() {
    let inference = ScriptedInference::repeating(r#"{"action": "done"}"#);
    let mut provider = ScriptedProvider::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let ctl = controller(inference);
    let run = ctl
        .run_autonomous(&mut provider, "goal", limit(5), &cancel)
        .await;

    assert_eq!(run.status, LoopStatus::Aborted);
    assert_eq!(run.iterations_run(), 0);
    assert!(provider.calls().is_empty());
    assert!(ctl.inference().prompts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_during_a_run_lets_the_current_action_finish() {
    let inference = ScriptedInference::repeating(r#"{"action": "navigate", "url": "https://a.test"}"#);
    let (tx, mut rx) = broadcast::channel(16);
    let ctl = controller(inference).with_events(tx);
    let mut provider = ScriptedProvider::new();
    let cancel = CancellationToken::new();

    let stopper = async {
        while let Ok(event) = rx.recv().await {
            if matches!(event, ProgressEvent::Step { .. }) {
                cancel.cancel();
                break;
            }
        }
    };
    let (run, ()) = tokio::join!(
        ctl.run_autonomous(&mut provider, "goal", limit(10), &cancel),
        stopper
    );

    assert_eq!(run.status, LoopStatus::Aborted);
    assert_eq!(run.iterations_run(), 1);
    assert!(matches!(
        run.iterations[0].outcome,
        IterationOutcome::Executed { ref outcome, .. } if outcome.is_ok()
    ));
    assert!(provider
        .calls()
        .contains(&ProviderCall::Navigate("https://a.test".into())));
}

#[tokio::test(start_paused = true)]
async fn provider_unavailable_mid_run_fails_the_run() {
    let inference = ScriptedInference::repeating(r#"{"action": "navigate", "url": "https://gone.test"}"#);
    let mut provider = ScriptedProvider::new().fail_on(
        "https://gone.test",
        ProviderFault::Unavailable("browser closed".into()),
    );

    let ctl = controller(inference);
    let run = ctl
        .run_autonomous(&mut provider, "goal", limit(5), &CancellationToken::new())
        .await;

    assert!(matches!(
        run.status,
        LoopStatus::Failed {
            error: ControllerError::ProviderUnavailable { .. }
        }
    ));
    assert_eq!(run.iterations_run(), 1);
    assert_eq!(ctl.inference().prompts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn snapshot_failure_fails_the_run() {
    let inference = ScriptedInference::repeating(r#"{"action": "done"}"#);
    let mut provider =
        ScriptedProvider::new().fail_snapshots(ProviderFault::Unavailable("no tab".into()));

    let run = controller(inference)
        .run_autonomous(&mut provider, "goal", limit(5), &CancellationToken::new())
        .await;

    assert!(matches!(
        run.status,
        LoopStatus::Failed {
            error: ControllerError::ProviderUnavailable { .. }
        }
    ));
    assert_eq!(run.iterations_run(), 0);
}

#[tokio::test(start_paused = true)]
async fn inference_failure_keeps_the_history_so_far() {
    let inference = ScriptedInference::new([r#"{"action": "navigate", "url": "https://a.test"}"#])
        .then_error(InferenceError::Unavailable("connection refused".into()));
    let mut provider = ScriptedProvider::new();

    let run = controller(inference)
        .run_autonomous(&mut provider, "goal", limit(5), &CancellationToken::new())
        .await;

    assert!(matches!(
        run.status,
        LoopStatus::Failed {
            error: ControllerError::InferenceUnavailable { .. }
        }
    ));
    assert_eq!(run.iterations_run(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_inference_times_out() {
    let config = ControllerConfig {
        inference_timeout: Duration::from_secs(5),
        ..ControllerConfig::default()
    };
    let ctl = Controller::new(StalledInference, Executor::default(), config);
    let mut provider = ScriptedProvider::new();

    let run = ctl
        .run_autonomous(&mut provider, "goal", limit(5), &CancellationToken::new())
        .await;

    assert_eq!(
        run.status,
        LoopStatus::Failed {
            error: ControllerError::InferenceTimeout { timeout_secs: 5 }
        }
    );
}

#[tokio::test(start_paused = true)]
async fn iterations_are_paced_by_at_least_the_floor() {
    let config = ControllerConfig {
        iteration_delay: Duration::ZERO,
        ..ControllerConfig::default()
    };
    let ctl = Controller::new(
        ScriptedInference::repeating("not json"),
        Executor::default(),
        config,
    );
    let mut provider = ScriptedProvider::new();

    let started = Instant::now();
    let run = ctl
        .run_autonomous(&mut provider, "goal", limit(3), &CancellationToken::new())
        .await;

    assert_eq!(run.status, LoopStatus::IterationLimitReached);
    // Two pauses between three iterations, none after the last.
    assert!(started.elapsed() >= MIN_ITERATION_DELAY * 2);
    assert!(started.elapsed() < MIN_ITERATION_DELAY * 3);
}

#[tokio::test(start_paused = true)]
async fn scraped_text_is_collected_with_its_slot() {
    let inference = ScriptedInference::new([
        r#"{"action": "scrape", "params": {"selector": "h1", "into": "headline"}}"#,
        r#"{"action": "done", "reasoning": "got the headline"}"#,
    ]);
    let mut provider = ScriptedProvider::new().with_text("h1", "Rust 2024 released");

    let run = controller(inference)
        .run_autonomous(&mut provider, "read the headline", limit(5), &CancellationToken::new())
        .await;

    assert_eq!(run.status, LoopStatus::GoalReached);
    assert_eq!(run.results.len(), 1);
    assert_eq!(run.results[0].slot.as_deref(), Some("headline"));
    assert_eq!(run.results[0].text, "Rust 2024 released");
    assert!(matches!(
        run.iterations[0].outcome,
        IterationOutcome::Executed {
            action: Action::Scrape { .. },
            ..
        }
    ));

    let value = serde_json::to_value(&run).unwrap();
    assert_eq!(value["status"], "goal_reached");
    assert_eq!(value["iterations"][1]["kind"], "stop");
}

#[tokio::test(start_paused = true)]
async fn stop_is_observed_while_a_snapshot_hangs() {
    let inference = ScriptedInference::repeating(r#"{"action": "done"}"#);
    let mut provider = ScriptedProvider::new().hang_snapshots();
    let cancel = CancellationToken::new();

    let ctl = controller(inference);
    let stopper = async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
    };
    let started = Instant::now();
    let (run, ()) = tokio::join!(
        ctl.run_autonomous(&mut provider, "goal", limit(5), &cancel),
        stopper
    );

    assert_eq!(run.status, LoopStatus::Aborted);
    assert_eq!(run.iterations_run(), 0);
    assert!(started.elapsed() < Duration::from_secs(11));
    assert!(ctl.inference().prompts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn a_hanging_snapshot_is_bounded_by_the_action_timeout() {
    let inference = ScriptedInference::repeating(r#"{"action": "done"}"#);
    let mut provider = ScriptedProvider::new().hang_snapshots();

    let run = controller(inference)
        .run_autonomous(&mut provider, "goal", limit(2), &CancellationToken::new())
        .await;

    assert_eq!(run.status, LoopStatus::IterationLimitReached);
    assert_eq!(run.iterations_run(), 2);
    for record in &run.iterations {
        assert!(matches!(
            record.outcome,
            IterationOutcome::SnapshotFailed {
                error_kind: ExecutionErrorKind::Timeout,
                ..
            }
        ));
    }
}

#[tokio::test(start_paused = true)]
async fn a_transient_snapshot_fault_skips_one_iteration() {
    let inference = ScriptedInference::new([r#"{"action": "done", "reasoning": "page settled"}"#]);
    let mut provider = ScriptedProvider::new().fail_next_snapshot(ProviderFault::Other(
        "Execution context was destroyed".into(),
    ));

    let ctl = controller(inference);
    let run = ctl
        .run_autonomous(&mut provider, "goal", limit(5), &CancellationToken::new())
        .await;

    assert_eq!(run.status, LoopStatus::GoalReached);
    assert_eq!(run.iterations_run(), 2);
    assert_eq!(
        run.iterations[0].outcome,
        IterationOutcome::SnapshotFailed {
            error_kind: ExecutionErrorKind::ProviderFault,
            message: "Execution context was destroyed".into(),
        }
    );
    assert_eq!(run.iterations[1].outcome, IterationOutcome::Stop);
    assert_eq!(ctl.inference().prompts().len(), 1);
    assert_eq!(provider.snapshot_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_status_serializes_beside_the_history() {
    let inference = ScriptedInference::repeating(r#"{"action": "done"}"#);
    let mut provider =
        ScriptedProvider::new().fail_snapshots(ProviderFault::Unavailable("no tab".into()));

    let run = controller(inference)
        .run_autonomous(&mut provider, "goal", limit(5), &CancellationToken::new())
        .await;

    let value = serde_json::to_value(&run).unwrap();
    assert_eq!(value["status"], "failed");
    assert_eq!(value["error"]["kind"], "provider_unavailable");
    assert_eq!(value["goal"], "goal");
}
