//! Goal-directed control loop.
//!
//! Two modes share one controller:
//!
//! - **Plan mode** ([`Controller::run_plan`]): one inference call yields a
//!   whole plan, which is executed step by step. An unparseable plan fails
//!   the run before any action executes. A failing step does not stop the
//!   steps after it.
//! - **Autonomous mode** ([`Controller::run_autonomous`]): one decision per
//!   iteration, at most `max_iterations` iterations. Malformed decisions are
//!   recorded and the loop moves on.
//!
//! Suspension points are the state snapshot, the inference call, each
//! executed action, and the pause between autonomous iterations. Each is
//! bounded by a timeout. Cancellation is observed at an iteration boundary,
//! while the snapshot is taken and during the pause, never mid-action.

use serde::Serialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::brain::{self, CompletionOptions, InferenceService};
use crate::error::{ControllerError, ExecutionErrorKind, ProviderFault, ValidationError};
use crate::executor::Executor;
use crate::hands::CapabilityProvider;
use crate::types::{Action, ExecutionOutcome, Plan, ScrapedText, StateSnapshot};
use crate::validator;

/// Floor for the pause between autonomous iterations.
pub const MIN_ITERATION_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Pause after each autonomous iteration. Never shorter than
    /// [`MIN_ITERATION_DELAY`].
    pub iteration_delay: Duration,
    /// Upper bound on one inference round trip.
    pub inference_timeout: Duration,
    pub completion: CompletionOptions,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            iteration_delay: Duration::from_secs(1),
            inference_timeout: brain::DEFAULT_TIMEOUT,
            completion: CompletionOptions::default(),
        }
    }
}

impl ControllerConfig {
    pub fn effective_delay(&self) -> Duration {
        self.iteration_delay.max(MIN_ITERATION_DELAY)
    }
}

/// Progress notifications for live observers (the dashboard's SSE feed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Thinking { iteration: u32 },
    Step { number: usize, description: String },
    StepError { number: usize, message: String },
    InvalidOutput { iteration: u32, message: String },
    TaskComplete { summary: String },
    TaskError { message: String },
}

/// One executed plan step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub action: Action,
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PlanFailure {
    InvalidPlan { error: ValidationError },
    Unavailable { error: ControllerError },
}

/// Terminal state of a plan-mode run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanResult {
    Done {
        plan: Plan,
        steps: Vec<StepRecord>,
        results: Vec<ScrapedText>,
    },
    Failed {
        #[serde(flatten)]
        reason: PlanFailure,
    },
}

impl PlanResult {
    /// True when the plan parsed. Per-step failures live in the outcomes.
    pub fn success(&self) -> bool {
        matches!(self, PlanResult::Done { .. })
    }

    pub fn outcomes(&self) -> Vec<&ExecutionOutcome> {
        match self {
            PlanResult::Done { steps, .. } => steps.iter().map(|s| &s.outcome).collect(),
            PlanResult::Failed { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IterationOutcome {
    Executed {
        action: Action,
        outcome: ExecutionOutcome,
    },
    ValidationFailed {
        error: ValidationError,
    },
    /// The state could not be read this iteration; nothing was asked or run.
    SnapshotFailed {
        error_kind: ExecutionErrorKind,
        message: String,
    },
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationRecord {
    pub iteration: u32,
    /// Location the decision was made from.
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(flatten)]
    pub outcome: IterationOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoopStatus {
    GoalReached,
    IterationLimitReached,
    Aborted,
    Failed { error: ControllerError },
}

/// Everything an autonomous run did, owned by the caller once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopResult {
    pub goal: String,
    pub max_iterations: u32,
    pub iterations: Vec<IterationRecord>,
    #[serde(flatten)]
    pub status: LoopStatus,
    pub results: Vec<ScrapedText>,
}

impl LoopResult {
    fn new(goal: &str, max_iterations: NonZeroU32) -> Self {
        Self {
            goal: goal.to_string(),
            max_iterations: max_iterations.get(),
            iterations: Vec::new(),
            status: LoopStatus::IterationLimitReached,
            results: Vec::new(),
        }
    }

    pub fn iterations_run(&self) -> usize {
        self.iterations.len()
    }

    pub fn last_reasoning(&self) -> Option<&str> {
        self.iterations
            .iter()
            .rev()
            .find_map(|record| record.reasoning.as_deref())
    }
}

pub struct Controller<I> {
    inference: I,
    executor: Executor,
    config: ControllerConfig,
    events: Option<broadcast::Sender<ProgressEvent>>,
}

impl<I: InferenceService> Controller<I> {
    pub fn new(inference: I, executor: Executor, config: ControllerConfig) -> Self {
        Self {
            inference,
            executor,
            config,
            events: None,
        }
    }

    /// Publish progress to `events` while running.
    pub fn with_events(mut self, events: broadcast::Sender<ProgressEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn inference(&self) -> &I {
        &self.inference
    }

    /// Ask for a whole plan once and execute every step of it in order.
    #[instrument(skip_all, fields(task = %validator::preview(task)))]
    pub async fn run_plan<P>(&self, provider: &mut P, task: &str) -> PlanResult
    where
        P: CapabilityProvider + ?Sized,
    {
        let snapshot = match self.observe(provider).await {
            Ok(snapshot) => snapshot,
            Err(fault) => {
                return self.plan_failed(PlanFailure::Unavailable {
                    error: ControllerError::from_snapshot_fault(fault),
                });
            }
        };

        self.emit(ProgressEvent::Thinking { iteration: 1 });
        let raw = match self.ask(&brain::plan_prompt(task, &snapshot)).await {
            Ok(raw) => raw,
            Err(error) => return self.plan_failed(PlanFailure::Unavailable { error }),
        };

        let plan = match validator::parse_plan(&raw) {
            Ok(plan) => plan,
            Err(error) => return self.plan_failed(PlanFailure::InvalidPlan { error }),
        };
        info!(steps = plan.len(), "executing plan");

        let mut steps = Vec::with_capacity(plan.len());
        let mut results = Vec::new();
        for (index, action) in plan.steps.iter().enumerate() {
            let number = index + 1;
            self.emit(ProgressEvent::Step {
                number,
                description: action.to_string(),
            });
            let outcome = self.executor.execute(action, provider).await;
            self.note_outcome(number, action, &outcome, &mut results);
            steps.push(StepRecord {
                index,
                action: action.clone(),
                outcome,
            });
        }

        let failed = steps.iter().filter(|s| !s.outcome.is_ok()).count();
        info!(steps = steps.len(), failed, "plan finished");
        self.emit(ProgressEvent::TaskComplete {
            summary: format!("executed {} steps, {failed} failed", steps.len()),
        });
        PlanResult::Done {
            plan,
            steps,
            results,
        }
    }

    /// Decide and act one step at a time until the model says `done`, the
    /// iteration limit is hit, `cancel` fires, or a collaborator becomes
    /// unavailable.
    #[instrument(skip_all, fields(goal = %validator::preview(goal), max_iterations = max_iterations.get()))]
    pub async fn run_autonomous<P>(
        &self,
        provider: &mut P,
        goal: &str,
        max_iterations: NonZeroU32,
        cancel: &CancellationToken,
    ) -> LoopResult
    where
        P: CapabilityProvider + ?Sized,
    {
        let mut run = LoopResult::new(goal, max_iterations);
        let max = max_iterations.get();

        for iteration in 1..=max {
            if cancel.is_cancelled() {
                info!(iteration, "stop requested");
                return self.finish(run, LoopStatus::Aborted);
            }

            // Always a fresh snapshot; a stale one would mislead the model.
            let observed = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(iteration, "stop requested while reading state");
                    return self.finish(run, LoopStatus::Aborted);
                }
                observed = self.observe(provider) => observed,
            };

            match observed {
                Ok(snapshot) => {
                    self.emit(ProgressEvent::Thinking { iteration });
                    let prompt = brain::decision_prompt(goal, &snapshot, iteration, max);
                    let raw = match self.ask(&prompt).await {
                        Ok(raw) => raw,
                        Err(error) => return self.finish(run, LoopStatus::Failed { error }),
                    };

                    if let Some(status) =
                        self.iterate(provider, &mut run, iteration, &snapshot, &raw).await
                    {
                        return self.finish(run, status);
                    }
                }
                Err(ProviderFault::Unavailable(message)) => {
                    let error = ControllerError::ProviderUnavailable { message };
                    return self.finish(run, LoopStatus::Failed { error });
                }
                Err(fault) => self.snapshot_failed(&mut run, iteration, fault),
            }

            if iteration < max {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.effective_delay()) => {}
                }
            }
        }

        self.finish(run, LoopStatus::IterationLimitReached)
    }

    /// Validate and act on one decision. Returns a terminal status when the
    /// loop must stop.
    async fn iterate<P>(
        &self,
        provider: &mut P,
        run: &mut LoopResult,
        iteration: u32,
        snapshot: &StateSnapshot,
        raw: &str,
    ) -> Option<LoopStatus>
    where
        P: CapabilityProvider + ?Sized,
    {
        let decision = match validator::parse_decision(raw) {
            Ok(decision) => decision,
            Err(error) => {
                self.emit(ProgressEvent::InvalidOutput {
                    iteration,
                    message: error.to_string(),
                });
                run.iterations.push(IterationRecord {
                    iteration,
                    url: snapshot.url.clone(),
                    reasoning: None,
                    outcome: IterationOutcome::ValidationFailed { error },
                });
                return None;
            }
        };

        if let Some(ref reasoning) = decision.reasoning {
            info!(iteration, %reasoning, "model decision");
        }

        if decision.action.is_done() {
            run.iterations.push(IterationRecord {
                iteration,
                url: snapshot.url.clone(),
                reasoning: decision.reasoning,
                outcome: IterationOutcome::Stop,
            });
            return Some(LoopStatus::GoalReached);
        }

        let number = iteration as usize;
        self.emit(ProgressEvent::Step {
            number,
            description: decision.action.to_string(),
        });
        let outcome = self.executor.execute(&decision.action, provider).await;
        self.note_outcome(number, &decision.action, &outcome, &mut run.results);

        let status = match outcome {
            ExecutionOutcome::Err {
                kind: ExecutionErrorKind::ProviderUnavailable,
                ref message,
            } => Some(LoopStatus::Failed {
                error: ControllerError::ProviderUnavailable {
                    message: message.clone(),
                },
            }),
            _ => None,
        };
        run.iterations.push(IterationRecord {
            iteration,
            url: snapshot.url.clone(),
            reasoning: decision.reasoning,
            outcome: IterationOutcome::Executed {
                action: decision.action,
                outcome,
            },
        });
        status
    }

    /// Read the current state, bounded by the executor's action timeout.
    async fn observe<P>(&self, provider: &mut P) -> Result<StateSnapshot, ProviderFault>
    where
        P: CapabilityProvider + ?Sized,
    {
        let timeout = self.executor.config().action_timeout;
        match tokio::time::timeout(timeout, provider.current_location_summary()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderFault::Timeout(format!(
                "no snapshot within {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Record a snapshot fault the run can recover from.
    fn snapshot_failed(&self, run: &mut LoopResult, iteration: u32, fault: ProviderFault) {
        warn!(iteration, error = %fault, "could not read state, skipping iteration");
        self.emit(ProgressEvent::StepError {
            number: iteration as usize,
            message: fault.to_string(),
        });
        let url = run
            .iterations
            .last()
            .map(|record| record.url.clone())
            .unwrap_or_default();
        run.iterations.push(IterationRecord {
            iteration,
            url,
            reasoning: None,
            outcome: IterationOutcome::SnapshotFailed {
                error_kind: fault.kind(),
                message: fault.to_string(),
            },
        });
    }

    async fn ask(&self, prompt: &str) -> Result<String, ControllerError> {
        let timeout = self.config.inference_timeout;
        match tokio::time::timeout(timeout, self.inference.complete(prompt, &self.config.completion))
            .await
        {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(e)) => {
                warn!(error = %e, "inference failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "inference timed out");
                Err(ControllerError::InferenceTimeout {
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    fn note_outcome(
        &self,
        number: usize,
        action: &Action,
        outcome: &ExecutionOutcome,
        results: &mut Vec<ScrapedText>,
    ) {
        match (action, outcome) {
            (
                Action::Scrape { selector, into },
                ExecutionOutcome::Ok { data: Some(text) },
            ) => results.push(ScrapedText {
                selector: selector.clone(),
                slot: into.clone(),
                text: text.clone(),
            }),
            (_, ExecutionOutcome::Err { message, .. }) => self.emit(ProgressEvent::StepError {
                number,
                message: message.clone(),
            }),
            _ => {}
        }
    }

    fn plan_failed(&self, reason: PlanFailure) -> PlanResult {
        warn!(?reason, "plan failed");
        self.emit(ProgressEvent::TaskError {
            message: match &reason {
                PlanFailure::InvalidPlan { error } => format!("invalid plan: {error}"),
                PlanFailure::Unavailable { error } => error.to_string(),
            },
        });
        PlanResult::Failed { reason }
    }

    fn finish(&self, mut run: LoopResult, status: LoopStatus) -> LoopResult {
        info!(iterations = run.iterations.len(), ?status, "autonomous run finished");
        self.emit(match &status {
            LoopStatus::GoalReached => ProgressEvent::TaskComplete {
                summary: run
                    .last_reasoning()
                    .map(String::from)
                    .unwrap_or_else(|| "goal reached".to_string()),
            },
            LoopStatus::IterationLimitReached => ProgressEvent::TaskError {
                message: format!("reached maximum iterations ({})", run.max_iterations),
            },
            LoopStatus::Aborted => ProgressEvent::TaskError {
                message: "stopped".to_string(),
            },
            LoopStatus::Failed { error } => ProgressEvent::TaskError {
                message: error.to_string(),
            },
        });
        run.status = status;
        run
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(ref events) = self.events {
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_delay_has_a_floor() {
        let config = ControllerConfig {
            iteration_delay: Duration::ZERO,
            ..ControllerConfig::default()
        };
        assert_eq!(config.effective_delay(), MIN_ITERATION_DELAY);

        let config = ControllerConfig::default();
        assert_eq!(config.effective_delay(), Duration::from_secs(1));
    }

    #[test]
    fn plan_result_serializes_with_status_tag() {
        let result = PlanResult::Failed {
            reason: PlanFailure::InvalidPlan {
                error: ValidationError::malformed("empty response"),
            },
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["reason"], "invalid_plan");
        assert_eq!(value["error"]["kind"], "malformed");
        assert!(!result.success());
    }

    #[test]
    fn last_reasoning_skips_records_without_it() {
        let mut run = LoopResult::new("g", NonZeroU32::new(3).unwrap());
        run.iterations.push(IterationRecord {
            iteration: 1,
            url: "about:blank".into(),
            reasoning: Some("open the site".into()),
            outcome: IterationOutcome::Stop,
        });
        run.iterations.push(IterationRecord {
            iteration: 2,
            url: "about:blank".into(),
            reasoning: None,
            outcome: IterationOutcome::ValidationFailed {
                error: ValidationError::malformed("x"),
            },
        });
        assert_eq!(run.last_reasoning(), Some("open the site"));
    }
}
