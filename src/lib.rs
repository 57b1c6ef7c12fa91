//! Model-driven browser automation.
//!
//! Free-form model output is validated into a closed set of [`Action`]s
//! ([`validator`]), executed one at a time against a [`CapabilityProvider`]
//! ([`executor`]), and driven toward a goal by the [`Controller`] in either
//! plan mode or autonomous mode.

pub mod brain;
pub mod config;
pub mod controller;
pub mod dom;
pub mod error;
pub mod executor;
pub mod framing;
pub mod hands;
pub mod host;
pub mod logging;
pub mod types;
pub mod validator;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use brain::{CompletionOptions, InferenceService, OllamaClient};
pub use controller::{
    Controller, ControllerConfig, IterationOutcome, IterationRecord, LoopResult, LoopStatus,
    PlanFailure, PlanResult, ProgressEvent, StepRecord,
};
pub use error::{
    ControllerError, ExecutionErrorKind, InferenceError, ProviderFault, ValidationError,
};
pub use executor::{Executor, ExecutorConfig};
pub use hands::{BrowserConfig, CapabilityProvider, ChromeSession};
pub use types::{
    Action, ActionKind, Decision, ExecutionOutcome, Plan, ScrapedText, StateSnapshot,
};
