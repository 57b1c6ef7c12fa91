use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ExecutionErrorKind;
use crate::hands::CapabilityProvider;
use crate::types::{Action, ActionKind, ExecutionOutcome, MAX_WAIT};

const SCRAPE_LOG_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Upper bound on any single provider call.
    pub action_timeout: Duration,
    /// `Wait` actions longer than this are shortened to it.
    pub max_wait: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(30),
            max_wait: MAX_WAIT,
        }
    }
}

/// Runs one validated action against a capability provider.
///
/// Every failure comes back as [`ExecutionOutcome::Err`]; nothing is
/// retried here. An action whose kind has no registered handler yields
/// [`ExecutionErrorKind::Unhandled`] without touching the provider.
#[derive(Debug, Clone)]
pub struct Executor {
    handlers: BTreeSet<ActionKind>,
    config: ExecutorConfig,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl Executor {
    /// Executor with a handler registered for every action kind.
    pub fn new(config: ExecutorConfig) -> Self {
        Self::with_handlers(ActionKind::ALL, config)
    }

    pub fn with_handlers(
        kinds: impl IntoIterator<Item = ActionKind>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            handlers: kinds.into_iter().collect(),
            config,
        }
    }

    /// Unregister the handler for `kind`.
    pub fn without(mut self, kind: ActionKind) -> Self {
        self.handlers.remove(&kind);
        self
    }

    pub fn handles(&self, kind: ActionKind) -> bool {
        self.handlers.contains(&kind)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn execute<P>(&self, action: &Action, provider: &mut P) -> ExecutionOutcome
    where
        P: CapabilityProvider + ?Sized,
    {
        let kind = action.kind();
        if !self.handles(kind) {
            warn!(%kind, "no handler registered");
            return ExecutionOutcome::err(
                ExecutionErrorKind::Unhandled,
                format!("no handler registered for `{kind}`"),
            );
        }

        info!(%action, "executing");
        let result = match action {
            Action::Navigate { url } => self.bounded(provider.navigate_to(url)).await.map(|()| None),
            Action::Click { selector } => {
                self.bounded(provider.click_element(selector)).await.map(|()| None)
            }
            Action::Fill { selector, value } => self
                .bounded(provider.fill_element(selector, value))
                .await
                .map(|()| None),
            Action::Scrape { selector, .. } => {
                self.bounded(provider.read_text(selector)).await.map(|text| {
                    let shown: String = text.chars().take(SCRAPE_LOG_CHARS).collect();
                    info!(%selector, chars = text.len(), scraped = %shown, "scraped");
                    Some(text)
                })
            }
            Action::Wait { millis } => {
                self.pause(Duration::from_millis(*millis)).await;
                Ok(None)
            }
            Action::Screenshot { path } => self
                .bounded(provider.capture_image(Path::new(path)))
                .await
                .map(|()| None),
            Action::Done => Ok(None),
        };

        match result {
            Ok(data) => ExecutionOutcome::Ok { data },
            Err(failed) => {
                warn!(%action, outcome = ?failed, "action failed");
                failed
            }
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ExecutionOutcome>
    where
        F: Future<Output = Result<T, crate::error::ProviderFault>>,
    {
        match tokio::time::timeout(self.config.action_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(fault)) => Err(ExecutionOutcome::err(fault.kind(), fault.to_string())),
            Err(_) => Err(ExecutionOutcome::err(
                ExecutionErrorKind::Timeout,
                format!(
                    "no response from provider within {}s",
                    self.config.action_timeout.as_secs()
                ),
            )),
        }
    }

    async fn pause(&self, requested: Duration) {
        let capped = requested.min(self.config.max_wait);
        if capped < requested {
            warn!(
                requested_ms = requested.as_millis() as u64,
                capped_ms = capped.as_millis() as u64,
                "wait capped"
            );
        }
        tokio::time::sleep(capped).await;
    }
}
