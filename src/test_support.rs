//! Scripted collaborators for driving the controller without a browser or a
//! model server.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::brain::{CompletionOptions, InferenceService};
use crate::error::{InferenceError, ProviderFault};
use crate::hands::CapabilityProvider;
use crate::types::StateSnapshot;

/// One call received by a [`ScriptedProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Navigate(String),
    Click(String),
    Fill(String, String),
    ReadText(String),
    Capture(PathBuf),
    Snapshot,
}

/// In-memory capability provider.
///
/// Faults are keyed by target (URL or selector). Reading a selector with no
/// scripted text fails with `ElementNotFound`.
#[derive(Debug)]
pub struct ScriptedProvider {
    calls: Vec<ProviderCall>,
    texts: HashMap<String, String>,
    faults: HashMap<String, ProviderFault>,
    hangs: HashSet<String>,
    snapshot_fault: Option<ProviderFault>,
    next_snapshot_faults: VecDeque<ProviderFault>,
    snapshot_hangs: bool,
    url: String,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            texts: HashMap::new(),
            faults: HashMap::new(),
            hangs: HashSet::new(),
            snapshot_fault: None,
            next_snapshot_faults: VecDeque::new(),
            snapshot_hangs: false,
            url: "about:blank".to_string(),
        }
    }

    pub fn with_text(mut self, selector: &str, text: &str) -> Self {
        self.texts.insert(selector.to_string(), text.to_string());
        self
    }

    pub fn fail_on(mut self, target: &str, fault: ProviderFault) -> Self {
        self.faults.insert(target.to_string(), fault);
        self
    }

    /// Calls against `target` never complete.
    pub fn hang_on(mut self, target: &str) -> Self {
        self.hangs.insert(target.to_string());
        self
    }

    pub fn fail_snapshots(mut self, fault: ProviderFault) -> Self {
        self.snapshot_fault = Some(fault);
        self
    }

    /// Fail one snapshot; queued faults are used up in order.
    pub fn fail_next_snapshot(mut self, fault: ProviderFault) -> Self {
        self.next_snapshot_faults.push_back(fault);
        self
    }

    /// Snapshots never complete.
    pub fn hang_snapshots(mut self) -> Self {
        self.snapshot_hangs = true;
        self
    }

    pub fn calls(&self) -> &[ProviderCall] {
        &self.calls
    }

    pub fn snapshot_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, ProviderCall::Snapshot))
            .count()
    }

    async fn check(&self, target: &str) -> Result<(), ProviderFault> {
        if self.hangs.contains(target) {
            std::future::pending::<()>().await;
        }
        match self.faults.get(target) {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CapabilityProvider for ScriptedProvider {
    async fn navigate_to(&mut self, url: &str) -> Result<(), ProviderFault> {
        self.calls.push(ProviderCall::Navigate(url.to_string()));
        self.check(url).await?;
        self.url = url.to_string();
        Ok(())
    }

    async fn click_element(&mut self, selector: &str) -> Result<(), ProviderFault> {
        self.calls.push(ProviderCall::Click(selector.to_string()));
        self.check(selector).await
    }

    async fn fill_element(&mut self, selector: &str, value: &str) -> Result<(), ProviderFault> {
        self.calls
            .push(ProviderCall::Fill(selector.to_string(), value.to_string()));
        self.check(selector).await
    }

    async fn read_text(&mut self, selector: &str) -> Result<String, ProviderFault> {
        self.calls.push(ProviderCall::ReadText(selector.to_string()));
        self.check(selector).await?;
        self.texts
            .get(selector)
            .cloned()
            .ok_or_else(|| ProviderFault::ElementNotFound(selector.to_string()))
    }

    async fn capture_image(&mut self, path: &Path) -> Result<(), ProviderFault> {
        self.calls.push(ProviderCall::Capture(path.to_path_buf()));
        self.check(&path.to_string_lossy()).await
    }

    async fn current_location_summary(&mut self) -> Result<StateSnapshot, ProviderFault> {
        self.calls.push(ProviderCall::Snapshot);
        if self.snapshot_hangs {
            std::future::pending::<()>().await;
        }
        if let Some(fault) = self.next_snapshot_faults.pop_front() {
            return Err(fault);
        }
        if let Some(ref fault) = self.snapshot_fault {
            return Err(fault.clone());
        }
        Ok(StateSnapshot {
            url: self.url.clone(),
            title: format!("Page at {}", self.url),
            content_length: self.calls.len(),
            outline: None,
        })
    }
}

/// Inference service that replays canned completions in order.
///
/// Once the script runs out it repeats the fallback reply if one was set,
/// otherwise it reports itself unavailable.
#[derive(Debug, Default)]
pub struct ScriptedInference {
    replies: Mutex<VecDeque<Result<String, InferenceError>>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedInference {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            ..Self::default()
        }
    }

    /// Always answer with `reply`.
    pub fn repeating(reply: impl Into<String>) -> Self {
        Self {
            fallback: Some(reply.into()),
            ..Self::default()
        }
    }

    pub fn then_error(self, err: InferenceError) -> Self {
        self.lock_replies().push_back(Err(err));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, InferenceError>>> {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    async fn complete(
        &self,
        prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, InferenceError> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(prompt.to_string());
        match self.lock_replies().pop_front() {
            Some(reply) => reply,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| InferenceError::Unavailable("script exhausted".into())),
        }
    }
}
