use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::error::ExecutionErrorKind;

/// A single atomic action the model asks the agent to perform.
///
/// Serializes to the same wire shape the validator accepts, so a validated
/// action can be fed back through [`crate::validator::validate_action`]
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Fill {
        selector: String,
        value: String,
    },
    Scrape {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        into: Option<String>,
    },
    Wait {
        millis: u64,
    },
    Screenshot {
        path: String,
    },
    Done,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Navigate { .. } => ActionKind::Navigate,
            Action::Click { .. } => ActionKind::Click,
            Action::Fill { .. } => ActionKind::Fill,
            Action::Scrape { .. } => ActionKind::Scrape,
            Action::Wait { .. } => ActionKind::Wait,
            Action::Screenshot { .. } => ActionKind::Screenshot,
            Action::Done => ActionKind::Done,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Action::Done)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Navigate { url } => write!(f, "navigate to {url}"),
            Action::Click { selector } => write!(f, "click {selector}"),
            Action::Fill { selector, value } => write!(f, "fill {selector} with {value:?}"),
            Action::Scrape {
                selector,
                into: Some(slot),
            } => write!(f, "scrape {selector} into {slot}"),
            Action::Scrape { selector, .. } => write!(f, "scrape {selector}"),
            Action::Wait { millis } => write!(f, "wait {millis}ms"),
            Action::Screenshot { path } => write!(f, "screenshot to {path}"),
            Action::Done => f.write_str("done"),
        }
    }
}

/// Fieldless discriminator of [`Action`], used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Fill,
    Scrape,
    Wait,
    Screenshot,
    Done,
}

impl ActionKind {
    pub const ALL: [ActionKind; 7] = [
        ActionKind::Navigate,
        ActionKind::Click,
        ActionKind::Fill,
        ActionKind::Scrape,
        ActionKind::Wait,
        ActionKind::Screenshot,
        ActionKind::Done,
    ];

    /// Resolve a wire discriminator. Matching is case-insensitive and
    /// accepts `goto` as an alias of `navigate`.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "navigate" | "goto" => Some(ActionKind::Navigate),
            "click" => Some(ActionKind::Click),
            "fill" => Some(ActionKind::Fill),
            "scrape" => Some(ActionKind::Scrape),
            "wait" => Some(ActionKind::Wait),
            "screenshot" => Some(ActionKind::Screenshot),
            "done" => Some(ActionKind::Done),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::Scrape => "scrape",
            ActionKind::Wait => "wait",
            ActionKind::Screenshot => "screenshot",
            ActionKind::Done => "done",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered batch of actions produced by one inference call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub steps: Vec<Action>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// One action plus the model's stated reasoning, used by the iterative loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// What the agent observes before asking the model for its next move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub url: String,
    pub title: String,
    pub content_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outline: Option<String>,
}

impl StateSnapshot {
    /// Text block embedded in prompts.
    pub fn describe(&self) -> String {
        let mut text = format!(
            "URL: {}\nTitle: {}\nContent length: {} chars",
            self.url, self.title, self.content_length
        );
        if let Some(ref outline) = self.outline {
            text.push_str("\n\nInteractive elements:\n");
            text.push_str(outline);
        }
        text
    }
}

/// Result of running one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Ok {
        data: Option<String>,
    },
    Err {
        kind: ExecutionErrorKind,
        message: String,
    },
}

impl ExecutionOutcome {
    pub fn ok() -> Self {
        ExecutionOutcome::Ok { data: None }
    }

    pub fn with_data(data: impl Into<String>) -> Self {
        ExecutionOutcome::Ok {
            data: Some(data.into()),
        }
    }

    pub fn err(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        ExecutionOutcome::Err {
            kind,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionOutcome::Ok { .. })
    }

    pub fn data(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Ok { data } => data.as_deref(),
            ExecutionOutcome::Err { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ExecutionErrorKind> {
        match self {
            ExecutionOutcome::Ok { .. } => None,
            ExecutionOutcome::Err { kind, .. } => Some(*kind),
        }
    }
}

/// Text captured by a `Scrape` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapedText {
    pub selector: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    pub text: String,
}

pub const DEFAULT_SCRAPE_SELECTOR: &str = "body";
pub const DEFAULT_SCREENSHOT_PATH: &str = "screenshot.png";
pub const DEFAULT_WAIT: Duration = Duration::from_secs(1);
pub const MAX_WAIT: Duration = Duration::from_secs(30);
pub const DOM_SNAPSHOT_MAX_CHARS: usize = 4000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_resolve_case_insensitively() {
        assert_eq!(ActionKind::from_wire("Navigate"), Some(ActionKind::Navigate));
        assert_eq!(ActionKind::from_wire("goto"), Some(ActionKind::Navigate));
        assert_eq!(ActionKind::from_wire(" SCRAPE "), Some(ActionKind::Scrape));
        assert_eq!(ActionKind::from_wire("hover"), None);
    }

    #[test]
    fn every_kind_round_trips_through_its_wire_name() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_wire(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn scrape_without_slot_omits_into() {
        let action = Action::Scrape {
            selector: "body".into(),
            into: None,
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value, serde_json::json!({"action": "scrape", "selector": "body"}));
    }

    #[test]
    fn snapshot_description_lists_outline_when_present() {
        let mut snapshot = StateSnapshot {
            url: "https://example.test/".into(),
            title: "Example".into(),
            content_length: 42,
            outline: None,
        };
        assert_eq!(
            snapshot.describe(),
            "URL: https://example.test/\nTitle: Example\nContent length: 42 chars"
        );

        snapshot.outline = Some("[e0] link \"More\"".into());
        assert!(snapshot.describe().ends_with("Interactive elements:\n[e0] link \"More\""));
    }
}
