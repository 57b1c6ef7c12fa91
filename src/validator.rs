//! Turns untrusted model output into actions from the closed vocabulary.
//!
//! Nothing here touches the browser. Every input either becomes a value of
//! [`Action`], [`Plan`] or [`Decision`], or a [`ValidationError`]; no input
//! panics.

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::ValidationError;
use crate::types::{
    Action, ActionKind, DEFAULT_SCRAPE_SELECTOR, DEFAULT_SCREENSHOT_PATH, DEFAULT_WAIT, Decision,
    Plan,
};

const PREVIEW_CHARS: usize = 200;

/// Parse a multi-step plan: `{"steps": [...]}` or a bare array of actions.
pub fn parse_plan(raw: &str) -> Result<Plan, ValidationError> {
    parse_json(raw)
        .and_then(|value| validate_plan(&value))
        .inspect_err(|err| warn!(error = %err, raw = %preview(raw), "rejected plan"))
}

/// Parse a single decision: one action object plus optional `reasoning`.
pub fn parse_decision(raw: &str) -> Result<Decision, ValidationError> {
    parse_json(raw)
        .and_then(|value| validate_decision(&value))
        .inspect_err(|err| warn!(error = %err, raw = %preview(raw), "rejected decision"))
}

pub fn validate_plan(value: &Value) -> Result<Plan, ValidationError> {
    let items: &[Value] = match value {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("steps") {
            None | Some(Value::Null) => &[],
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ValidationError::malformed(format!(
                    "`steps` must be an array, got {}",
                    type_name(other)
                )));
            }
        },
        other => {
            return Err(ValidationError::malformed(format!(
                "plan must be an object or array, got {}",
                type_name(other)
            )));
        }
    };

    let steps = items
        .iter()
        .map(validate_action)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Plan { steps })
}

pub fn validate_decision(value: &Value) -> Result<Decision, ValidationError> {
    let action = validate_action(value)?;
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);
    Ok(Decision { action, reasoning })
}

/// Match one action object against the vocabulary by its `action` field.
///
/// Fields are looked up in a nested `params` object first, then at the top
/// level, so both `{"action":"click","selector":"a"}` and
/// `{"action":"click","params":{"selector":"a"}}` are accepted.
pub fn validate_action(value: &Value) -> Result<Action, ValidationError> {
    let obj = value.as_object().ok_or_else(|| {
        ValidationError::malformed(format!(
            "action must be an object, got {}",
            type_name(value)
        ))
    })?;

    let name = match obj.get("action") {
        Some(Value::String(name)) => name,
        Some(other) => {
            return Err(ValidationError::malformed(format!(
                "`action` must be a string, got {}",
                type_name(other)
            )));
        }
        None => return Err(ValidationError::malformed("missing `action` discriminator")),
    };

    let kind = ActionKind::from_wire(name)
        .ok_or_else(|| ValidationError::UnknownAction { name: name.clone() })?;
    let fields = Fields::new(obj);

    let action = match kind {
        ActionKind::Navigate => Action::Navigate {
            url: fields.required(kind, "url")?,
        },
        ActionKind::Click => Action::Click {
            selector: fields.required(kind, "selector")?,
        },
        ActionKind::Fill => Action::Fill {
            selector: fields.required(kind, "selector")?,
            value: fields.required_scalar(kind, "value")?,
        },
        ActionKind::Scrape => Action::Scrape {
            selector: fields
                .optional("selector")?
                .unwrap_or_else(|| DEFAULT_SCRAPE_SELECTOR.to_string()),
            into: match fields.optional("into")? {
                Some(slot) => Some(slot),
                None => fields.optional("label")?,
            },
        },
        ActionKind::Wait => Action::Wait {
            millis: fields.wait_millis()?,
        },
        ActionKind::Screenshot => Action::Screenshot {
            path: fields
                .optional("path")?
                .unwrap_or_else(|| DEFAULT_SCREENSHOT_PATH.to_string()),
        },
        ActionKind::Done => Action::Done,
    };
    Ok(action)
}

/// Remove markdown code fences a model may wrap its JSON in.
pub fn strip_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// First [`PREVIEW_CHARS`] characters of `text`, for log lines.
pub(crate) fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().nth(PREVIEW_CHARS).is_some() {
        out.push_str("...");
    }
    out
}

fn parse_json(raw: &str) -> Result<Value, ValidationError> {
    let cleaned = strip_fences(raw);
    if cleaned.is_empty() {
        return Err(ValidationError::malformed("empty response"));
    }
    serde_json::from_str(cleaned).map_err(|e| ValidationError::malformed(e.to_string()))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

struct Fields<'a> {
    top: &'a Map<String, Value>,
    params: Option<&'a Map<String, Value>>,
}

impl<'a> Fields<'a> {
    fn new(top: &'a Map<String, Value>) -> Self {
        Self {
            top,
            params: top.get("params").and_then(Value::as_object),
        }
    }

    /// Null counts as absent.
    fn lookup(&self, key: &str) -> Option<&'a Value> {
        self.params
            .and_then(|p| p.get(key))
            .or_else(|| self.top.get(key))
            .filter(|v| !v.is_null())
    }

    /// Like [`Fields::lookup`], but blank strings count as absent too.
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.lookup(key).filter(|v| match v {
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
    }

    fn optional(&self, key: &str) -> Result<Option<String>, ValidationError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(ValidationError::malformed(format!(
                "field `{key}` must be a string, got {}",
                type_name(other)
            ))),
        }
    }

    fn required(&self, action: ActionKind, key: &str) -> Result<String, ValidationError> {
        self.optional(key)?
            .ok_or_else(|| missing(action, key))
    }

    /// Like [`Fields::required`], but numbers and booleans are accepted and
    /// rendered as text. Models often emit `"value": 2` for quantity inputs.
    /// An empty string is a value: filling it clears the input.
    fn required_scalar(&self, action: ActionKind, key: &str) -> Result<String, ValidationError> {
        match self.lookup(key) {
            None => Err(missing(action, key)),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(Value::Bool(b)) => Ok(b.to_string()),
            Some(other) => Err(ValidationError::malformed(format!(
                "field `{key}` must be a scalar, got {}",
                type_name(other)
            ))),
        }
    }

    fn wait_millis(&self) -> Result<u64, ValidationError> {
        if let Some(value) = self.get("millis") {
            return value.as_u64().ok_or_else(|| {
                ValidationError::malformed("field `millis` must be a non-negative integer")
            });
        }
        match self.get("seconds") {
            None => Ok(DEFAULT_WAIT.as_millis() as u64),
            Some(value) => match value.as_f64() {
                Some(secs) if secs.is_finite() && secs >= 0.0 => Ok((secs * 1000.0).round() as u64),
                _ => Err(ValidationError::malformed(
                    "field `seconds` must be a non-negative number",
                )),
            },
        }
    }
}

fn missing(action: ActionKind, field: &str) -> ValidationError {
    ValidationError::MissingField {
        action: action.to_string(),
        field: field.to_string(),
    }
}
