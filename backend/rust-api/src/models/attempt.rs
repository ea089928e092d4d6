use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAX_KEY_LEN: usize = 128;
const MAX_VALUE_DEPTH: usize = 8;
const MAX_TEXT_LEN: usize = 20_000;
const MAX_COLLECTION_LEN: usize = 1_000;

/// Client-supplied answer or progress value.
///
/// Keeps the open "arbitrary client data" shape of the wire format while giving
/// the engine a closed set of cases to reason about. Numbers keep the form the
/// client sent: integers stay integers at full 64-bit precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    List(Vec<AnswerValue>),
    Object(BTreeMap<String, AnswerValue>),
}

impl AnswerValue {
    pub fn validate(&self) -> Result<(), String> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> Result<(), String> {
        if depth > MAX_VALUE_DEPTH {
            return Err(format!("value nested deeper than {} levels", MAX_VALUE_DEPTH));
        }
        match self {
            AnswerValue::Null | AnswerValue::Bool(_) | AnswerValue::Number(_) => Ok(()),
            AnswerValue::Text(text) if text.len() > MAX_TEXT_LEN => {
                Err(format!("text longer than {} bytes", MAX_TEXT_LEN))
            }
            AnswerValue::Text(_) => Ok(()),
            AnswerValue::List(items) => {
                if items.len() > MAX_COLLECTION_LEN {
                    return Err(format!("list longer than {} items", MAX_COLLECTION_LEN));
                }
                items.iter().try_for_each(|item| item.validate_at(depth + 1))
            }
            AnswerValue::Object(fields) => {
                if fields.len() > MAX_COLLECTION_LEN {
                    return Err(format!("object with more than {} keys", MAX_COLLECTION_LEN));
                }
                fields.values().try_for_each(|v| v.validate_at(depth + 1))
            }
        }
    }
}

impl From<&str> for AnswerValue {
    fn from(value: &str) -> Self {
        AnswerValue::Text(value.to_string())
    }
}

impl From<String> for AnswerValue {
    fn from(value: String) -> Self {
        AnswerValue::Text(value)
    }
}

impl From<i64> for AnswerValue {
    fn from(value: i64) -> Self {
        AnswerValue::Number(value.into())
    }
}

/// Question IDs and auto-save keys end up as document field paths, so dots and
/// a leading `$` are not allowed.
pub fn validate_field_key(key: &str) -> Result<(), String> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(format!("key must be 1..={} characters", MAX_KEY_LEN));
    }
    if key.contains('.') || key.starts_with('$') || key.contains('\0') {
        return Err(format!("key '{}' contains a reserved character", key));
    }
    Ok(())
}

pub type AnswerMap = BTreeMap<String, AnswerValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    InProgress,
    Submitted,
    Abandoned,
    Invalid,
}

impl CompletionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CompletionStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompletionStatus::InProgress => "in_progress",
            CompletionStatus::Submitted => "submitted",
            CompletionStatus::Abandoned => "abandoned",
            CompletionStatus::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptState {
    pub attempt_id: String,
    pub version: i64,
    #[serde(default)]
    pub answers: AnswerMap,
    #[serde(default)]
    pub auto_save_data: AnswerMap,
    pub completion_status: CompletionStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl AttemptState {
    /// Fresh in-progress attempt at version 1.
    pub fn new(attempt_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            attempt_id: attempt_id.into(),
            version: 1,
            answers: AnswerMap::new(),
            auto_save_data: AnswerMap::new(),
            completion_status: CompletionStatus::InProgress,
            started_at: now,
            last_activity_at: now,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.completion_status.is_terminal()
    }

    /// Applies a patch with overwrite-present-keys semantics and bumps the
    /// version by one. Callers must have already checked the version.
    pub fn apply(&mut self, patch: &StatePatch, now: DateTime<Utc>) {
        for (key, value) in &patch.answers {
            self.answers.insert(key.clone(), value.clone());
        }
        for (key, value) in &patch.auto_save_data {
            self.auto_save_data.insert(key.clone(), value.clone());
        }
        if let Some(status) = patch.completion_status {
            self.completion_status = status;
        }
        self.version += 1;
        self.last_activity_at = now;
    }
}

/// Partial update of an attempt. Keys absent from the maps are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default)]
    pub answers: AnswerMap,
    #[serde(default)]
    pub auto_save_data: AnswerMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_status: Option<CompletionStatus>,
}

impl StatePatch {
    pub fn answers(answers: AnswerMap) -> Self {
        Self {
            answers,
            ..Default::default()
        }
    }

    pub fn status(status: CompletionStatus) -> Self {
        Self {
            completion_status: Some(status),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (key, value) in self.answers.iter().chain(self.auto_save_data.iter()) {
            validate_field_key(key)?;
            value.validate().map_err(|e| format!("{}: {}", key, e))?;
        }
        Ok(())
    }
}
