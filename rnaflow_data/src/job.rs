use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{ActionRecord, DerivedAction};

/// top-level job state as reported by the backend
/// values outside the known vocabulary are kept verbatim and count as non-terminal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobState {
    Queued,
    Running,
    Success,
    Error,
    Other(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Error)
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Error => "error",
            JobState::Other(raw) => raw,
        }
    }
}

impl From<&str> for JobState {
    fn from(raw: &str) -> Self {
        match raw {
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "success" => JobState::Success,
            "error" => JobState::Error,
            other => JobState::Other(other.to_string()),
        }
    }
}

impl From<String> for JobState {
    fn from(raw: String) -> Self {
        JobState::from(raw.as_str())
    }
}

impl From<JobState> for String {
    fn from(state: JobState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputItem {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// snapshot of a job record, owned by the backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub job_id: String,
    pub state: JobState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub outputs: Vec<OutputItem>,
    // values are action records, but the backend may put anything here
    #[serde(default)]
    pub extra: Option<BTreeMap<String, Value>>,
}

impl Job {
    pub fn new(job_id: &str, state: JobState) -> Self {
        Self {
            job_id: job_id.to_string(),
            state,
            message: None,
            created_at: None,
            started_at: None,
            finished_at: None,
            outputs: Vec::new(),
            extra: None,
        }
    }

    pub fn output(&self, name: &str) -> Option<&OutputItem> {
        self.outputs.iter().find(|item| item.name == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.output(name).is_some()
    }

    pub fn has_outputs(&self, names: &[&str]) -> bool {
        names.iter().all(|name| self.has_output(name))
    }

    /// names from `names` that are not listed yet, in the given order
    pub fn missing_outputs(&self, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .filter(|name| !self.has_output(name))
            .map(|name| name.to_string())
            .collect()
    }

    /// the sub-record of a derived action
    /// a value that does not decode as an action record counts as absent
    pub fn action(&self, action: DerivedAction) -> Option<ActionRecord> {
        let value = self.extra.as_ref()?.get(action.key())?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn message_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.message.as_deref().unwrap_or(fallback)
    }
}

/// parses the backend's ISO-8601 timestamps; naive values are taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Some(with_offset.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

pub fn display_timestamp(raw: Option<&str>) -> String {
    match raw {
        None => "--".to_string(),
        Some(raw) => match parse_timestamp(raw) {
            Some(ts) => ts.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => raw.to_string(),
        },
    }
}
