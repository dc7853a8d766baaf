use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub mod gateway;
pub mod text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityType {
    ConversationTurn,
    CronExecution,
    ToolSequence,
    ErrorIncident,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::ConversationTurn => "conversation-turn",
            ActivityType::CronExecution => "cron-execution",
            ActivityType::ToolSequence => "tool-sequence",
            ActivityType::ErrorIncident => "error-incident",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation-turn" => Ok(ActivityType::ConversationTurn),
            "cron-execution" => Ok(ActivityType::CronExecution),
            "tool-sequence" => Ok(ActivityType::ToolSequence),
            "error-incident" => Ok(ActivityType::ErrorIncident),
            other => Err(format!("unknown activity type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Active,
    Completed,
    Errored,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Active => "active",
            ActivityStatus::Completed => "completed",
            ActivityStatus::Errored => "errored",
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ActivityStatus::Active),
            "completed" => Ok(ActivityStatus::Completed),
            "errored" => Ok(ActivityStatus::Errored),
            other => Err(format!("unknown activity status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    // epoch milliseconds
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub stream: String,
    pub brief: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMetrics {
    pub message_count: u32,
    pub tool_call_count: u32,
    pub token_estimate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub run_id: String,
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
    pub channel: Option<String>,
    #[serde(rename = "type")]
    pub kind: ActivityType,
    pub status: ActivityStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: i64,
    pub summary: String,
    #[serde(default)]
    pub event_refs: Vec<EventRef>,
    #[serde(default)]
    pub metrics: ActivityMetrics,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityQuery {
    pub agent: Option<String>,
    pub since: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDigest {
    pub conversations: u64,
    pub cron_runs: u64,
    pub errors: u64,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityDigest {
    pub since: DateTime<Utc>,
    pub duration: String,
    pub agents: BTreeMap<String, AgentDigest>,
    pub total_activities: u64,
    pub total_messages: u64,
    pub total_errors: u64,
    pub avg_response_time: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStats {
    pub total_activities: usize,
    pub active_accumulators: usize,
}

/// Parse a since value that can be either an RFC 3339 timestamp or epoch milliseconds
pub fn parse_since(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}
