use arl_core::text;
use arl_core::{Activity, ActivityMetrics, ActivityStatus, ActivityType, EventRef};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

pub const EVENT_REFS_KEPT: usize = 50;

const SUMMARY_MESSAGE_CAP: usize = 60;
const SUMMARY_ERROR_CAP: usize = 80;
const SUMMARY_TOOLS_SHOWN: usize = 3;

#[derive(Debug)]
pub struct Accumulator {
    pub id: String,
    pub run_id: String,
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
    pub channel: Option<String>,
    pub kind: ActivityType,
    pub status: ActivityStatus,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub event_refs: Vec<EventRef>,
    pub metrics: ActivityMetrics,
    pub user_message: Option<String>,
    pub agent_response: Option<String>,
    pub tools_used: Vec<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeEvidence {
    ToolActivity,
    ErrorSignal,
}

pub fn infer_activity_type(session_key: Option<&str>) -> ActivityType {
    let key = session_key.unwrap_or("").to_ascii_lowercase();
    if key.contains("cron:") || key.contains("isolated") {
        ActivityType::CronExecution
    } else {
        ActivityType::ConversationTurn
    }
}

// Error evidence always wins; upgrades are one-directional.
pub fn reclassify(
    current: ActivityType,
    evidence: TypeEvidence,
    metrics: &ActivityMetrics,
) -> ActivityType {
    match evidence {
        TypeEvidence::ErrorSignal => ActivityType::ErrorIncident,
        TypeEvidence::ToolActivity => {
            if current == ActivityType::ConversationTurn
                && metrics.tool_call_count > 0
                && metrics.message_count == 0
            {
                ActivityType::ToolSequence
            } else {
                current
            }
        }
    }
}

pub fn build_summary(acc: &Accumulator) -> String {
    let agent = acc.agent_id.as_deref().unwrap_or("unknown");
    let tools = if acc.metrics.tool_call_count > 0 {
        format!(" ({} tool calls)", acc.metrics.tool_call_count)
    } else {
        String::new()
    };
    match acc.kind {
        ActivityType::ConversationTurn => {
            let via = acc
                .channel
                .as_deref()
                .map(|ch| format!(" via {ch}"))
                .unwrap_or_default();
            let subject = match acc.user_message.as_deref() {
                Some(message) => {
                    text::truncate(&text::strip_envelope(message), SUMMARY_MESSAGE_CAP)
                }
                None => "conversation".to_string(),
            };
            format!("{agent}{via}: {subject}{tools}")
        }
        ActivityType::CronExecution => format!("{agent} cron run{tools}"),
        ActivityType::ToolSequence => {
            let shown = acc
                .tools_used
                .iter()
                .take(SUMMARY_TOOLS_SHOWN)
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            format!("{agent} tool sequence: {shown}{tools}")
        }
        ActivityType::ErrorIncident => {
            let detail = text::truncate(
                acc.error_message
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .unwrap_or("unknown"),
                SUMMARY_ERROR_CAP,
            );
            format!("{agent} error: {detail}")
        }
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 + 3) / 4
}

impl Accumulator {
    pub fn new(run_id: String, kind: ActivityType, now: DateTime<Utc>) -> Self {
        Accumulator {
            id: Uuid::new_v4().to_string(),
            run_id,
            agent_id: None,
            session_key: None,
            channel: None,
            kind,
            status: ActivityStatus::Active,
            started_at: now,
            last_event_at: now,
            event_refs: Vec::new(),
            metrics: ActivityMetrics::default(),
            user_message: None,
            agent_response: None,
            tools_used: Vec::new(),
            error_message: None,
        }
    }

    // Returns true when the run reached a terminal state.
    pub fn apply_chat(&mut self, payload: &Value, now: DateTime<Utc>) -> bool {
        let state = payload.get("state").and_then(Value::as_str).unwrap_or("");
        let message = payload.get("message").unwrap_or(&Value::Null);
        let role = message.get("role").and_then(Value::as_str);

        // The channel envelope rides on raw user content and may only appear
        // on a delta, so look for it before anything else.
        if role == Some("user") && self.channel.is_none() {
            if let Some(content) = message.get("content").and_then(Value::as_str) {
                if let Some(channel) = text::extract_channel_from_envelope(content) {
                    self.channel = Some(channel.to_string());
                }
            }
        }

        match state {
            "delta" => false,
            "final" => {
                self.metrics.message_count += 1;
                let extracted = text::extract_message_text(message);
                match role {
                    Some("user") => {
                        self.user_message = extracted;
                        self.push_ref("chat", "final", "user message", now);
                        false
                    }
                    Some("assistant") => {
                        if let Some(response) = extracted.as_deref() {
                            self.metrics.token_estimate += estimate_tokens(response);
                        }
                        self.agent_response = extracted;
                        self.push_ref("chat", "final", "agent response", now);
                        self.kind == ActivityType::ConversationTurn
                    }
                    other => {
                        let brief = format!("{} message", other.unwrap_or("unknown"));
                        self.push_ref("chat", "final", &brief, now);
                        false
                    }
                }
            }
            "error" | "aborted" => {
                self.status = ActivityStatus::Errored;
                let error_message = payload
                    .get("errorMessage")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Chat {state}"));
                self.kind = reclassify(self.kind, TypeEvidence::ErrorSignal, &self.metrics);
                self.push_ref("chat", "error", &error_message, now);
                self.error_message = Some(error_message);
                true
            }
            _ => false,
        }
    }

    pub fn apply_agent(&mut self, payload: &Value, now: DateTime<Utc>) -> bool {
        let stream = payload.get("stream").and_then(Value::as_str).unwrap_or("");
        let data = payload.get("data").unwrap_or(&Value::Null);

        match stream {
            "lifecycle" => {
                let phase = data.get("phase").and_then(Value::as_str).unwrap_or("");
                match phase {
                    "start" => {
                        self.push_ref("agent", "lifecycle", "start", now);
                        false
                    }
                    "end" => true,
                    "error" => {
                        self.status = ActivityStatus::Errored;
                        let error_message = data
                            .get("error")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| "Lifecycle error".to_string());
                        self.kind =
                            reclassify(self.kind, TypeEvidence::ErrorSignal, &self.metrics);
                        self.push_ref("agent", "lifecycle", &error_message, now);
                        self.error_message = Some(error_message);
                        true
                    }
                    _ => false,
                }
            }
            "tool" => {
                let tool_name = data.get("name").and_then(Value::as_str).unwrap_or("unknown");
                let is_result = data.get("phase").and_then(Value::as_str) == Some("result");
                if !is_result {
                    self.metrics.tool_call_count += 1;
                    if !self.tools_used.iter().any(|t| t == tool_name) {
                        self.tools_used.push(tool_name.to_string());
                    }
                }
                let brief = if is_result {
                    format!("{tool_name} result")
                } else {
                    format!("{tool_name} call")
                };
                self.push_ref("agent", "tool", &brief, now);
                self.kind = reclassify(self.kind, TypeEvidence::ToolActivity, &self.metrics);
                false
            }
            "assistant" => {
                if let Some(streamed) = data.get("text").and_then(Value::as_str) {
                    self.metrics.token_estimate += estimate_tokens(streamed);
                }
                false
            }
            _ => false,
        }
    }

    // The only place an active status maps to completed.
    pub fn into_activity(mut self, now: DateTime<Utc>) -> Activity {
        let summary = build_summary(&self);
        let status = if self.status == ActivityStatus::Active {
            ActivityStatus::Completed
        } else {
            self.status
        };
        let refs_len = self.event_refs.len();
        let event_refs = if refs_len > EVENT_REFS_KEPT {
            self.event_refs.split_off(refs_len - EVENT_REFS_KEPT)
        } else {
            std::mem::take(&mut self.event_refs)
        };
        Activity {
            id: self.id,
            run_id: self.run_id,
            agent_id: self.agent_id,
            session_key: self.session_key,
            channel: self.channel,
            kind: self.kind,
            status,
            started_at: self.started_at,
            completed_at: now,
            duration: (now - self.started_at).num_milliseconds(),
            summary,
            event_refs,
            metrics: self.metrics,
        }
    }

    fn push_ref(&mut self, kind: &str, stream: &str, brief: &str, now: DateTime<Utc>) {
        self.event_refs.push(EventRef {
            timestamp: now.timestamp_millis(),
            kind: kind.to_string(),
            stream: stream.to_string(),
            brief: brief.to_string(),
        });
    }
}
