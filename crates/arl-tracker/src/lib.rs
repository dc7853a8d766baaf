mod accumulator;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arl_core::gateway::EventFrame;
use arl_core::{
    parse_since, text, Activity, ActivityDigest, ActivityQuery, ActivityStatus, ActivityType,
    AgentDigest, TrackerStats,
};
use arl_storage::ActivityLog;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::accumulator::{infer_activity_type, Accumulator};

pub const MAX_ACTIVITIES: usize = 10_000;
pub const TRUNCATE_TO: usize = 8_000;
pub const ACTIVITY_TIMEOUT_MS: i64 = 5 * 60 * 1000;
pub const SWEEP_INTERVAL_MS: u64 = 60_000;

const QUERY_LIMIT_DEFAULT: usize = 50;
const QUERY_LIMIT_MAX: usize = 200;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub state_dir: PathBuf,
    pub max_activities: usize,
    pub truncate_to: usize,
    pub activity_timeout_ms: i64,
    pub sweep_interval_ms: u64,
}

impl TrackerConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        TrackerConfig {
            state_dir: state_dir.into(),
            max_activities: MAX_ACTIVITIES,
            truncate_to: TRUNCATE_TO,
            activity_timeout_ms: ACTIVITY_TIMEOUT_MS,
            sweep_interval_ms: SWEEP_INTERVAL_MS,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    accumulators: HashMap<String, Accumulator>,
    activities: Vec<Activity>,
    by_id: HashMap<String, usize>,
}

// All state sits behind one mutex; a sweep can never race a finalization.
pub struct ActivityTracker {
    config: TrackerConfig,
    log: ActivityLog,
    state: Mutex<TrackerState>,
    shutdown: watch::Sender<bool>,
}

impl ActivityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let log = ActivityLog::new(&config.state_dir);
        let (shutdown, _) = watch::channel(false);
        ActivityTracker {
            config,
            log,
            state: Mutex::new(TrackerState::default()),
            shutdown,
        }
    }

    pub fn ledger_path(&self) -> &Path {
        self.log.file_path()
    }

    pub fn start(self: &Arc<Self>) {
        self.load_from_disk();
        let tracker = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let period = Duration::from_millis(tracker.config.sweep_interval_ms);
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracker.sweep_stale(Utc::now());
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        let now = Utc::now();
        let mut state = self.state_guard();
        let drained: Vec<Accumulator> = state
            .accumulators
            .drain()
            .map(|(_, acc)| acc)
            .collect();
        let finalized = drained.len();
        for acc in drained {
            self.finalize_into(&mut state, acc, now);
        }
        info!(event = "tracker_stop", finalized);
    }

    pub fn process_event(&self, frame: &EventFrame, now: DateTime<Utc>) {
        if frame.event != "chat" && frame.event != "agent" {
            return;
        }
        let payload = &frame.payload;
        if !payload.is_object() {
            return;
        }
        let run_id = match payload.get("runId").and_then(Value::as_str) {
            Some(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
            _ => return,
        };

        let agent_id = text::extract_agent_id(payload);
        let session_key = payload
            .get("sessionKey")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut state = self.state_guard();
        let acc = state.accumulators.entry(run_id.clone()).or_insert_with(|| {
            Accumulator::new(
                run_id.clone(),
                infer_activity_type(session_key.as_deref()),
                now,
            )
        });
        acc.last_event_at = now;
        if acc.agent_id.is_none() {
            acc.agent_id = agent_id;
        }
        if acc.session_key.is_none() {
            acc.session_key = session_key;
        }

        let done = match frame.event.as_str() {
            "chat" => acc.apply_chat(payload, now),
            _ => acc.apply_agent(payload, now),
        };
        if done {
            if let Some(acc) = state.accumulators.remove(&run_id) {
                self.finalize_into(&mut state, acc, now);
            }
        }
    }

    pub fn sweep_stale(&self, now: DateTime<Utc>) {
        let mut state = self.state_guard();
        let expired: Vec<String> = state
            .accumulators
            .iter()
            .filter(|(_, acc)| {
                (now - acc.last_event_at).num_milliseconds() > self.config.activity_timeout_ms
            })
            .map(|(run_id, _)| run_id.clone())
            .collect();
        for run_id in expired {
            if let Some(acc) = state.accumulators.remove(&run_id) {
                info!(event = "activity_swept", run_id = %acc.run_id);
                self.finalize_into(&mut state, acc, now);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Activity> {
        let state = self.state_guard();
        state
            .by_id
            .get(id)
            .and_then(|&idx| state.activities.get(idx))
            .cloned()
    }

    pub fn query(&self, query: &ActivityQuery) -> Vec<Activity> {
        let state = self.state_guard();
        let agent = query.agent.as_deref();
        let since = query.since.as_deref().and_then(parse_since);
        let kind = query.kind.as_deref();

        let matched: Vec<&Activity> = state
            .activities
            .iter()
            .filter(|activity| {
                if let Some(agent) = agent {
                    match activity.agent_id.as_deref() {
                        Some(id) if id.eq_ignore_ascii_case(agent) => {}
                        _ => return false,
                    }
                }
                if let Some(since) = since {
                    if activity.started_at < since {
                        return false;
                    }
                }
                if let Some(kind) = kind {
                    if activity.kind.as_str() != kind {
                        return false;
                    }
                }
                true
            })
            .collect();

        let limit = effective_limit(query.limit);
        let skip = matched.len().saturating_sub(limit);
        matched.into_iter().skip(skip).cloned().collect()
    }

    pub fn digest(&self, since: &str, now: DateTime<Utc>) -> ActivityDigest {
        let Some(since) = parse_since(since) else {
            return ActivityDigest {
                since: now,
                duration: "0m".to_string(),
                agents: BTreeMap::new(),
                total_activities: 0,
                total_messages: 0,
                total_errors: 0,
                avg_response_time: "N/A".to_string(),
            };
        };

        let state = self.state_guard();
        let mut agents: BTreeMap<String, AgentDigest> = BTreeMap::new();
        let mut channels: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut total_activities = 0u64;
        let mut total_messages = 0u64;
        let mut total_errors = 0u64;
        let mut total_duration = 0i64;
        let mut response_samples = 0u32;

        for activity in state.activities.iter().filter(|a| a.started_at >= since) {
            total_activities += 1;
            total_messages += u64::from(activity.metrics.message_count);
            let agent = activity
                .agent_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            let entry = agents.entry(agent.clone()).or_default();
            match activity.kind {
                ActivityType::ConversationTurn => entry.conversations += 1,
                ActivityType::CronExecution => entry.cron_runs += 1,
                _ => {}
            }
            if activity.status == ActivityStatus::Errored {
                entry.errors += 1;
                total_errors += 1;
            }
            if let Some(channel) = &activity.channel {
                channels.entry(agent).or_default().insert(channel.clone());
            }
            if activity.duration > 0 {
                total_duration += activity.duration;
                response_samples += 1;
            }
        }

        for (agent, set) in channels {
            if let Some(entry) = agents.get_mut(&agent) {
                entry.channels = set.into_iter().collect();
            }
        }

        ActivityDigest {
            since,
            duration: format_window(now - since),
            agents,
            total_activities,
            total_messages,
            total_errors,
            avg_response_time: format_avg_response(total_duration, response_samples),
        }
    }

    pub fn stats(&self) -> TrackerStats {
        let state = self.state_guard();
        TrackerStats {
            total_activities: state.activities.len(),
            active_accumulators: state.accumulators.len(),
        }
    }

    fn load_from_disk(&self) {
        match self.log.load() {
            Ok(report) => {
                let by_id: HashMap<String, usize> = report
                    .activities
                    .iter()
                    .enumerate()
                    .map(|(idx, activity)| (activity.id.clone(), idx))
                    .collect();
                let mut state = self.state_guard();
                state.activities = report.activities;
                state.by_id = by_id;
                if state.activities.len() > self.config.max_activities {
                    self.compact(&mut state);
                }
                info!(
                    event = "activity_log_loaded",
                    count = state.activities.len(),
                    skipped_corrupt_lines = report.skipped_corrupt_lines,
                );
            }
            Err(err) => {
                warn!(event = "activity_load_failed", error = %err);
            }
        }
    }

    // Callers have already removed the accumulator from the active index.
    fn finalize_into(&self, state: &mut TrackerState, acc: Accumulator, now: DateTime<Utc>) {
        let activity = acc.into_activity(now);
        info!(
            event = "activity_finalized",
            run_id = %activity.run_id,
            kind = %activity.kind,
            status = %activity.status,
            summary = %activity.summary,
        );
        if let Err(err) = self.log.append(&activity) {
            warn!(event = "activity_append_failed", error = %err);
        }
        state.by_id.insert(activity.id.clone(), state.activities.len());
        state.activities.push(activity);
        if state.activities.len() > self.config.max_activities {
            self.compact(state);
        }
    }

    fn compact(&self, state: &mut TrackerState) {
        let excess = state
            .activities
            .len()
            .saturating_sub(self.config.truncate_to);
        if excess == 0 {
            return;
        }
        state.activities.drain(..excess);
        state.by_id.clear();
        for (idx, activity) in state.activities.iter().enumerate() {
            state.by_id.insert(activity.id.clone(), idx);
        }
        match self.log.rewrite(&state.activities) {
            Ok(()) => {
                info!(event = "activity_log_compacted", retained = state.activities.len());
            }
            Err(err) => {
                warn!(event = "activity_compact_failed", error = %err);
            }
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

fn effective_limit(limit: Option<i64>) -> usize {
    match limit {
        Some(n) if n > 0 => (n as usize).min(QUERY_LIMIT_MAX),
        _ => QUERY_LIMIT_DEFAULT,
    }
}

fn format_window(window: chrono::Duration) -> String {
    let ms = window.num_milliseconds();
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

fn format_avg_response(total_ms: i64, samples: u32) -> String {
    if samples == 0 {
        return "N/A".to_string();
    }
    let avg_ms = (total_ms as f64 / f64::from(samples)).round();
    let avg_sec = (avg_ms / 1000.0).round() as i64;
    if avg_sec > 0 {
        format!("{avg_sec}s")
    } else {
        "N/A".to_string()
    }
}
