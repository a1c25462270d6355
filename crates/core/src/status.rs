//! # Status Broadcaster
//!
//! Per-run event hub. Every stage reports into one `StatusHub`, which keeps
//! an append-only event log plus one `PhaseRecord` per runnable phase, and
//! fans events out to any number of broadcast subscribers.
//!
//! A hub belongs to exactly one orchestrator run; it is constructed fresh
//! per run and passed by reference into every stage. Past events are never
//! mutated or removed - corrections are new events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Pipeline phase names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Discovery,
    Enrichment,
    Generation,
    Complete,
    Error,
}

impl Phase {
    /// The phases that actually execute work and own a [`PhaseRecord`].
    /// `Complete` and `Error` only appear on events.
    pub fn runnable() -> [Phase; 4] {
        [
            Phase::Planning,
            Phase::Discovery,
            Phase::Enrichment,
            Phase::Generation,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Discovery => "discovery",
            Phase::Enrichment => "enrichment",
            Phase::Generation => "generation",
            Phase::Complete => "complete",
            Phase::Error => "error",
        }
    }
}

/// Kind of status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Info,
    Success,
    Error,
    Progress,
    Data,
}

/// An event in the session log. Append-only; never mutated once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Unique within the session
    pub id: String,
    pub kind: EventKind,
    pub phase: Phase,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// 0-100, present on progress events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Arbitrary payload, present on data events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Lifecycle state of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Lifecycle record for one phase. Initialized `pending` at session start,
/// transitioned in place by start/complete/fail, never removed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Omitted (not fabricated) when the phase never recorded a start time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub events: Vec<StatusEvent>,
}

impl PhaseRecord {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Pending,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            events: Vec::new(),
        }
    }
}

/// Condensed view of one phase for summaries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseBrief {
    pub phase: Phase,
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub event_count: usize,
}

/// Derived session-level view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub status: PhaseStatus,
    pub phases: Vec<PhaseBrief>,
    pub event_count: usize,
}

struct HubState {
    log: Vec<StatusEvent>,
    phases: HashMap<Phase, PhaseRecord>,
    last_timestamp: DateTime<Utc>,
    next_seq: u64,
}

/// The per-run event hub.
pub struct StatusHub {
    session_id: String,
    state: std::sync::Mutex<HubState>,
    update_tx: broadcast::Sender<StatusEvent>,
    phase_tx: std::sync::Mutex<HashMap<Phase, broadcast::Sender<StatusEvent>>>,
    kind_tx: std::sync::Mutex<HashMap<EventKind, broadcast::Sender<StatusEvent>>>,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(256);
        let phases = Phase::runnable()
            .into_iter()
            .map(|p| (p, PhaseRecord::new(p)))
            .collect();
        Self {
            session_id: short_id("run"),
            state: std::sync::Mutex::new(HubState {
                log: Vec::new(),
                phases,
                last_timestamp: Utc::now(),
                next_seq: 1,
            }),
            update_tx,
            phase_tx: std::sync::Mutex::new(HashMap::new()),
            kind_tx: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Subscribe to every event ("update" channel).
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.update_tx.subscribe()
    }

    /// Subscribe to events of a single phase.
    pub fn subscribe_phase(&self, phase: Phase) -> broadcast::Receiver<StatusEvent> {
        let mut senders = match self.phase_tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        senders
            .entry(phase)
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    /// Subscribe to events of a single kind.
    pub fn subscribe_kind(&self, kind: EventKind) -> broadcast::Receiver<StatusEvent> {
        let mut senders = match self.kind_tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        senders
            .entry(kind)
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    /// Transition a phase to `in_progress` and record its start time.
    pub fn start_phase(&self, phase: Phase, message: impl Into<String>) {
        let now = self.append(EventKind::Info, phase, message.into(), None, None);
        self.with_record(phase, |record| {
            record.status = PhaseStatus::InProgress;
            record.started_at = Some(now);
            record.ended_at = None;
            record.duration_seconds = None;
        });
    }

    /// Transition a phase to `completed`, computing its duration when a
    /// start time was recorded.
    pub fn complete_phase(&self, phase: Phase, message: impl Into<String>) {
        let now = self.append(EventKind::Success, phase, message.into(), None, None);
        self.with_record(phase, |record| {
            record.status = PhaseStatus::Completed;
            record.ended_at = Some(now);
            record.duration_seconds = record
                .started_at
                .map(|s| (now - s).num_milliseconds() as f64 / 1000.0);
        });
    }

    /// Transition a phase to `failed`.
    pub fn fail_phase(&self, phase: Phase, message: impl Into<String>) {
        let now = self.append(EventKind::Error, phase, message.into(), None, None);
        self.with_record(phase, |record| {
            record.status = PhaseStatus::Failed;
            record.ended_at = Some(now);
            record.duration_seconds = record
                .started_at
                .map(|s| (now - s).num_milliseconds() as f64 / 1000.0);
        });
    }

    /// Append a progress event without a phase transition.
    pub fn update_progress(&self, phase: Phase, message: impl Into<String>, percent: u8) {
        self.append(
            EventKind::Progress,
            phase,
            message.into(),
            Some(percent.min(100)),
            None,
        );
    }

    /// Append an informational event.
    pub fn update_info(&self, phase: Phase, message: impl Into<String>) {
        self.append(EventKind::Info, phase, message.into(), None, None);
    }

    /// Append a success event.
    pub fn update_success(&self, phase: Phase, message: impl Into<String>) {
        self.append(EventKind::Success, phase, message.into(), None, None);
    }

    /// Append a data event carrying a payload.
    pub fn update_data(&self, phase: Phase, message: impl Into<String>, payload: Value) {
        self.append(EventKind::Data, phase, message.into(), None, Some(payload));
    }

    /// Snapshot of the full event log.
    pub fn events(&self) -> Vec<StatusEvent> {
        self.lock_state().log.clone()
    }

    /// Snapshot of the phase records, in pipeline order.
    pub fn phase_records(&self) -> Vec<PhaseRecord> {
        let state = self.lock_state();
        Phase::runnable()
            .into_iter()
            .filter_map(|p| state.phases.get(&p).cloned())
            .collect()
    }

    /// Derive the session summary from current phase states: failed if any
    /// phase failed, completed iff all completed, otherwise in progress.
    pub fn summary(&self) -> SessionSummary {
        let state = self.lock_state();
        let records: Vec<&PhaseRecord> = Phase::runnable()
            .iter()
            .filter_map(|p| state.phases.get(p))
            .collect();

        let status = if records.iter().any(|r| r.status == PhaseStatus::Failed) {
            PhaseStatus::Failed
        } else if records.iter().all(|r| r.status == PhaseStatus::Completed) {
            PhaseStatus::Completed
        } else {
            PhaseStatus::InProgress
        };

        SessionSummary {
            session_id: self.session_id.clone(),
            status,
            phases: records
                .iter()
                .map(|r| PhaseBrief {
                    phase: r.phase,
                    status: r.status,
                    duration_seconds: r.duration_seconds,
                    event_count: r.events.len(),
                })
                .collect(),
            event_count: state.log.len(),
        }
    }

    /// Append one event to the log and notify subscribers. Returns the
    /// timestamp assigned to the event, which is clamped to be monotonic
    /// non-decreasing within the session.
    fn append(
        &self,
        kind: EventKind,
        phase: Phase,
        message: String,
        progress: Option<u8>,
        payload: Option<Value>,
    ) -> DateTime<Utc> {
        let event = {
            let mut state = self.lock_state();
            let timestamp = Utc::now().max(state.last_timestamp);
            state.last_timestamp = timestamp;
            let event = StatusEvent {
                id: format!("evt-{}", state.next_seq),
                kind,
                phase,
                message,
                timestamp,
                progress,
                payload,
            };
            state.next_seq += 1;
            state.log.push(event.clone());
            if let Some(record) = state.phases.get_mut(&phase) {
                record.events.push(event.clone());
            }
            event
        };

        // Generic "update" notification plus narrow per-kind / per-phase ones.
        let _ = self.update_tx.send(event.clone());
        if let Ok(senders) = self.phase_tx.lock() {
            if let Some(tx) = senders.get(&event.phase) {
                let _ = tx.send(event.clone());
            }
        }
        if let Ok(senders) = self.kind_tx.lock() {
            if let Some(tx) = senders.get(&event.kind) {
                let _ = tx.send(event.clone());
            }
        }
        event.timestamp
    }

    fn with_record(&self, phase: Phase, f: impl FnOnce(&mut PhaseRecord)) {
        let mut state = self.lock_state();
        if let Some(record) = state.phases.get_mut(&phase) {
            f(record);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HubState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Generate a short unique id with a readable prefix.
pub fn short_id(prefix: &str) -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    let salt = RandomState::new().build_hasher().finish() as u32;
    format!("{}-{:x}-{:x}", prefix, nanos, salt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_records_initialized_pending() {
        let hub = StatusHub::new();
        let records = hub.phase_records();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.status == PhaseStatus::Pending));
    }

    #[test]
    fn test_phase_lifecycle_and_duration() {
        let hub = StatusHub::new();
        hub.start_phase(Phase::Planning, "start");
        assert_eq!(hub.phase_records()[0].status, PhaseStatus::InProgress);

        hub.complete_phase(Phase::Planning, "done");
        let record = &hub.phase_records()[0];
        assert_eq!(record.status, PhaseStatus::Completed);
        assert!(record.duration_seconds.is_some());
    }

    #[test]
    fn test_duration_omitted_without_start() {
        let hub = StatusHub::new();
        hub.fail_phase(Phase::Discovery, "broke before it began");
        let record = &hub.phase_records()[1];
        assert_eq!(record.status, PhaseStatus::Failed);
        assert!(record.duration_seconds.is_none());
    }

    #[test]
    fn test_timestamps_non_decreasing() {
        let hub = StatusHub::new();
        for i in 0..50 {
            hub.update_info(Phase::Discovery, format!("event {i}"));
        }
        let events = hub.events();
        for pair in events.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_event_ids_unique() {
        let hub = StatusHub::new();
        hub.update_info(Phase::Planning, "a");
        hub.update_progress(Phase::Planning, "b", 40);
        hub.update_data(Phase::Planning, "c", json!({"x": 1}));
        let events = hub.events();
        let mut ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_summary_derivation() {
        let hub = StatusHub::new();
        assert_eq!(hub.summary().status, PhaseStatus::InProgress);

        for phase in Phase::runnable() {
            hub.start_phase(phase, "start");
            hub.complete_phase(phase, "done");
        }
        assert_eq!(hub.summary().status, PhaseStatus::Completed);

        hub.fail_phase(Phase::Generation, "regression");
        assert_eq!(hub.summary().status, PhaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_subscribers_receive_appends() {
        let hub = StatusHub::new();
        let mut all = hub.subscribe();
        let mut errors = hub.subscribe_kind(EventKind::Error);
        let mut discovery = hub.subscribe_phase(Phase::Discovery);

        hub.update_info(Phase::Planning, "planning note");
        hub.fail_phase(Phase::Discovery, "search broke");

        assert_eq!(all.recv().await.unwrap().message, "planning note");
        assert_eq!(all.recv().await.unwrap().message, "search broke");
        assert_eq!(errors.recv().await.unwrap().kind, EventKind::Error);
        assert_eq!(discovery.recv().await.unwrap().phase, Phase::Discovery);
    }

    #[test]
    fn test_progress_clamped() {
        let hub = StatusHub::new();
        hub.update_progress(Phase::Enrichment, "over", 150);
        assert_eq!(hub.events()[0].progress, Some(100));
    }
}
