//! Heartbeat outcome events.
//!
//! The runner reports every dispatch outcome through a [`HeartbeatEventSink`].
//! [`HeartbeatEventBus`] is the in-process implementation: it remembers the
//! last event overall and per agent, and fans events out to subscribers for
//! dashboards and status pages.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::heartbeat::{HeartbeatDispatch, RunResult, RunStatus};
use crate::types::normalize_agent_id;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outcome status as shown to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeartbeatEventStatus {
    Ran,
    Sent,
    OkEmpty,
    OkToken,
    Skipped,
    Failed,
    #[serde(untagged)]
    Other(String),
}

impl From<&RunStatus> for HeartbeatEventStatus {
    fn from(status: &RunStatus) -> Self {
        match status {
            RunStatus::Ran => Self::Ran,
            RunStatus::Skipped => Self::Skipped,
            RunStatus::Other(other) => match other.as_str() {
                "sent" => Self::Sent,
                "ok-empty" => Self::OkEmpty,
                "ok-token" => Self::OkToken,
                "failed" => Self::Failed,
                _ => Self::Other(other.clone()),
            },
        }
    }
}

/// Coarse status for UI indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorType {
    Ok,
    Alert,
    Error,
}

impl HeartbeatEventStatus {
    pub fn indicator(&self) -> Option<IndicatorType> {
        match self {
            Self::Ran | Self::OkEmpty | Self::OkToken => Some(IndicatorType::Ok),
            Self::Sent => Some(IndicatorType::Alert),
            Self::Failed => Some(IndicatorType::Error),
            Self::Skipped | Self::Other(_) => None,
        }
    }
}

/// One recorded heartbeat outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub status: HeartbeatEventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicator_type: Option<IndicatorType>,
}

impl HeartbeatEvent {
    pub fn new(status: HeartbeatEventStatus) -> Self {
        Self {
            ts: Utc::now(),
            agent_id: None,
            indicator_type: status.indicator(),
            status,
            reason: None,
            session_key: None,
            duration_ms: None,
            preview: None,
            channel: None,
            silent: None,
        }
    }

    /// Event for a dispatch that returned a result.
    pub fn completed(dispatch: &HeartbeatDispatch, result: &RunResult) -> Self {
        let mut event = Self::new(HeartbeatEventStatus::from(&result.status));
        event.agent_id = Some(dispatch.agent_id.clone());
        event.session_key = dispatch.session_key.clone();
        event.reason = result.reason.clone().or_else(|| Some(dispatch.reason.clone()));
        event.duration_ms = result.duration.map(|d| d.as_millis() as u64);
        event
    }

    /// Event for a dispatch whose `RunOnce` call errored or panicked.
    pub fn failed(dispatch: &HeartbeatDispatch, error: &str) -> Self {
        let mut event = Self::new(HeartbeatEventStatus::Failed);
        event.agent_id = Some(dispatch.agent_id.clone());
        event.session_key = dispatch.session_key.clone();
        event.reason = Some(error.to_string());
        event
    }
}

/// Fire-and-forget receiver of heartbeat outcomes.
///
/// Implementations must not block. The runner isolates panics raised by
/// `emit`, so a broken sink never affects scheduling.
pub trait HeartbeatEventSink: Send + Sync {
    fn emit(&self, event: HeartbeatEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl HeartbeatEventSink for NoopEventSink {
    fn emit(&self, _event: HeartbeatEvent) {}
}

/// In-process event store and broadcaster.
pub struct HeartbeatEventBus {
    last: RwLock<Option<HeartbeatEvent>>,
    last_by_agent: DashMap<String, HeartbeatEvent>,
    sender: broadcast::Sender<HeartbeatEvent>,
}

impl HeartbeatEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            last: RwLock::new(None),
            last_by_agent: DashMap::new(),
            sender,
        }
    }

    /// Receive every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.sender.subscribe()
    }

    pub fn last_event(&self) -> Option<HeartbeatEvent> {
        self.last.read().clone()
    }

    pub fn last_event_for_agent(&self, agent_id: &str) -> Option<HeartbeatEvent> {
        self.last_by_agent
            .get(&normalize_agent_id(agent_id))
            .map(|entry| entry.value().clone())
    }
}

impl Default for HeartbeatEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatEventSink for HeartbeatEventBus {
    fn emit(&self, event: HeartbeatEvent) {
        if let Some(agent_id) = event.agent_id.as_deref() {
            if !agent_id.trim().is_empty() {
                self.last_by_agent
                    .insert(normalize_agent_id(agent_id), event.clone());
            }
        }
        *self.last.write() = Some(event.clone());
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn indicator_mapping() {
        assert_eq!(HeartbeatEventStatus::OkEmpty.indicator(), Some(IndicatorType::Ok));
        assert_eq!(HeartbeatEventStatus::OkToken.indicator(), Some(IndicatorType::Ok));
        assert_eq!(HeartbeatEventStatus::Sent.indicator(), Some(IndicatorType::Alert));
        assert_eq!(HeartbeatEventStatus::Failed.indicator(), Some(IndicatorType::Error));
        assert_eq!(HeartbeatEventStatus::Skipped.indicator(), None);
    }

    #[test]
    fn maps_run_statuses() {
        assert_eq!(
            HeartbeatEventStatus::from(&RunStatus::Other("ok-empty".to_string())),
            HeartbeatEventStatus::OkEmpty
        );
        assert_eq!(
            HeartbeatEventStatus::from(&RunStatus::Other("custom".to_string())),
            HeartbeatEventStatus::Other("custom".to_string())
        );
    }

    #[tokio::test]
    async fn records_last_event_per_agent() {
        let bus = HeartbeatEventBus::new();
        let mut rx = bus.subscribe();

        let main = HeartbeatDispatch::interval("main", None);
        let ops = HeartbeatDispatch::interval("ops", None);
        bus.emit(HeartbeatEvent::completed(
            &main,
            &RunResult::ran(Duration::from_millis(12)),
        ));
        bus.emit(HeartbeatEvent::failed(&ops, "provider timeout"));

        let last_main = bus.last_event_for_agent(" MAIN ").unwrap();
        assert_eq!(last_main.status, HeartbeatEventStatus::Ran);
        assert_eq!(last_main.duration_ms, Some(12));
        assert_eq!(last_main.reason.as_deref(), Some("interval"));

        let last = bus.last_event().unwrap();
        assert_eq!(last.agent_id.as_deref(), Some("ops"));
        assert_eq!(last.indicator_type, Some(IndicatorType::Error));

        assert_eq!(rx.recv().await.unwrap().agent_id.as_deref(), Some("main"));
        assert_eq!(rx.recv().await.unwrap().status, HeartbeatEventStatus::Failed);
    }
}
