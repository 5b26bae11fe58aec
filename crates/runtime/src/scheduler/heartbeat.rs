//! Heartbeat dispatch types and the `RunOnce` contract.
//!
//! A heartbeat is one maintenance/health execution for one agent. The runner
//! decides *when* to beat; the host decides *what* a beat does by supplying a
//! [`RunOnce`] implementation. The runner only ever looks at one outcome:
//! `skipped` with reason [`REQUESTS_IN_FLIGHT`], which asks for a short retry.
//!
//! Example use cases:
//! - Session compaction check every 30 min for the main assistant agent
//! - Alert channel sweep every 15 min for an ops agent, woken early by cron hooks

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::HeartbeatSettings;

/// Reason carried by dispatches produced by the periodic timer.
pub const INTERVAL_REASON: &str = "interval";

/// Skip reason meaning "the agent is busy serving requests, try again soon".
pub const REQUESTS_IN_FLIGHT: &str = "requests-in-flight";

/// The merged unit of work handed to [`RunOnce`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatDispatch {
    pub agent_id: String,
    /// `"interval"` for timer ticks, otherwise the wake request's reason
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// True when any contributing trigger was a wake request. The executor
    /// should run even if periodic heartbeats are disabled for the agent.
    #[serde(default)]
    pub allow_disabled_for_wake: bool,
    /// Resolved heartbeat settings, when the agent has any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatSettings>,
}

impl HeartbeatDispatch {
    pub fn interval(agent_id: impl Into<String>, heartbeat: Option<HeartbeatSettings>) -> Self {
        Self {
            agent_id: agent_id.into(),
            reason: INTERVAL_REASON.to_string(),
            session_key: None,
            allow_disabled_for_wake: false,
            heartbeat,
        }
    }

    pub fn is_interval(&self) -> bool {
        !self.allow_disabled_for_wake && self.reason == INTERVAL_REASON
    }
}

/// Outcome status reported by [`RunOnce`].
///
/// Statuses the runner does not interpret (`ok-empty`, `sent`, ...) are kept
/// verbatim in [`RunStatus::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Ran,
    Skipped,
    #[serde(untagged)]
    Other(String),
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Ran => "ran",
            RunStatus::Skipped => "skipped",
            RunStatus::Other(status) => status,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one heartbeat execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunResult {
    pub fn ran(duration: Duration) -> Self {
        Self {
            status: RunStatus::Ran,
            duration: Some(duration),
            reason: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Skipped,
            duration: None,
            reason: Some(reason.into()),
        }
    }

    pub fn other(status: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Other(status.into()),
            duration: None,
            reason: None,
        }
    }

    /// Whether the executor asked for a short retry.
    pub fn is_busy(&self) -> bool {
        self.status == RunStatus::Skipped && self.reason.as_deref() == Some(REQUESTS_IN_FLIGHT)
    }
}

/// The host-supplied "run one heartbeat" operation.
///
/// Errors are opaque to the runner: they are logged, reported to the event
/// sink and otherwise ignored. Panics are treated the same way.
#[async_trait]
pub trait RunOnce: Send + Sync {
    async fn run_once(&self, dispatch: HeartbeatDispatch) -> anyhow::Result<RunResult>;
}

#[async_trait]
impl<F, Fut> RunOnce for F
where
    F: Fn(HeartbeatDispatch) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<RunResult>> + Send,
{
    async fn run_once(&self, dispatch: HeartbeatDispatch) -> anyhow::Result<RunResult> {
        (self)(dispatch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_only_for_requests_in_flight() {
        assert!(RunResult::skipped(REQUESTS_IN_FLIGHT).is_busy());
        assert!(!RunResult::skipped("quiet-hours").is_busy());
        assert!(!RunResult::ran(Duration::from_millis(1)).is_busy());
        assert!(!RunResult::other(REQUESTS_IN_FLIGHT).is_busy());
    }

    #[test]
    fn unknown_statuses_pass_through() {
        let result: RunResult = serde_json::from_str(r#"{"status":"ok-empty"}"#).unwrap();
        assert_eq!(result.status, RunStatus::Other("ok-empty".to_string()));
        assert_eq!(result.status.as_str(), "ok-empty");

        let result: RunResult =
            serde_json::from_str(r#"{"status":"skipped","reason":"requests-in-flight"}"#).unwrap();
        assert!(result.is_busy());
    }

    #[test]
    fn interval_dispatch_defaults() {
        let dispatch = HeartbeatDispatch::interval("main", Some(HeartbeatSettings::every("30m")));
        assert!(dispatch.is_interval());
        assert_eq!(dispatch.reason, INTERVAL_REASON);
        assert!(!dispatch.allow_disabled_for_wake);
        assert_eq!(dispatch.session_key, None);
    }

    #[tokio::test]
    async fn closures_implement_run_once() {
        let run = |dispatch: HeartbeatDispatch| async move {
            assert_eq!(dispatch.agent_id, "main");
            Ok::<_, anyhow::Error>(RunResult::ran(Duration::from_millis(3)))
        };
        let result = run
            .run_once(HeartbeatDispatch::interval("main", None))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Ran);
    }
}
