//! Core identifiers shared by the heartbeat runtime

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::*;

/// Agent id used when configuration names no agents at all.
pub const DEFAULT_AGENT_ID: &str = "main";

/// Opaque identity of one runner generation.
///
/// Every `HeartbeatRunner::start` mints a fresh token. The token owns the
/// generation's timers and its slot in the [`WakeRegistry`], so a stale
/// handle can never tear down a newer generation's state.
///
/// [`WakeRegistry`]: crate::scheduler::wake::WakeRegistry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationToken(Uuid);

impl GenerationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for GenerationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical form of an agent id: trimmed and lowercased. Blank ids map to
/// [`DEFAULT_AGENT_ID`].
pub fn normalize_agent_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_AGENT_ID.to_string()
    } else {
        trimmed.to_lowercase()
    }
}

/// Extract the agent id from a session key shaped like `agent:<id>:...`.
pub fn agent_id_from_session_key(session_key: &str) -> Option<String> {
    let mut parts = session_key.trim().splitn(3, ':');
    match (parts.next(), parts.next()) {
        (Some(prefix), Some(id)) if prefix.eq_ignore_ascii_case("agent") && !id.trim().is_empty() => {
            Some(normalize_agent_id(id))
        }
        _ => None,
    }
}
