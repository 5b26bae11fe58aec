//! Process-wide wake registry.
//!
//! Hooks, cron triggers and UI actions ask for an immediate heartbeat through
//! [`WakeRegistry::request_heartbeat_now`]. The registry holds a single
//! active-handler slot owned by the newest runner generation and drops
//! requests that repeat an accepted one for the same target within its
//! coalescing window.
//!
//! The registry is an explicit service object: the host creates one, hands it
//! to every runner it starts and calls [`WakeRegistry::reset`] when it needs a
//! clean slate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::types::{normalize_agent_id, GenerationToken};

/// Coalescing window used by [`WakeRequest::new`].
pub const DEFAULT_WAKE_COALESCE: Duration = Duration::from_millis(250);

const ANY_TARGET: &str = "*";

/// Callback installed by a runner generation to receive forwarded wakes.
pub type WakeHandler = Arc<dyn Fn(WakeRequest) + Send + Sync>;

/// An out-of-band request to run a heartbeat now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeRequest {
    pub reason: String,
    /// Target agent; `None` means the default agent
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
    /// Suppress this request if an identical target was accepted this
    /// recently. Zero disables suppression.
    pub coalesce: Duration,
    pub requested_at: Instant,
}

impl WakeRequest {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            agent_id: None,
            session_key: None,
            coalesce: DEFAULT_WAKE_COALESCE,
            requested_at: Instant::now(),
        }
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn for_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    pub fn coalesce(mut self, window: Duration) -> Self {
        self.coalesce = window;
        self
    }

    fn coalesce_key(&self) -> (String, String) {
        (
            self.agent_id
                .as_deref()
                .map(normalize_agent_id)
                .unwrap_or_else(|| ANY_TARGET.to_string()),
            self.session_key
                .clone()
                .unwrap_or_else(|| ANY_TARGET.to_string()),
        )
    }
}

/// What happened to a wake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// Handed to the active runner generation
    Forwarded,
    /// Dropped as a repeat of a recently accepted request
    Coalesced,
    /// Dropped because no runner is registered
    NoHandler,
}

#[derive(Default)]
struct WakeState {
    active: Option<(GenerationToken, WakeHandler)>,
    /// Time of the last accepted request per target
    last_accepted: HashMap<(String, String), Instant>,
    /// Largest coalescing window requested so far; older records are pruned
    widest_window: Duration,
}

/// Single active-handler slot plus the coalescing filter.
#[derive(Default)]
pub struct WakeRegistry {
    state: Mutex<WakeState>,
}

impl WakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `token`. The newest registration always wins.
    pub fn register_handler(&self, token: GenerationToken, handler: WakeHandler) {
        let mut state = self.state.lock();
        if let Some((previous, _)) = state.active.as_ref() {
            tracing::debug!("Wake handler of generation {} replaced by {}", previous, token);
        }
        state.active = Some((token, handler));
    }

    /// Clear the slot if, and only if, it still belongs to `token`.
    ///
    /// Returns whether the slot was cleared.
    pub fn unregister_handler(&self, token: &GenerationToken) -> bool {
        let mut state = self.state.lock();
        match state.active.as_ref() {
            Some((active, _)) if active == token => {
                state.active = None;
                true
            }
            _ => {
                tracing::debug!("Ignoring stale wake unregister for generation {}", token);
                false
            }
        }
    }

    /// Token of the generation currently receiving wakes.
    pub fn active_generation(&self) -> Option<GenerationToken> {
        self.state.lock().active.as_ref().map(|(token, _)| *token)
    }

    pub fn has_handler(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Coalesce `request`, then forward it to the active handler.
    pub fn request_heartbeat_now(&self, request: WakeRequest) -> WakeOutcome {
        let handler = {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.widest_window = state.widest_window.max(request.coalesce);
            let retention = state.widest_window;
            state
                .last_accepted
                .retain(|_, at| now.saturating_duration_since(*at) < retention);

            let key = request.coalesce_key();
            if !request.coalesce.is_zero() {
                if let Some(at) = state.last_accepted.get(&key) {
                    if now.saturating_duration_since(*at) < request.coalesce {
                        tracing::debug!(
                            "Coalesced wake request {:?} for {}/{}",
                            request.reason,
                            key.0,
                            key.1
                        );
                        return WakeOutcome::Coalesced;
                    }
                }
            }

            let Some((_, handler)) = state.active.as_ref() else {
                tracing::debug!("Dropping wake request {:?}: no runner registered", request.reason);
                return WakeOutcome::NoHandler;
            };
            let handler = handler.clone();

            state.last_accepted.insert(key, now);
            handler
        };

        handler(request);
        WakeOutcome::Forwarded
    }

    /// Clear the handler slot and all coalescing state.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.active = None;
        state.last_accepted.clear();
        state.widest_window = Duration::ZERO;
    }
}
