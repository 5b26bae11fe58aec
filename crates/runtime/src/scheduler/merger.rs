//! Same-cycle dispatch merging.
//!
//! Each agent has at most one pending dispatch. The first trigger opens the
//! slot and fixes its flush deadline at `now + window`; every trigger that
//! arrives before the flush folds into the same slot. A slot whose agent
//! still has a `RunOnce` call in flight is held until that call settles.
//!
//! Precedence when folding:
//! - a wake's reason and session key replace whatever is in the slot
//!   (the most recently accepted wake wins);
//! - an interval tick never replaces a wake's reason or session key;
//! - `allow_disabled_for_wake` is sticky once any wake contributed;
//! - heartbeat settings are kept from whichever trigger carried them.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::heartbeat::HeartbeatDispatch;

/// Default flush window. Anything above the timer resolution works; it only
/// has to let triggers raised at the same instant meet in one slot.
pub const MERGE_FLUSH_WINDOW: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
struct PendingDispatch {
    dispatch: HeartbeatDispatch,
    flush_at: Instant,
    triggers: usize,
}

/// Per-agent pending-dispatch slots.
#[derive(Debug)]
pub struct DispatchMerger {
    window: Duration,
    pending: HashMap<String, PendingDispatch>,
}

impl DispatchMerger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Add a trigger. Wake-sourced triggers are recognized by
    /// `allow_disabled_for_wake`.
    pub fn push(&mut self, trigger: HeartbeatDispatch, now: Instant) {
        match self.pending.get_mut(&trigger.agent_id) {
            Some(slot) => {
                slot.triggers += 1;
                fold(&mut slot.dispatch, trigger);
                tracing::debug!(
                    "Merged trigger into pending dispatch for agent {} ({} triggers)",
                    slot.dispatch.agent_id,
                    slot.triggers
                );
            }
            None => {
                self.pending.insert(
                    trigger.agent_id.clone(),
                    PendingDispatch {
                        dispatch: trigger,
                        flush_at: now.checked_add(self.window).unwrap_or(now),
                        triggers: 1,
                    },
                );
            }
        }
    }

    /// Drop the pending slot of `agent_id` if no wake contributed to it.
    pub fn cancel_interval(&mut self, agent_id: &str) -> Option<HeartbeatDispatch> {
        match self.pending.get(agent_id) {
            Some(slot) if slot.dispatch.is_interval() => {
                self.pending.remove(agent_id).map(|slot| slot.dispatch)
            }
            _ => None,
        }
    }

    #[cfg(test)]
    fn is_pending(&self, agent_id: &str) -> bool {
        self.pending.contains_key(agent_id)
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest flush deadline among slots that are not blocked.
    pub fn next_deadline(&self, is_blocked: impl Fn(&str) -> bool) -> Option<Instant> {
        self.pending
            .iter()
            .filter(|(agent_id, _)| !is_blocked(agent_id))
            .map(|(_, slot)| slot.flush_at)
            .min()
    }

    /// Remove and return every unblocked slot whose deadline has passed, in
    /// flush order.
    pub fn take_due(
        &mut self,
        now: Instant,
        is_blocked: impl Fn(&str) -> bool,
    ) -> Vec<HeartbeatDispatch> {
        let mut due: Vec<(Instant, String)> = self
            .pending
            .iter()
            .filter(|(agent_id, slot)| slot.flush_at <= now && !is_blocked(agent_id))
            .map(|(agent_id, slot)| (slot.flush_at, agent_id.clone()))
            .collect();
        due.sort();

        due.into_iter()
            .filter_map(|(_, agent_id)| self.pending.remove(&agent_id))
            .map(|slot| slot.dispatch)
            .collect()
    }
}

impl Default for DispatchMerger {
    fn default() -> Self {
        Self::new(MERGE_FLUSH_WINDOW)
    }
}

fn fold(slot: &mut HeartbeatDispatch, incoming: HeartbeatDispatch) {
    if incoming.allow_disabled_for_wake {
        slot.reason = incoming.reason;
        slot.session_key = incoming.session_key;
        slot.allow_disabled_for_wake = true;
    }
    slot.heartbeat = incoming.heartbeat.or(slot.heartbeat.take());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatSettings;

    fn wake(agent_id: &str, reason: &str, session_key: Option<&str>) -> HeartbeatDispatch {
        HeartbeatDispatch {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
            session_key: session_key.map(str::to_string),
            allow_disabled_for_wake: true,
            heartbeat: None,
        }
    }

    fn interval(agent_id: &str) -> HeartbeatDispatch {
        HeartbeatDispatch::interval(agent_id, Some(HeartbeatSettings::every("1m")))
    }

    #[tokio::test(start_paused = true)]
    async fn single_trigger_is_dispatched_unchanged() {
        let mut merger = DispatchMerger::default();
        let now = Instant::now();
        merger.push(interval("main"), now);

        assert!(merger.take_due(now, |_| false).is_empty());
        let due = merger.take_due(now + MERGE_FLUSH_WINDOW, |_| false);
        assert_eq!(due, vec![interval("main")]);
        assert!(merger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wake_overrides_interval_in_either_order() {
        let now = Instant::now();
        let alert = wake("main", "hook:wake", Some("agent:main:discord:thread:alerts"));

        for order in [[interval("main"), alert.clone()], [alert.clone(), interval("main")]] {
            let mut merger = DispatchMerger::default();
            for trigger in order {
                merger.push(trigger, now);
            }
            let due = merger.take_due(now + MERGE_FLUSH_WINDOW, |_| false);
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].reason, "hook:wake");
            assert_eq!(
                due[0].session_key.as_deref(),
                Some("agent:main:discord:thread:alerts")
            );
            assert!(due[0].allow_disabled_for_wake);
            assert_eq!(due[0].heartbeat, Some(HeartbeatSettings::every("1m")));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn latest_wake_wins() {
        let mut merger = DispatchMerger::default();
        let now = Instant::now();
        merger.push(wake("ops", "cron:job-1", Some("agent:ops:a")), now);
        merger.push(wake("ops", "cron:job-2", None), now);

        let due = merger.take_due(now + MERGE_FLUSH_WINDOW, |_| false);
        assert_eq!(due[0].reason, "cron:job-2");
        assert_eq!(due[0].session_key, None);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_agents_stay_pending() {
        let mut merger = DispatchMerger::default();
        let now = Instant::now();
        merger.push(interval("main"), now);
        merger.push(interval("ops"), now);

        let later = now + Duration::from_millis(5);
        let due = merger.take_due(later, |agent| agent == "main");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].agent_id, "ops");
        assert!(merger.is_pending("main"));
        assert_eq!(merger.next_deadline(|agent| agent == "main"), None);
        assert_eq!(merger.next_deadline(|_| false), Some(now + MERGE_FLUSH_WINDOW));

        assert_eq!(merger.take_due(later, |_| false).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn later_triggers_do_not_extend_the_deadline() {
        let mut merger = DispatchMerger::new(Duration::from_millis(10));
        let start = Instant::now();
        merger.push(interval("main"), start);
        merger.push(wake("main", "manual", None), start + Duration::from_millis(9));

        assert_eq!(
            merger.next_deadline(|_| false),
            Some(start + Duration::from_millis(10))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_keeps_wake_slots() {
        let mut merger = DispatchMerger::default();
        let now = Instant::now();
        merger.push(interval("main"), now);
        merger.push(interval("ops"), now);
        merger.push(wake("ops", "manual", None), now);

        assert_eq!(merger.cancel_interval("main"), Some(interval("main")));
        assert_eq!(merger.cancel_interval("ops"), None);
        assert_eq!(merger.cancel_interval("idle"), None);
        assert!(!merger.is_pending("main"));
        assert!(merger.is_pending("ops"));
    }
}
