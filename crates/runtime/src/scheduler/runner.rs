//! Heartbeat runner.
//!
//! `HeartbeatRunner::start` creates one *generation*: a tokio task that owns
//! the per-agent timer table, the pending merge slots and the set of agents
//! with a `RunOnce` call in flight. Config reloads, forwarded wake requests,
//! run completions and snapshot queries reach the task over a command
//! channel; timers are a single `sleep_until` on the earliest deadline. All
//! schedule state is mutated by that task alone.
//!
//! Shutdown follows the same `Notify` pattern as the other schedulers in this
//! crate, plus an active flag that is checked before every dispatch so that
//! nothing is launched once `stop()` has returned.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep_until, Instant};

use super::events::{HeartbeatEvent, HeartbeatEventSink, NoopEventSink};
use super::heartbeat::{HeartbeatDispatch, RunOnce, RunResult};
use super::merger::{DispatchMerger, MERGE_FLUSH_WINDOW};
use super::wake::{WakeHandler, WakeRegistry, WakeRequest};
use crate::config::{AppConfig, HeartbeatSettings, MAX_HEARTBEAT_INTERVAL};
use crate::types::{
    agent_id_from_session_key, normalize_agent_id, GenerationToken, RuntimeError,
};

/// Delay before re-attempting a dispatch the executor reported as busy.
/// Must stay far below any realistic heartbeat interval.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Timing knobs for a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerTuning {
    pub retry_backoff: Duration,
    pub merge_window: Duration,
}

impl Default for RunnerTuning {
    fn default() -> Self {
        Self {
            retry_backoff: RETRY_BACKOFF,
            merge_window: MERGE_FLUSH_WINDOW,
        }
    }
}

/// Point-in-time view of one scheduled agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentScheduleSnapshot {
    pub agent_id: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Time left until the next interval tick
    #[serde(with = "humantime_serde")]
    pub next_due_in: Duration,
    pub retry_pending: bool,
    pub in_flight: bool,
    pub heartbeat: HeartbeatSettings,
}

/// Factory for runner generations.
pub struct HeartbeatRunner {
    run_once: Arc<dyn RunOnce>,
    wake: Arc<WakeRegistry>,
    events: Arc<dyn HeartbeatEventSink>,
    tuning: RunnerTuning,
}

impl HeartbeatRunner {
    pub fn new(run_once: Arc<dyn RunOnce>) -> Self {
        Self {
            run_once,
            wake: Arc::new(WakeRegistry::new()),
            events: Arc::new(NoopEventSink),
            tuning: RunnerTuning::default(),
        }
    }

    pub fn with_wake_registry(mut self, wake: Arc<WakeRegistry>) -> Self {
        self.wake = wake;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn HeartbeatEventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_tuning(mut self, tuning: RunnerTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn wake_registry(&self) -> &Arc<WakeRegistry> {
        &self.wake
    }

    /// Load `path` and start a generation from it.
    pub fn start_from_file<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<HeartbeatRunnerHandle, RuntimeError> {
        let config = AppConfig::from_file(path)?;
        self.try_start(&config)
    }

    /// Like [`start`](Self::start), but fails instead of panicking when
    /// called outside a tokio runtime.
    pub fn try_start(&self, config: &AppConfig) -> Result<HeartbeatRunnerHandle, RuntimeError> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| RuntimeError::Runner(format!("No tokio runtime available: {}", e)))?;
        Ok(self.start(config))
    }

    /// Start a new generation and make it the wake registry's handler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, config: &AppConfig) -> HeartbeatRunnerHandle {
        let token = GenerationToken::new();
        let active = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());
        let (commands, rx) = mpsc::unbounded_channel();

        let state = RunnerState::new(
            token,
            config.clone(),
            Instant::now(),
            active.clone(),
            commands.clone(),
            self.run_once.clone(),
            self.events.clone(),
            self.tuning,
        );
        tracing::info!(
            "Heartbeat runner generation {} started with {} scheduled agent(s)",
            token,
            state.agents.len()
        );

        let wake_commands = commands.clone();
        let wake_active = active.clone();
        let handler: WakeHandler = Arc::new(move |request: WakeRequest| {
            if wake_active.load(Ordering::SeqCst) {
                let _ = wake_commands.send(Command::Wake(request));
            }
        });
        self.wake.register_handler(token, handler);

        tokio::spawn(run_loop(state, rx, shutdown.clone()));

        HeartbeatRunnerHandle {
            token,
            active,
            commands,
            shutdown,
            wake: self.wake.clone(),
        }
    }
}

/// Control handle for one runner generation.
///
/// Dropping the handle stops the generation.
pub struct HeartbeatRunnerHandle {
    token: GenerationToken,
    active: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: Arc<Notify>,
    wake: Arc<WakeRegistry>,
}

impl HeartbeatRunnerHandle {
    pub fn generation(&self) -> GenerationToken {
        self.token
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Apply a new configuration without restarting. Agents whose interval
    /// did not change keep their timers.
    pub fn update_config(&self, config: &AppConfig) {
        if !self.is_running() {
            tracing::debug!("Ignoring config update for stopped generation {}", self.token);
            return;
        }
        let _ = self.commands.send(Command::UpdateConfig(Box::new(config.clone())));
    }

    /// Current schedule table, sorted by agent id. Empty once stopped.
    pub async fn snapshot(&self) -> Vec<AgentScheduleSnapshot> {
        if !self.is_running() {
            return Vec::new();
        }
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Cancel this generation's timers and release its wake registration.
    /// In-flight `RunOnce` calls are left to finish. Repeat calls are no-ops.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.wake.unregister_handler(&self.token);
        self.shutdown.notify_one();
        tracing::info!("Heartbeat runner generation {} stopped", self.token);
    }
}

impl Drop for HeartbeatRunnerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Command {
    UpdateConfig(Box<AppConfig>),
    Wake(WakeRequest),
    Completed {
        dispatch: HeartbeatDispatch,
        outcome: Result<RunResult, String>,
    },
    Snapshot(oneshot::Sender<Vec<AgentScheduleSnapshot>>),
}

struct AgentSchedule {
    settings: HeartbeatSettings,
    interval: Duration,
    next_due: Instant,
}

struct PendingRetry {
    at: Instant,
    dispatch: HeartbeatDispatch,
}

struct RunnerState {
    token: GenerationToken,
    config: AppConfig,
    default_agent: String,
    agents: BTreeMap<String, AgentSchedule>,
    retries: BTreeMap<String, PendingRetry>,
    merger: DispatchMerger,
    in_flight: HashSet<String>,
    active: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
    run_once: Arc<dyn RunOnce>,
    events: Arc<dyn HeartbeatEventSink>,
    tuning: RunnerTuning,
}

async fn run_loop(
    mut state: RunnerState,
    mut rx: mpsc::UnboundedReceiver<Command>,
    shutdown: Arc<Notify>,
) {
    loop {
        let deadline = state.next_deadline();
        let timer = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            command = rx.recv() => match command {
                Some(command) => state.handle(command),
                None => break,
            },
            _ = timer => {}
        }

        if !state.active.load(Ordering::SeqCst) {
            break;
        }
        state.tick(Instant::now());
    }
    tracing::debug!("Heartbeat runner generation {} loop exited", state.token);
}

impl RunnerState {
    #[allow(clippy::too_many_arguments)]
    fn new(
        token: GenerationToken,
        config: AppConfig,
        now: Instant,
        active: Arc<AtomicBool>,
        commands: mpsc::UnboundedSender<Command>,
        run_once: Arc<dyn RunOnce>,
        events: Arc<dyn HeartbeatEventSink>,
        tuning: RunnerTuning,
    ) -> Self {
        let agents = config
            .resolve_heartbeats()
            .into_iter()
            .map(|resolved| {
                (
                    resolved.agent_id,
                    AgentSchedule {
                        settings: resolved.settings,
                        interval: resolved.interval,
                        next_due: deadline_after(now, resolved.interval),
                    },
                )
            })
            .collect();

        Self {
            token,
            default_agent: config.default_agent_id(),
            config,
            agents,
            retries: BTreeMap::new(),
            merger: DispatchMerger::new(tuning.merge_window),
            in_flight: HashSet::new(),
            active,
            commands,
            run_once,
            events,
            tuning,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let in_flight = &self.in_flight;
        self.agents
            .values()
            .map(|agent| agent.next_due)
            .chain(self.retries.values().map(|retry| retry.at))
            .chain(self.merger.next_deadline(|agent_id| in_flight.contains(agent_id)))
            .min()
    }

    fn handle(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::UpdateConfig(config) => self.apply_config(*config, now),
            Command::Wake(request) => self.on_wake(request, now),
            Command::Completed { dispatch, outcome } => self.on_completed(dispatch, outcome, now),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot(now));
            }
        }
    }

    /// Fire every due timer, then flush every due merge slot.
    fn tick(&mut self, now: Instant) {
        let mut triggers: Vec<HeartbeatDispatch> = Vec::new();

        let due_retries: Vec<String> = self
            .retries
            .iter()
            .filter(|(_, retry)| retry.at <= now)
            .map(|(agent_id, _)| agent_id.clone())
            .collect();
        for agent_id in due_retries {
            if let Some(retry) = self.retries.remove(&agent_id) {
                // The retry replaces this cycle's interval tick.
                if let Some(agent) = self.agents.get_mut(&agent_id) {
                    agent.next_due = deadline_after(now, agent.interval);
                }
                tracing::debug!("Retrying heartbeat for agent {} after busy signal", agent_id);
                triggers.push(retry.dispatch);
            }
        }

        for (agent_id, agent) in self.agents.iter_mut() {
            if agent.next_due > now {
                continue;
            }
            agent.next_due = deadline_after(agent.next_due, agent.interval);
            if agent.next_due <= now {
                agent.next_due = deadline_after(now, agent.interval);
            }
            // The interval tick wins the race; fold the pending retry into it.
            if let Some(retry) = self.retries.remove(agent_id) {
                triggers.push(retry.dispatch);
            }
            triggers.push(HeartbeatDispatch::interval(
                agent_id.clone(),
                Some(agent.settings.clone()),
            ));
        }

        for trigger in triggers {
            self.merger.push(trigger, now);
        }

        let in_flight = &self.in_flight;
        let due = self
            .merger
            .take_due(now, |agent_id| in_flight.contains(agent_id));
        for dispatch in due {
            self.launch(dispatch);
        }
    }

    fn on_wake(&mut self, request: WakeRequest, now: Instant) {
        let agent_id = request
            .agent_id
            .as_deref()
            .map(normalize_agent_id)
            .or_else(|| {
                request
                    .session_key
                    .as_deref()
                    .and_then(agent_id_from_session_key)
            })
            .unwrap_or_else(|| self.default_agent.clone());

        tracing::debug!(
            "Wake request {:?} for agent {} (generation {})",
            request.reason,
            agent_id,
            self.token
        );

        let heartbeat = self
            .agents
            .get(&agent_id)
            .map(|agent| agent.settings.clone())
            .or_else(|| self.config.heartbeat_settings_for(&agent_id));

        self.merger.push(
            HeartbeatDispatch {
                agent_id,
                reason: request.reason,
                session_key: request.session_key,
                allow_disabled_for_wake: true,
                heartbeat,
            },
            now,
        );
    }

    fn on_completed(
        &mut self,
        dispatch: HeartbeatDispatch,
        outcome: Result<RunResult, String>,
        now: Instant,
    ) {
        self.in_flight.remove(&dispatch.agent_id);

        if let Ok(result) = outcome {
            if result.is_busy() {
                tracing::debug!(
                    "Agent {} busy, retrying heartbeat in {:?}",
                    dispatch.agent_id,
                    self.tuning.retry_backoff
                );
                self.retries.insert(
                    dispatch.agent_id.clone(),
                    PendingRetry {
                        at: deadline_after(now, self.tuning.retry_backoff),
                        dispatch,
                    },
                );
            }
        }
    }

    fn apply_config(&mut self, config: AppConfig, now: Instant) {
        let resolved = config.resolve_heartbeats();

        let removed: Vec<String> = self
            .agents
            .keys()
            .filter(|agent_id| !resolved.iter().any(|r| &r.agent_id == *agent_id))
            .cloned()
            .collect();
        for agent_id in removed {
            self.agents.remove(&agent_id);
            if self
                .retries
                .get(&agent_id)
                .is_some_and(|retry| retry.dispatch.is_interval())
            {
                self.retries.remove(&agent_id);
            }
            self.merger.cancel_interval(&agent_id);
            tracing::info!("Heartbeat timer for agent {} cancelled", agent_id);
        }

        for entry in resolved {
            match self.agents.get_mut(&entry.agent_id) {
                Some(agent) if agent.interval == entry.interval => {
                    agent.settings = entry.settings;
                }
                Some(agent) => {
                    tracing::info!(
                        "Heartbeat interval for agent {} changed from {:?} to {:?}",
                        entry.agent_id,
                        agent.interval,
                        entry.interval
                    );
                    agent.settings = entry.settings;
                    agent.interval = entry.interval;
                    agent.next_due = deadline_after(now, entry.interval);
                }
                None => {
                    tracing::info!(
                        "Heartbeat timer for agent {} armed every {:?}",
                        entry.agent_id,
                        entry.interval
                    );
                    self.agents.insert(
                        entry.agent_id,
                        AgentSchedule {
                            settings: entry.settings,
                            interval: entry.interval,
                            next_due: deadline_after(now, entry.interval),
                        },
                    );
                }
            }
        }

        self.default_agent = config.default_agent_id();
        self.config = config;
    }

    fn snapshot(&self, now: Instant) -> Vec<AgentScheduleSnapshot> {
        self.agents
            .iter()
            .map(|(agent_id, agent)| AgentScheduleSnapshot {
                agent_id: agent_id.clone(),
                interval: agent.interval,
                next_due_in: agent.next_due.saturating_duration_since(now),
                retry_pending: self.retries.contains_key(agent_id),
                in_flight: self.in_flight.contains(agent_id),
                heartbeat: agent.settings.clone(),
            })
            .collect()
    }

    fn launch(&mut self, dispatch: HeartbeatDispatch) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        self.retries.remove(&dispatch.agent_id);
        self.in_flight.insert(dispatch.agent_id.clone());

        tracing::debug!(
            "Dispatching heartbeat for agent {} (reason: {})",
            dispatch.agent_id,
            dispatch.reason
        );

        let run_once = self.run_once.clone();
        let events = self.events.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(run_once.run_once(dispatch.clone()))
                .catch_unwind()
                .await
            {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(panic) => Err(panic_message(panic.as_ref())),
            };

            let event = match &outcome {
                Ok(result) => HeartbeatEvent::completed(&dispatch, result),
                Err(message) => {
                    tracing::warn!(
                        "Heartbeat for agent {} failed: {}",
                        dispatch.agent_id,
                        message
                    );
                    HeartbeatEvent::failed(&dispatch, message)
                }
            };
            emit_guarded(events.as_ref(), event);

            // The generation may already be gone; its schedule no longer matters.
            let _ = commands.send(Command::Completed { dispatch, outcome });
        });
    }
}

/// `now + delay`, clamped so a deadline can never overflow `Instant`.
fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(MAX_HEARTBEAT_INTERVAL))
        .unwrap_or(now)
}

fn emit_guarded(events: &dyn HeartbeatEventSink, event: HeartbeatEvent) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| events.emit(event))).is_err() {
        tracing::warn!("Heartbeat event sink panicked; event dropped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tuning_keeps_backoff_small() {
        let tuning = RunnerTuning::default();
        assert_eq!(tuning.retry_backoff, Duration::from_secs(1));
        assert_eq!(tuning.merge_window, Duration::from_millis(1));
        assert!(tuning.merge_window < tuning.retry_backoff);
    }

    #[test]
    fn try_start_requires_a_runtime() {
        let runner = HeartbeatRunner::new(Arc::new(|_dispatch: HeartbeatDispatch| async {
            Ok::<_, anyhow::Error>(RunResult::ran(Duration::ZERO))
        }));
        let result = runner.try_start(&AppConfig::with_default_interval("30m"));
        assert!(matches!(result, Err(RuntimeError::Runner(_))));
        assert!(!runner.wake_registry().has_handler());
    }

    #[tokio::test]
    async fn start_from_file_reports_config_errors() {
        let runner = HeartbeatRunner::new(Arc::new(|_dispatch: HeartbeatDispatch| async {
            Ok::<_, anyhow::Error>(RunResult::ran(Duration::ZERO))
        }));
        let result = runner.start_from_file("/nonexistent/agents.toml");
        assert!(matches!(result, Err(RuntimeError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines_never_overflow() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(60)), now + Duration::from_secs(60));
        assert_eq!(deadline_after(now, Duration::MAX), now + MAX_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn extracts_panic_messages() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "panicked: boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bad state"));
        assert_eq!(panic_message(boxed.as_ref()), "panicked: bad state");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "panicked");
    }
}
