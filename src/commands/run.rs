use async_trait::async_trait;
use cadence_runtime::scheduler::{
    HeartbeatDispatch, HeartbeatEventBus, HeartbeatRunner, RunOnce, RunResult, WakeOutcome,
    WakeRegistry, WakeRequest,
};
use cadence_runtime::AppConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast::error::RecvError;

/// Executor used by the standalone host: logs each dispatch and reports `ran`.
struct LoggingRunOnce;

#[async_trait]
impl RunOnce for LoggingRunOnce {
    async fn run_once(&self, dispatch: HeartbeatDispatch) -> anyhow::Result<RunResult> {
        let started = tokio::time::Instant::now();
        tracing::info!(
            "Heartbeat for agent {} (reason: {}, session: {}, wake: {})",
            dispatch.agent_id,
            dispatch.reason,
            dispatch.session_key.as_deref().unwrap_or("-"),
            dispatch.allow_disabled_for_wake
        );
        Ok(RunResult::ran(started.elapsed()))
    }
}

pub async fn run(config_path: &Path, poll_secs: u64, wake_now: bool) -> anyhow::Result<()> {
    // Initialize tracing for structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut last_modified = modified_at(config_path);

    let registry = Arc::new(WakeRegistry::new());
    let events = Arc::new(HeartbeatEventBus::new());
    let event_log = tokio::spawn(log_events(events.clone()));

    let runner = HeartbeatRunner::new(Arc::new(LoggingRunOnce))
        .with_wake_registry(registry.clone())
        .with_event_sink(events.clone());
    let handle = runner.start_from_file(config_path)?;
    println!(
        "✓ Heartbeat runner started from {} (generation {})",
        config_path.display(),
        handle.generation()
    );

    if wake_now {
        let outcome = registry.request_heartbeat_now(WakeRequest::new("startup"));
        if outcome != WakeOutcome::Forwarded {
            tracing::warn!("Startup wake not delivered: {:?}", outcome);
        }
    }

    let mut poll = tokio::time::interval(Duration::from_secs(poll_secs.max(1)));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    poll.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = poll.tick() => {
                let modified = modified_at(config_path);
                if modified == last_modified {
                    continue;
                }
                last_modified = modified;
                match AppConfig::from_file(config_path) {
                    Ok(config) => {
                        tracing::info!("Config {} changed, applying", config_path.display());
                        handle.update_config(&config);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Ignoring invalid config {}: {}; keeping previous schedule",
                            config_path.display(),
                            e
                        );
                    }
                }
            }
        }
    }

    handle.stop();
    event_log.abort();
    println!("\n✓ Heartbeat runner stopped");
    Ok(())
}

async fn log_events(events: Arc<HeartbeatEventBus>) {
    let mut rx = events.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => tracing::debug!(
                "Heartbeat event: agent={} status={:?} duration_ms={:?}",
                event.agent_id.as_deref().unwrap_or("-"),
                event.status,
                event.duration_ms
            ),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Heartbeat event log lagged, {} event(s) skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
