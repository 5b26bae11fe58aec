//! Heartbeat scheduling and wake coordination
//!
//! - [`runner`]: per-generation timer table and dispatch loop
//! - [`merger`]: same-cycle trigger merging
//! - [`wake`]: process-wide wake registry with coalescing
//! - [`heartbeat`]: dispatch/result types and the `RunOnce` contract
//! - [`events`]: outcome events for dashboards

pub mod events;
pub mod heartbeat;
pub mod merger;
pub mod runner;
pub mod wake;

pub use events::{
    HeartbeatEvent, HeartbeatEventBus, HeartbeatEventSink, HeartbeatEventStatus, IndicatorType,
    NoopEventSink,
};
pub use heartbeat::{
    HeartbeatDispatch, RunOnce, RunResult, RunStatus, INTERVAL_REASON, REQUESTS_IN_FLIGHT,
};
pub use merger::{DispatchMerger, MERGE_FLUSH_WINDOW};
pub use runner::{
    AgentScheduleSnapshot, HeartbeatRunner, HeartbeatRunnerHandle, RunnerTuning, RETRY_BACKOFF,
};
pub use wake::{WakeHandler, WakeOutcome, WakeRegistry, WakeRequest, DEFAULT_WAKE_COALESCE};
