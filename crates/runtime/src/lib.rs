//! Cadence heartbeat runtime
//!
//! Decides, for every configured agent, when to invoke the host's "run one
//! heartbeat" operation. Periodic interval ticks and on-demand wake requests
//! are merged per agent so an agent never runs twice in one cycle, failures
//! of the operation never stall the schedule, and config reloads or restarts
//! never corrupt another generation's state.

pub mod config;
pub mod scheduler;
pub mod types;

pub use config::{AppConfig, ConfigError, HeartbeatSettings};
pub use scheduler::{
    HeartbeatDispatch, HeartbeatEventBus, HeartbeatRunner, HeartbeatRunnerHandle, RunOnce,
    RunResult, RunStatus, WakeRegistry, WakeRequest,
};
pub use types::*;
