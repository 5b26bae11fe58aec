//! Configuration for the heartbeat runtime
//!
//! Only the `agents` section is consumed here: the default heartbeat block,
//! the agent list and each agent's optional heartbeat override. Everything
//! else in a host's configuration file is ignored by this crate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::types::{normalize_agent_id, DEFAULT_AGENT_ID};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Unsupported configuration format: {extension}")]
    UnsupportedFormat { extension: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },

    #[error("Invalid heartbeat interval {value:?}: {reason}")]
    InvalidInterval { value: String, reason: String },
}

/// Top-level configuration consumed by the heartbeat runner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agents: AgentsConfig,
}

/// The `agents` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Settings applied to every agent unless overridden
    pub defaults: AgentDefaults,
    /// Configured agents. Empty means a single implicit `main` agent.
    pub list: Vec<AgentEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatSettings>,
}

/// One entry of `agents.list`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    /// Marks the agent that receives untargeted wake requests
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatSettings>,
}

/// Heartbeat block, used both as the default and as a per-agent override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Interval between beats, e.g. `"30m"`, `"1h 30m"` or `"45s"`. Bare
    /// integers are minutes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub every: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl HeartbeatSettings {
    pub fn every(every: impl Into<String>) -> Self {
        Self {
            every: Some(every.into()),
            enabled: None,
        }
    }

    /// Overlay `overrides` on top of `base`; override fields win.
    pub fn merged(
        base: Option<&HeartbeatSettings>,
        overrides: Option<&HeartbeatSettings>,
    ) -> Option<HeartbeatSettings> {
        match (base, overrides) {
            (None, None) => None,
            (Some(base), None) => Some(base.clone()),
            (None, Some(overrides)) => Some(overrides.clone()),
            (Some(base), Some(overrides)) => Some(HeartbeatSettings {
                every: overrides.every.clone().or_else(|| base.every.clone()),
                enabled: overrides.enabled.or(base.enabled),
            }),
        }
    }

    /// The effective interval, or an error explaining why the periodic
    /// heartbeat is off for these settings.
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        if self.enabled == Some(false) {
            return Err(ConfigError::InvalidInterval {
                value: self.every.clone().unwrap_or_default(),
                reason: "heartbeat disabled".to_string(),
            });
        }
        match self.every.as_deref() {
            Some(raw) => parse_interval(raw),
            None => Err(ConfigError::InvalidInterval {
                value: String::new(),
                reason: "no interval configured".to_string(),
            }),
        }
    }
}

/// Longest accepted heartbeat interval (one year).
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Parse a heartbeat interval string.
///
/// Accepts humantime durations and bare integers (minutes). Zero is rejected
/// because a zero interval would fire continuously. Intervals above
/// [`MAX_HEARTBEAT_INTERVAL`] are rejected so every deadline stays
/// representable.
pub fn parse_interval(raw: &str) -> Result<Duration, ConfigError> {
    let trimmed = raw.trim();
    let invalid = |reason: String| ConfigError::InvalidInterval {
        value: raw.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("empty interval".to_string()));
    }

    let duration = if trimmed.chars().all(|c| c.is_ascii_digit()) {
        let minutes: u64 = trimmed
            .parse()
            .map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?;
        Duration::from_secs(minutes.saturating_mul(60))
    } else {
        humantime::parse_duration(trimmed).map_err(|e| invalid(e.to_string()))?
    };

    if duration.is_zero() {
        return Err(invalid("interval must be greater than zero".to_string()));
    }
    if duration > MAX_HEARTBEAT_INTERVAL {
        return Err(invalid(format!(
            "interval exceeds the maximum of {}",
            humantime::format_duration(MAX_HEARTBEAT_INTERVAL)
        )));
    }
    Ok(duration)
}

/// An agent that gets a periodic heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedHeartbeat {
    pub agent_id: String,
    pub settings: HeartbeatSettings,
    pub interval: Duration,
}

impl AppConfig {
    /// Load configuration from a TOML, YAML or JSON file, picked by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_lowercase();

        match extension.as_str() {
            "toml" => Self::from_toml_str(&content),
            "yaml" | "yml" => Self::from_yaml_str(&content),
            "json" => Self::from_json_str(&content),
            other => Err(ConfigError::UnsupportedFormat {
                extension: other.to_string(),
            }),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Config with only a default interval and the implicit `main` agent.
    pub fn with_default_interval(every: impl Into<String>) -> Self {
        Self {
            agents: AgentsConfig {
                defaults: AgentDefaults {
                    heartbeat: Some(HeartbeatSettings::every(every)),
                },
                list: Vec::new(),
            },
        }
    }

    /// Normalized ids of every configured agent, in configuration order.
    pub fn agent_ids(&self) -> Vec<String> {
        if self.agents.list.is_empty() {
            return vec![DEFAULT_AGENT_ID.to_string()];
        }
        let mut ids: Vec<String> = Vec::with_capacity(self.agents.list.len());
        for entry in &self.agents.list {
            let id = normalize_agent_id(&entry.id);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// The agent that receives wake requests carrying no target.
    pub fn default_agent_id(&self) -> String {
        self.agents
            .list
            .iter()
            .find(|entry| entry.default)
            .or_else(|| self.agents.list.first())
            .map(|entry| normalize_agent_id(&entry.id))
            .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string())
    }

    fn entry(&self, agent_id: &str) -> Option<&AgentEntry> {
        self.agents
            .list
            .iter()
            .find(|entry| normalize_agent_id(&entry.id) == agent_id)
    }

    /// Effective heartbeat settings for an agent (defaults + override).
    pub fn heartbeat_settings_for(&self, agent_id: &str) -> Option<HeartbeatSettings> {
        let agent_id = normalize_agent_id(agent_id);
        let overrides = self.entry(&agent_id).and_then(|e| e.heartbeat.as_ref());
        HeartbeatSettings::merged(self.agents.defaults.heartbeat.as_ref(), overrides)
    }

    /// Agents that get a periodic heartbeat, with their resolved intervals.
    ///
    /// When any listed agent carries its own heartbeat block, exactly those
    /// agents are scheduled. Otherwise only the default agent is, using the
    /// default block. Agents whose interval is missing, invalid or disabled
    /// are left out; this never fails.
    pub fn resolve_heartbeats(&self) -> Vec<ResolvedHeartbeat> {
        let explicit: Vec<String> = self
            .agents
            .list
            .iter()
            .filter(|entry| entry.heartbeat.is_some())
            .map(|entry| normalize_agent_id(&entry.id))
            .collect();

        let candidates = if explicit.is_empty() {
            vec![self.default_agent_id()]
        } else {
            explicit
        };

        let mut resolved: Vec<ResolvedHeartbeat> = Vec::new();
        for agent_id in candidates {
            if resolved.iter().any(|r| r.agent_id == agent_id) {
                continue;
            }
            let Some(settings) = self.heartbeat_settings_for(&agent_id) else {
                continue;
            };
            match settings.interval() {
                Ok(interval) => resolved.push(ResolvedHeartbeat {
                    agent_id,
                    settings,
                    interval,
                }),
                Err(e) => {
                    tracing::warn!("Heartbeat disabled for agent {}: {}", agent_id, e);
                }
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn agent(id: &str, every: Option<&str>) -> AgentEntry {
        AgentEntry {
            id: id.to_string(),
            default: false,
            heartbeat: every.map(HeartbeatSettings::every),
        }
    }

    #[test]
    fn parses_humantime_and_bare_minutes() {
        assert_eq!(parse_interval("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_interval("1h 30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_interval("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_interval(" 15 ").unwrap(), Duration::from_secs(900));
    }

    #[test]
    fn rejects_bad_intervals() {
        assert!(parse_interval("").is_err());
        assert!(parse_interval("soon").is_err());
        assert!(parse_interval("0").is_err());
        assert!(parse_interval("0s").is_err());
    }

    #[test]
    fn rejects_out_of_range_intervals() {
        assert_eq!(parse_interval("365d").unwrap(), MAX_HEARTBEAT_INTERVAL);
        assert!(matches!(
            parse_interval("366d"),
            Err(ConfigError::InvalidInterval { .. })
        ));
        assert!(parse_interval("200000000000000000").is_err());
        assert!(parse_interval("500000000000y").is_err());

        let config = AppConfig::with_default_interval("200000000000000000");
        assert!(config.resolve_heartbeats().is_empty());
    }

    #[test]
    fn empty_list_schedules_implicit_main() {
        let config = AppConfig::with_default_interval("30m");
        assert_eq!(config.agent_ids(), vec!["main".to_string()]);

        let resolved = config.resolve_heartbeats();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].agent_id, "main");
        assert_eq!(resolved[0].interval, Duration::from_secs(1800));
        assert_eq!(resolved[0].settings, HeartbeatSettings::every("30m"));
    }

    #[test]
    fn explicit_agents_override_defaults() {
        let mut config = AppConfig::with_default_interval("30m");
        config.agents.list = vec![agent("Main", Some("10m")), agent("ops", Some("15m"))];

        let resolved = config.resolve_heartbeats();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].agent_id, "main");
        assert_eq!(resolved[0].settings, HeartbeatSettings::every("10m"));
        assert_eq!(resolved[1].agent_id, "ops");
        assert_eq!(resolved[1].interval, Duration::from_secs(900));
    }

    #[test]
    fn agents_without_override_are_not_scheduled_when_others_are() {
        let mut config = AppConfig::default();
        config.agents.list = vec![agent("main", None), agent("ops", Some("15m"))];

        let resolved = config.resolve_heartbeats();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].agent_id, "ops");
        assert_eq!(config.default_agent_id(), "main");
        assert_eq!(config.heartbeat_settings_for("main"), None);
    }

    #[test]
    fn list_without_overrides_schedules_default_agent_only() {
        let mut config = AppConfig::with_default_interval("1h");
        config.agents.list = vec![agent("alpha", None), agent("beta", None)];
        config.agents.list[1].default = true;

        let resolved = config.resolve_heartbeats();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].agent_id, "beta");
    }

    #[test]
    fn invalid_or_disabled_intervals_are_skipped() {
        let mut config = AppConfig::with_default_interval("30m");
        config.agents.list = vec![
            agent("broken", Some("every now and then")),
            AgentEntry {
                id: "paused".to_string(),
                default: false,
                heartbeat: Some(HeartbeatSettings {
                    every: None,
                    enabled: Some(false),
                }),
            },
            agent("ok", Some("5m")),
        ];

        let resolved = config.resolve_heartbeats();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].agent_id, "ok");
    }

    #[test]
    fn loads_yaml_toml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("agents.yaml");
        let mut file = std::fs::File::create(&yaml_path).unwrap();
        writeln!(
            file,
            "agents:\n  defaults:\n    heartbeat:\n      every: 30m\n  list:\n    - id: main\n      heartbeat:\n        every: 10m\n"
        )
        .unwrap();
        let yaml = AppConfig::from_file(&yaml_path).unwrap();
        assert_eq!(
            yaml.heartbeat_settings_for("main"),
            Some(HeartbeatSettings::every("10m"))
        );

        let toml_path = dir.path().join("agents.toml");
        std::fs::write(
            &toml_path,
            "[agents.defaults.heartbeat]\nevery = \"30m\"\n\n[[agents.list]]\nid = \"ops\"\ndefault = true\n",
        )
        .unwrap();
        let toml = AppConfig::from_file(&toml_path).unwrap();
        assert_eq!(toml.default_agent_id(), "ops");

        let json_path = dir.path().join("agents.json");
        std::fs::write(
            &json_path,
            r#"{"agents":{"defaults":{"heartbeat":{"every":"45s"}}}}"#,
        )
        .unwrap();
        let json = AppConfig::from_file(&json_path).unwrap();
        assert_eq!(json, AppConfig::with_default_interval("45s"));
    }

    #[test]
    fn file_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AppConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::FileNotFound { .. })
        ));

        let ini = dir.path().join("agents.ini");
        std::fs::write(&ini, "[agents]").unwrap();
        assert!(matches!(
            AppConfig::from_file(&ini),
            Err(ConfigError::UnsupportedFormat { .. })
        ));

        let bad = dir.path().join("agents.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            AppConfig::from_file(&bad),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
