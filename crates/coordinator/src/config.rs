//! Coordinator configuration

use crate::error::{CoordinatorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// One participant as named in configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantConfig {
    /// Registry name of the participant constructor
    pub class: String,

    /// Free-form settings handed to the constructor
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl ParticipantConfig {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Participant groups as named in configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// The default group
    pub participants: Vec<ParticipantConfig>,

    /// Groups reachable through group selectors
    pub groups: HashMap<String, Vec<ParticipantConfig>>,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_participant(mut self, participant: ParticipantConfig) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn with_group(mut self, name: impl Into<String>, participants: Vec<ParticipantConfig>) -> Self {
        self.groups.insert(name.into(), participants);
        self
    }
}

/// Configuration for a [`Coordinator`](crate::Coordinator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Namespace of every durable log key
    pub name: String,

    /// Input queue key
    pub queue: String,

    /// Key of the queue holding transactions waiting to be retried
    pub retry_queue: String,

    /// Number of session workers
    pub sessions: usize,

    /// Period of the retry task
    pub retry_interval_ms: u64,

    /// How long a paused transaction may wait before it is aborted
    pub pause_timeout_ms: Option<u64>,

    /// Per-session join timeout on shutdown
    pub shutdown_timeout_ms: u64,

    /// Participants one transaction may visit before it is considered looping
    pub max_participants: usize,

    /// Snapshot contexts and replay unfinished transactions on start
    pub recover: bool,

    /// Directory of the persistent log; in-memory when unset
    pub data_dir: Option<PathBuf>,

    pub pipeline: PipelineConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "txnmgr".to_string(),
            queue: "TXNMGR".to_string(),
            retry_queue: "TXNMGR.RETRY".to_string(),
            sessions: 1,
            retry_interval_ms: 5_000,
            pause_timeout_ms: None,
            shutdown_timeout_ms: 10_000,
            max_participants: 1_000,
            recover: true,
            data_dir: None,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            queue: name.to_uppercase(),
            retry_queue: format!("{}.RETRY", name.to_uppercase()),
            name,
            ..Default::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| CoordinatorError::Configuration(format!("invalid configuration: {}", e)))
    }

    /// Set input queue
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set retry queue
    pub fn with_retry_queue(mut self, queue: impl Into<String>) -> Self {
        self.retry_queue = queue.into();
        self
    }

    /// Set number of sessions
    pub fn with_sessions(mut self, sessions: usize) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_pause_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pause_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_participants(mut self, max: usize) -> Self {
        self.max_participants = max;
        self
    }

    pub fn with_recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn pause_timeout(&self) -> Option<Duration> {
        self.pause_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sessions == 0 {
            return Err(CoordinatorError::Configuration(
                "at least one session is required".to_string(),
            ));
        }
        if self.max_participants == 0 {
            return Err(CoordinatorError::Configuration(
                "max_participants must be positive".to_string(),
            ));
        }
        if self.retry_interval_ms == 0 {
            return Err(CoordinatorError::Configuration(
                "retry_interval_ms must be positive".to_string(),
            ));
        }
        if self.queue == self.retry_queue {
            return Err(CoordinatorError::Configuration(format!(
                "input and retry queue are both '{}'",
                self.queue
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_with_defaults() {
        let config = CoordinatorConfig::from_json(
            r#"{
                "name": "acquirer",
                "sessions": 4,
                "pause_timeout_ms": 30000,
                "pipeline": {
                    "participants": [
                        {"class": "validate"},
                        {"class": "route", "properties": {"default": "debit"}}
                    ],
                    "groups": {
                        "debit": [{"class": "hold"}]
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.name, "acquirer");
        assert_eq!(config.sessions, 4);
        assert_eq!(config.pause_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_participants, 1_000);
        assert!(config.recover);
        assert_eq!(config.pipeline.participants.len(), 2);
        assert_eq!(config.pipeline.participants[1].property("default"), Some("debit"));
        assert_eq!(config.pipeline.groups["debit"][0].class, "hold");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            CoordinatorConfig::from_json("{\"sessions\": \"many\"}"),
            Err(CoordinatorError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate() {
        let config = CoordinatorConfig::new("acquirer");
        assert_eq!(config.queue, "ACQUIRER");
        assert_eq!(config.retry_queue, "ACQUIRER.RETRY");

        assert!(config.clone().with_sessions(0).validate().is_err());
        assert!(config.clone().with_retry_queue("ACQUIRER").validate().is_err());
        assert!(config.with_max_participants(10).validate().is_ok());
    }
}
