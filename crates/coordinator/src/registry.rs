//! Name-to-constructor registry for participants named in configuration

use crate::config::{ParticipantConfig, PipelineConfig};
use crate::error::{CoordinatorError, Result};
use crate::participant::{BoxError, Participant};
use crate::pipeline::{DEFAULT_GROUP, Pipeline};
use std::collections::HashMap;
use std::sync::Arc;

type Constructor =
    Box<dyn Fn(&ParticipantConfig) -> std::result::Result<Arc<dyn Participant>, BoxError> + Send + Sync>;

/// Participant classes available to configuration
#[derive(Default)]
pub struct ParticipantRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `class`, replacing any previous one
    pub fn register<F>(&mut self, class: impl Into<String>, constructor: F)
    where
        F: Fn(&ParticipantConfig) -> std::result::Result<Arc<dyn Participant>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(class.into(), Box::new(constructor));
    }

    /// Builder form of [`ParticipantRegistry::register`]
    pub fn with<F>(mut self, class: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&ParticipantConfig) -> std::result::Result<Arc<dyn Participant>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.register(class, constructor);
        self
    }

    pub fn contains(&self, class: &str) -> bool {
        self.constructors.contains_key(class)
    }

    /// Instantiate one participant
    pub fn create(&self, config: &ParticipantConfig) -> Result<Arc<dyn Participant>> {
        let constructor = self.constructors.get(&config.class).ok_or_else(|| {
            CoordinatorError::Configuration(format!("unknown participant class '{}'", config.class))
        })?;

        constructor(config).map_err(|e| {
            CoordinatorError::Configuration(format!(
                "failed to create participant '{}': {}",
                config.class, e
            ))
        })
    }

    /// Resolve every participant of a pipeline definition
    pub fn build(&self, config: &PipelineConfig) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new().with_group(DEFAULT_GROUP, self.create_all(&config.participants)?);

        for (name, participants) in &config.groups {
            if name.as_str() == DEFAULT_GROUP {
                return Err(CoordinatorError::Configuration(
                    "the default group must be configured through 'participants'".to_string(),
                ));
            }
            pipeline = pipeline.with_group(name.clone(), self.create_all(participants)?);
        }

        pipeline.validate()?;
        Ok(pipeline)
    }

    fn create_all(&self, configs: &[ParticipantConfig]) -> Result<Vec<Arc<dyn Participant>>> {
        configs.iter().map(|config| self.create(config)).collect()
    }
}
