//! Participant groups
//!
//! A pipeline is a set of named groups, each an ordered list of
//! participants. Every transaction starts with [`DEFAULT_GROUP`]; group
//! selectors pull the other groups in at run time.

use crate::error::{CoordinatorError, Result};
use crate::participant::Participant;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Name of the group every transaction starts with
pub const DEFAULT_GROUP: &str = "";

#[derive(Clone, Default)]
pub struct Pipeline {
    groups: HashMap<String, Vec<Arc<dyn Participant>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a participant to the default group
    pub fn with_participant(self, participant: Arc<dyn Participant>) -> Self {
        self.with_member(DEFAULT_GROUP, participant)
    }

    /// Append a participant to a named group
    pub fn with_member(mut self, group: impl Into<String>, participant: Arc<dyn Participant>) -> Self {
        self.groups.entry(group.into()).or_default().push(participant);
        self
    }

    /// Replace a named group
    pub fn with_group(mut self, group: impl Into<String>, participants: Vec<Arc<dyn Participant>>) -> Self {
        self.groups.insert(group.into(), participants);
        self
    }

    /// Participants of `name`, `None` for an unknown group
    pub fn group(&self, name: &str) -> Option<&[Arc<dyn Participant>]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    pub fn default_group(&self) -> &[Arc<dyn Participant>] {
        self.group(DEFAULT_GROUP).unwrap_or(&[])
    }

    pub fn group_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.groups.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    /// A pipeline without a default group can never run a transaction
    pub fn validate(&self) -> Result<()> {
        if self.default_group().is_empty() {
            return Err(CoordinatorError::Configuration(
                "default participant group is empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for name in self.group_names() {
            let members: Vec<&str> = self.groups[name].iter().map(|p| p.name()).collect();
            map.entry(&name, &members);
        }
        map.finish()
    }
}
