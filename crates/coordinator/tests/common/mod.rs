//! Participants shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tally_coordinator::{BoxError, Context, GroupSelector, Participant, Recoverable, Vote};

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(journal: &Journal) -> Vec<String> {
    journal.lock().clone()
}

pub fn count(journal: &Journal, call: &str) -> usize {
    journal.lock().iter().filter(|c| *c == call).count()
}

/// Votes from a script (then a fallback) and records every call.
///
/// `commit` and `abort` leave `<name>.COMMITTED` / `<name>.ABORTED` in the
/// context so tests can wait for them.
pub struct Recorder {
    name: String,
    journal: Journal,
    script: Mutex<VecDeque<Vote>>,
    fallback: Vote,
    select: Option<String>,
    recoverable: bool,
    delay: Option<Duration>,
}

impl Recorder {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            script: Mutex::new(VecDeque::new()),
            fallback: Vote::prepared(),
            select: None,
            recoverable: false,
            delay: None,
        }
    }

    /// Vote `vote` on every prepare not covered by the script
    pub fn voting(mut self, vote: Vote) -> Self {
        self.fallback = vote;
        self
    }

    /// Vote `votes` on the first prepares, in order
    pub fn scripted(self, votes: Vec<Vote>) -> Self {
        *self.script.lock() = votes.into();
        self
    }

    pub fn selecting(mut self, groups: &str) -> Self {
        self.select = Some(groups.to_string());
        self
    }

    pub fn recoverable(mut self) -> Self {
        self.recoverable = true;
        self
    }

    /// Sleep this long inside prepare
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn arc(self) -> Arc<dyn Participant> {
        Arc::new(self)
    }

    fn record(&self, call: &str) {
        self.journal.lock().push(format!("{}:{}", self.name, call));
    }
}

#[async_trait]
impl Participant for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, _id: u64, _ctx: &Context) -> Result<Vote, BoxError> {
        self.record("prepare");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().pop_front();
        Ok(scripted.unwrap_or(self.fallback))
    }

    async fn commit(&self, _id: u64, ctx: &Context) -> Result<(), BoxError> {
        self.record("commit");
        ctx.put(format!("{}.COMMITTED", self.name), true);
        Ok(())
    }

    async fn abort(&self, _id: u64, ctx: &Context) -> Result<(), BoxError> {
        self.record("abort");
        ctx.put(format!("{}.ABORTED", self.name), true);
        Ok(())
    }

    fn recoverable(&self) -> Option<&dyn Recoverable> {
        if self.recoverable {
            Some(self as &dyn Recoverable)
        } else {
            None
        }
    }

    fn group_selector(&self) -> Option<&dyn GroupSelector> {
        if self.select.is_some() {
            Some(self as &dyn GroupSelector)
        } else {
            None
        }
    }
}

#[async_trait]
impl Recoverable for Recorder {
    async fn recover(&self, _id: u64, ctx: Context, commit: bool) -> Result<Context, BoxError> {
        self.record(if commit { "recover(commit)" } else { "recover(abort)" });
        ctx.put("RECOVERED", true);
        Ok(ctx)
    }
}

#[async_trait]
impl GroupSelector for Recorder {
    async fn select(&self, _id: u64, _ctx: &Context) -> Result<Option<String>, BoxError> {
        Ok(self.select.clone())
    }
}

/// Wait for a flag left by a participant
pub async fn wait_for(ctx: &Context, key: &str) -> bool {
    ctx.get_timeout(key, Duration::from_secs(5)).await.is_some()
}
