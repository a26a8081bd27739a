//! Transaction coordinator engine

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::log::{TxnLog, TxnState};
use crate::participant::{Action, GroupSelector, Participant, Vote, guarded};
use crate::paused::{PAUSED_TRANSACTION, PausedTransaction, RUN_LATCH, RunLatch};
use crate::pipeline::Pipeline;
use crate::recovery::RecoveryReport;
use crate::registry::ParticipantRegistry;
use crate::stores::Stores;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tally_context::Context;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Reserved key of the marker that stops one session
const STOP_SIGNAL: &str = "COORDINATOR_STOP";

/// Pause before a session retries a failing input queue
const TAKE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Stops a session started in the given generation
struct StopSignal(u64);

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Committed
    Prepared,
    /// Rolled back
    Aborted,
    /// Rolled back and handed to the retry queue
    Retry,
    /// Suspended until the context is resumed
    Paused,
    /// No participant joined
    NoJoin,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Prepared => write!(f, "PREPARED"),
            Disposition::Aborted => write!(f, "ABORTED"),
            Disposition::Retry => write!(f, "RETRY"),
            Disposition::Paused => write!(f, "PAUSED"),
            Disposition::NoJoin => write!(f, "NO_JOIN"),
        }
    }
}

/// Working state of one transaction's prepare loop
struct TxnRun {
    id: u64,
    members: Vec<Arc<dyn Participant>>,
    work: VecDeque<Arc<dyn Participant>>,
    aborting: bool,
    retry: bool,
    visited: usize,
}

impl TxnRun {
    fn new(id: u64, participants: &[Arc<dyn Participant>]) -> Self {
        Self {
            id,
            members: Vec::new(),
            work: participants.iter().cloned().collect(),
            aborting: false,
            retry: false,
            visited: 0,
        }
    }

    fn resumed(paused: &PausedTransaction) -> Self {
        Self {
            id: paused.id(),
            members: paused.members().to_vec(),
            work: paused.remaining().clone(),
            aborting: paused.is_aborting() || paused.is_expired(),
            retry: paused.is_retry(),
            visited: paused.visited(),
        }
    }

    fn disposition(&self) -> Disposition {
        if self.members.is_empty() {
            Disposition::NoJoin
        } else if self.aborting && self.retry {
            Disposition::Retry
        } else if self.aborting {
            Disposition::Aborted
        } else {
            Disposition::Prepared
        }
    }
}

/// Keeps an id in the engine's in-flight set until dropped
struct InFlight<'a> {
    active: &'a Mutex<HashSet<u64>>,
    id: u64,
    held: bool,
}

impl<'a> InFlight<'a> {
    fn new(active: &'a Mutex<HashSet<u64>>, id: u64) -> Self {
        active.lock().insert(id);
        Self {
            active,
            id,
            held: false,
        }
    }

    /// Leave the id in flight after this run; the transaction paused
    fn hold(mut self) {
        self.held = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.held {
            self.active.lock().remove(&self.id);
        }
    }
}

/// State shared by the sessions and background tasks
pub(crate) struct Engine {
    pub(crate) config: CoordinatorConfig,
    pub(crate) pipeline: Pipeline,
    pub(crate) stores: Stores,
    pub(crate) log: TxnLog,
    /// Ids with a live or paused transaction in this process
    pub(crate) active: Mutex<HashSet<u64>>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
}

impl Engine {
    fn enqueue(&self, ctx: Context) -> Result<()> {
        self.stores.input.push(&self.config.queue, ctx)?;
        Ok(())
    }

    /// Run one unit of work from prepare through commit/abort
    async fn execute(self: &Arc<Self>, ctx: Context) -> Result<Disposition> {
        let latch = ctx.get_or_insert_object(RUN_LATCH, RunLatch::default);
        if !latch.enter() {
            return Err(CoordinatorError::InProgress);
        }

        let (mut run, in_flight) = match self.start_run(&ctx).await {
            Ok(started) => started,
            Err(e) => {
                latch.leave();
                return Err(e);
            }
        };

        let disposition = self.prepare(&mut run, &ctx).await;
        ctx.profiler().checkpoint("prepare");

        if disposition == Disposition::Paused {
            self.pause(run, &ctx, &latch);
            in_flight.hold();
            return Ok(Disposition::Paused);
        }
        latch.leave();

        let (disposition, completed) = self.complete(&run, &ctx, disposition).await;
        self.flush_trace(run.id, &ctx, disposition);
        drop(in_flight);
        completed.map(|()| disposition)
    }

    /// Pick up a paused transaction or begin a new one
    async fn start_run(&self, ctx: &Context) -> Result<(TxnRun, InFlight<'_>)> {
        let Some(paused) = ctx.get_object::<PausedTransaction>(PAUSED_TRANSACTION) else {
            return self.begin(ctx).await;
        };

        ctx.remove(PAUSED_TRANSACTION);
        // Re-queued without resume(): cancel a pending timer. The latch
        // already made this run the only one.
        if paused.claim() {
            tracing::debug!(txn = paused.id(), "Paused transaction re-queued directly");
        }
        if paused.is_expired() {
            tracing::warn!(txn = paused.id(), "Pause timed out, aborting");
            ctx.log("resumed after pause timeout");
        } else {
            ctx.log("resumed");
        }
        Ok((TxnRun::resumed(&paused), InFlight::new(&self.active, paused.id())))
    }

    async fn begin(&self, ctx: &Context) -> Result<(TxnRun, InFlight<'_>)> {
        let id = self
            .log
            .next_id_with(|id| {
                self.active.lock().insert(id);
            })
            .await?;
        let in_flight = InFlight::new(&self.active, id);

        if let Err(e) = self.open(id, ctx) {
            tracing::error!(txn = id, "Failed to open transaction: {}", e);
            // Nothing was prepared yet; close the id so the tail can pass it
            if let Err(e) = self.close(id).await {
                tracing::error!(txn = id, "Failed to close transaction: {}", e);
            }
            return Err(e);
        }

        ctx.log(format!("{} txn {} started", self.config.name, id));
        Ok((TxnRun::new(id, self.pipeline.default_group()), in_flight))
    }

    fn open(&self, id: u64, ctx: &Context) -> Result<()> {
        self.log.set_state(id, TxnState::Preparing)?;
        if self.config.recover {
            self.log.snapshot(id, ctx)?;
        }
        Ok(())
    }

    /// Mark `id` done and purge what the tail can pass
    async fn close(&self, id: u64) -> Result<()> {
        self.log.set_state(id, TxnState::Done)?;
        self.log.advance_tail().await?;
        Ok(())
    }

    async fn prepare(&self, run: &mut TxnRun, ctx: &Context) -> Disposition {
        while let Some(participant) = run.work.pop_front() {
            run.visited += 1;
            if run.visited > self.config.max_participants {
                tracing::warn!(
                    txn = run.id,
                    "Loop detected: more than {} participants visited",
                    self.config.max_participants
                );
                ctx.log(format!(
                    "loop detected after {} participants",
                    self.config.max_participants
                ));
                run.aborting = true;
                run.retry = false;
                return Disposition::Aborted;
            }

            let vote = self.vote(run.id, &participant, ctx, run.aborting).await;
            ctx.log(format!("prepare: {} {}", participant.name(), vote));

            match vote.action {
                Action::Aborted => run.aborting = true,
                Action::Retry => {
                    run.aborting = true;
                    run.retry = true;
                }
                Action::Prepared | Action::Pause => {}
            }

            if !vote.read_only && self.config.recover {
                if let Err(e) = self.log.snapshot(run.id, ctx) {
                    tracing::error!(txn = run.id, "Failed to snapshot context: {}", e);
                    ctx.log(format!("snapshot failed: {}", e));
                    run.aborting = true;
                }
            }

            if !vote.no_join {
                run.members.push(participant.clone());
            }

            if vote.action == Action::Pause {
                return Disposition::Paused;
            }

            if vote.action == Action::Prepared {
                if let Some(selector) = participant.group_selector() {
                    self.select_groups(run, participant.name(), selector, ctx).await;
                }
            }
        }

        run.disposition()
    }

    async fn vote(
        &self,
        id: u64,
        participant: &Arc<dyn Participant>,
        ctx: &Context,
        aborting: bool,
    ) -> Vote {
        if aborting {
            let Some(preparer) = participant.abort_preparer() else {
                return Vote::aborted().no_join();
            };
            return match guarded(preparer.prepare_for_abort(id, ctx)).await {
                Ok(vote) => vote,
                Err(e) => {
                    tracing::warn!(
                        txn = id,
                        participant = participant.name(),
                        "prepare_for_abort failed: {}",
                        e
                    );
                    ctx.log(format!("prepare_for_abort: {} failed: {}", participant.name(), e));
                    Vote::aborted().no_join()
                }
            };
        }

        match guarded(participant.prepare(id, ctx)).await {
            Ok(vote) => vote,
            Err(e) => {
                tracing::warn!(txn = id, participant = participant.name(), "prepare failed: {}", e);
                ctx.log(format!("prepare: {} failed: {}", participant.name(), e));
                Vote::aborted()
            }
        }
    }

    /// Splice the selected groups in front of the remaining work
    async fn select_groups(
        &self,
        run: &mut TxnRun,
        name: &str,
        selector: &dyn GroupSelector,
        ctx: &Context,
    ) {
        let selected = match guarded(selector.select(run.id, ctx)).await {
            Ok(Some(selected)) => selected,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(txn = run.id, participant = name, "group selection failed: {}", e);
                ctx.log(format!("select: {} failed: {}", name, e));
                run.aborting = true;
                return;
            }
        };

        let mut spliced = Vec::new();
        for group in selected.split_whitespace() {
            let Some(participants) = self.pipeline.group(group) else {
                tracing::warn!(txn = run.id, participant = name, "Unknown group '{}'", group);
                ctx.log(format!("select: unknown group '{}'", group));
                continue;
            };

            if self.config.recover {
                if let Err(e) = self.log.push_group(run.id, group) {
                    tracing::error!(txn = run.id, "Failed to record group '{}': {}", group, e);
                    run.aborting = true;
                }
            }
            ctx.log(format!("select: {} -> '{}'", name, group));
            spliced.extend(participants.iter().cloned());
        }

        for participant in spliced.into_iter().rev() {
            run.work.push_front(participant);
        }
    }

    fn pause(self: &Arc<Self>, run: TxnRun, ctx: &Context, latch: &RunLatch) {
        let id = run.id;
        ctx.put_object(
            PAUSED_TRANSACTION,
            PausedTransaction::new(id, run.members, run.work, run.aborting, run.retry, run.visited),
        );
        ctx.log("paused");
        tracing::debug!(txn = id, "Transaction paused");

        let Some(paused) = ctx.get_object::<PausedTransaction>(PAUSED_TRANSACTION) else {
            return;
        };

        // PAUSED_TRANSACTION must be in place before the latch says paused
        if latch.pause() {
            if paused.claim() {
                tracing::debug!(txn = id, "Resume requested before the pause, re-queuing");
                if let Err(e) = self.enqueue(ctx.clone()) {
                    tracing::error!(txn = id, "Failed to re-queue resumed transaction: {}", e);
                }
            }
            return;
        }

        let Some(timeout) = self.config.pause_timeout() else {
            return;
        };

        let engine = Arc::downgrade(self);
        let expired = paused.clone();
        let ctx = ctx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if expired.claim_expired() {
                tracing::warn!(txn = id, "Pause timeout of {:?} elapsed", timeout);
                if let Err(e) = engine.enqueue(ctx) {
                    tracing::error!(txn = id, "Failed to re-queue expired transaction: {}", e);
                }
            }
        });
        paused.set_timer(timer);
    }

    /// Commit or abort the members, then close the id.
    ///
    /// Store failures do not cut this short: every member still gets its
    /// commit or abort and the id is closed. The first failure is returned
    /// along with the disposition actually applied.
    async fn complete(
        self: &Arc<Self>,
        run: &TxnRun,
        ctx: &Context,
        disposition: Disposition,
    ) -> (Disposition, Result<()>) {
        let mut failure: Option<CoordinatorError> = None;

        let disposition = match disposition {
            Disposition::Prepared => match self.log.set_state(run.id, TxnState::Committing) {
                Ok(()) => {
                    if self.config.recover {
                        if let Err(e) = self.log.snapshot(run.id, ctx) {
                            tracing::error!(txn = run.id, "Failed to snapshot context: {}", e);
                        }
                    }
                    self.finish(run.id, ctx, &run.members, true, false).await;
                    Disposition::Prepared
                }
                Err(e) => {
                    // Without a durable COMMITTING, recovery would abort
                    tracing::error!(txn = run.id, "Failed to record commit, aborting: {}", e);
                    ctx.log(format!("commit not recorded: {}", e));
                    failure = Some(e);
                    self.finish(run.id, ctx, &run.members, false, false).await;
                    Disposition::Aborted
                }
            },
            Disposition::Aborted => {
                self.finish(run.id, ctx, &run.members, false, false).await;
                Disposition::Aborted
            }
            Disposition::Retry => {
                self.finish(run.id, ctx, &run.members, false, false).await;
                match self.stores.retry.push(&self.config.retry_queue, ctx.clone()) {
                    Ok(()) => self.ensure_retry_task(),
                    Err(e) => {
                        tracing::error!(txn = run.id, "Failed to park context for retry: {}", e);
                        failure = Some(e.into());
                    }
                }
                Disposition::Retry
            }
            Disposition::NoJoin | Disposition::Paused => disposition,
        };

        if let Err(e) = self.close(run.id).await {
            tracing::error!(txn = run.id, "Failed to close transaction: {}", e);
            failure.get_or_insert(e);
        }

        (disposition, failure.map_or(Ok(()), Err))
    }

    /// Commit or abort every member in join order.
    ///
    /// During recovery each member that can recover is given the chance to
    /// rebuild the working context first.
    pub(crate) async fn finish(
        &self,
        id: u64,
        ctx: &Context,
        members: &[Arc<dyn Participant>],
        commit: bool,
        recovering: bool,
    ) {
        let phase = if commit { "commit" } else { "abort" };
        let mut working = ctx.clone();

        for member in members {
            if recovering {
                if let Some(recoverable) = member.recoverable() {
                    match guarded(recoverable.recover(id, working.clone(), commit)).await {
                        Ok(recovered) => working = recovered,
                        Err(e) => tracing::warn!(
                            txn = id,
                            participant = member.name(),
                            "recover failed: {}",
                            e
                        ),
                    }
                }
            }

            let result = if commit {
                guarded(member.commit(id, &working)).await
            } else {
                guarded(member.abort(id, &working)).await
            };

            match result {
                Ok(()) => working.log(format!("{}: {}", phase, member.name())),
                Err(e) => {
                    tracing::warn!(txn = id, participant = member.name(), "{} failed: {}", phase, e);
                    working.log(format!("{}: {} failed: {}", phase, member.name(), e));
                }
            }
        }

        ctx.profiler().checkpoint(phase);
    }

    fn ensure_retry_task(self: &Arc<Self>) {
        let mut task = self.retry_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let engine = Arc::downgrade(self);
        let period = self.config.retry_interval();
        tracing::debug!("Starting retry task for {}", self.config.retry_queue);

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.drain_retries();
            }
        }));
    }

    /// Move everything waiting in the retry queue back onto the input queue
    fn drain_retries(&self) -> usize {
        let mut moved = 0;
        loop {
            match self.stores.retry.take_if_present(&self.config.retry_queue) {
                Ok(Some(ctx)) => {
                    if let Err(e) = self.enqueue(ctx) {
                        tracing::error!("Failed to re-queue retried transaction: {}", e);
                        break;
                    }
                    moved += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read {}: {}", self.config.retry_queue, e);
                    break;
                }
            }
        }
        if moved > 0 {
            tracing::debug!("Re-queued {} transactions for retry", moved);
        }
        moved
    }

    fn stop_retry_task(&self) {
        if let Some(task) = self.retry_task.lock().take() {
            task.abort();
        }
    }

    /// Emit the transaction's trace as a single event
    fn flush_trace(&self, id: u64, ctx: &Context, disposition: Disposition) {
        let profiler = ctx.profiler();
        profiler.checkpoint("end");

        let trace = ctx
            .trace_log()
            .drain()
            .iter()
            .map(|event| format!("{} {}", event.at.format("%H:%M:%S%.3f"), event.message))
            .collect::<Vec<_>>()
            .join("\n");

        tracing::info!(
            txn = id,
            coordinator = %self.config.name,
            disposition = %disposition,
            profiler = %profiler,
            "{}",
            trace
        );
        profiler.reset();
    }
}

async fn run_session(engine: Arc<Engine>, session: usize, generation: u64) {
    tracing::debug!(coordinator = %engine.config.name, session, "Session started");

    loop {
        let ctx = match engine.stores.input.take(&engine.config.queue, None).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(session, "Failed to take from {}: {}", engine.config.queue, e);
                tokio::time::sleep(TAKE_ERROR_BACKOFF).await;
                continue;
            }
        };

        if let Some(stop) = ctx.get_object::<StopSignal>(STOP_SIGNAL) {
            if stop.0 == generation {
                break;
            }
            // Left over from a session that had to be aborted
            continue;
        }

        match engine.execute(ctx).await {
            Ok(_) => {}
            Err(CoordinatorError::InProgress) => {
                tracing::warn!(session, "Context delivered while already running, skipped");
            }
            Err(e) => tracing::error!(session, "Transaction failed: {}", e),
        }
    }

    tracing::debug!(coordinator = %engine.config.name, session, "Session stopped");
}

/// Durable prepare/commit/abort coordinator
///
/// Contexts pushed onto the input queue are picked up by a fixed number of
/// sessions, each running one transaction at a time end to end.
pub struct Coordinator {
    engine: Arc<Engine>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Coordinator {
    /// Create a coordinator; nothing runs until [`Coordinator::start`]
    pub fn new(config: CoordinatorConfig, pipeline: Pipeline, stores: Stores) -> Result<Self> {
        config.validate()?;
        pipeline.validate()?;

        let log = TxnLog::new(stores.log.clone(), config.name.clone());
        log.seed_locks()?;

        Ok(Self {
            engine: Arc::new(Engine {
                config,
                pipeline,
                stores,
                log,
                active: Mutex::new(HashSet::new()),
                retry_task: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
            sessions: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Create a coordinator whose pipeline and stores come from `config`
    pub fn from_config(config: CoordinatorConfig, registry: &ParticipantRegistry) -> Result<Self> {
        let pipeline = registry.build(&config.pipeline)?;
        let stores = Stores::from_config(&config)?;
        Self::new(config, pipeline, stores)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.engine.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.engine.pipeline
    }

    pub fn stores(&self) -> &Stores {
        &self.engine.stores
    }

    /// The durable transaction log
    pub fn log(&self) -> &TxnLog {
        &self.engine.log
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Recover unfinished transactions, then start the sessions.
    ///
    /// Transactions still live or paused in this process (after a
    /// shutdown/start cycle) are left to finish on their own.
    pub async fn start(&self) -> Result<RecoveryReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoordinatorError::AlreadyRunning);
        }

        let report = if self.engine.config.recover {
            match self.engine.recover().await {
                Ok(report) => report,
                Err(e) => {
                    self.running.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        } else {
            RecoveryReport::default()
        };

        let generation = self.engine.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut sessions = self.sessions.lock();
        for session in 0..self.engine.config.sessions {
            sessions.push(tokio::spawn(run_session(
                self.engine.clone(),
                session,
                generation,
            )));
        }

        tracing::info!(
            "Coordinator {} started with {} sessions on {}",
            self.engine.config.name,
            self.engine.config.sessions,
            self.engine.config.queue
        );
        Ok(report)
    }

    /// Submit a unit of work
    pub fn queue(&self, ctx: Context) -> Result<()> {
        self.engine.enqueue(ctx)
    }

    /// Re-queue a paused transaction.
    ///
    /// While the transaction is still preparing, the request is remembered
    /// and honoured as soon as it pauses. Returns `false` when `ctx` is
    /// neither running nor paused, or was already resumed (or timed out).
    pub fn resume(&self, ctx: &Context) -> Result<bool> {
        if let Some(latch) = ctx.get_object::<RunLatch>(RUN_LATCH) {
            if latch.request_resume() {
                return Ok(true);
            }
        }

        match ctx.get_object::<PausedTransaction>(PAUSED_TRANSACTION) {
            Some(paused) if paused.claim() => {
                self.engine.enqueue(ctx.clone())?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Run one unit of work in the calling task, bypassing the input queue
    pub async fn execute(&self, ctx: Context) -> Result<Disposition> {
        self.engine.execute(ctx).await
    }

    /// Stop every session and the retry task.
    ///
    /// Each session gets `shutdown_timeout` to finish its current
    /// transaction before it is aborted.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(CoordinatorError::NotRunning);
        }

        let sessions = std::mem::take(&mut *self.sessions.lock());
        let generation = self.engine.generation.load(Ordering::Acquire);
        for _ in 0..sessions.len() {
            let stop = Context::new();
            stop.put_object(STOP_SIGNAL, StopSignal(generation));
            self.engine.enqueue(stop)?;
        }

        let timeout = self.engine.config.shutdown_timeout();
        for (session, mut handle) in sessions.into_iter().enumerate() {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(session, "Session ended abnormally: {}", e),
                Err(_) => {
                    tracing::warn!(session, "Session did not stop within {:?}, aborting", timeout);
                    handle.abort();
                    // Wait for the task to be dropped so its transaction
                    // leaves the in-flight set
                    if let Err(e) = handle.await {
                        if !e.is_cancelled() {
                            tracing::warn!(session, "Session ended abnormally: {}", e);
                        }
                    }
                }
            }
        }

        self.engine.stop_retry_task();
        tracing::info!("Coordinator {} stopped", self.engine.config.name);
        Ok(())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        for handle in self.sessions.lock().drain(..) {
            handle.abort();
        }
        self.engine.stop_retry_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::{AbortPreparer, BoxError};
    use async_trait::async_trait;
    use tally_store::{MemoryStore, Store, StoreError};

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Votes a fixed way and records every call
    struct Scripted {
        name: String,
        vote: Vote,
        journal: Journal,
        select: Option<String>,
        abort_vote: Option<Vote>,
    }

    impl Scripted {
        fn new(name: &str, vote: Vote, journal: &Journal) -> Self {
            Self {
                name: name.to_string(),
                vote,
                journal: journal.clone(),
                select: None,
                abort_vote: None,
            }
        }

        fn selecting(mut self, groups: &str) -> Self {
            self.select = Some(groups.to_string());
            self
        }

        fn preparing_for_abort(mut self, vote: Vote) -> Self {
            self.abort_vote = Some(vote);
            self
        }

        fn record(&self, call: &str) {
            self.journal.lock().push(format!("{}:{}", self.name, call));
        }
    }

    #[async_trait]
    impl Participant for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn prepare(&self, _id: u64, _ctx: &Context) -> std::result::Result<Vote, BoxError> {
            self.record("prepare");
            Ok(self.vote)
        }

        async fn commit(&self, _id: u64, _ctx: &Context) -> std::result::Result<(), BoxError> {
            self.record("commit");
            Ok(())
        }

        async fn abort(&self, _id: u64, _ctx: &Context) -> std::result::Result<(), BoxError> {
            self.record("abort");
            Ok(())
        }

        fn abort_preparer(&self) -> Option<&dyn AbortPreparer> {
            self.abort_vote.as_ref().map(|_| self as &dyn AbortPreparer)
        }

        fn group_selector(&self) -> Option<&dyn GroupSelector> {
            self.select.as_ref().map(|_| self as &dyn GroupSelector)
        }
    }

    #[async_trait]
    impl AbortPreparer for Scripted {
        async fn prepare_for_abort(&self, _id: u64, _ctx: &Context) -> std::result::Result<Vote, BoxError> {
            self.record("prepare_for_abort");
            Ok(self.abort_vote.unwrap_or(Vote::aborted()))
        }
    }

    #[async_trait]
    impl GroupSelector for Scripted {
        async fn select(&self, _id: u64, _ctx: &Context) -> std::result::Result<Option<String>, BoxError> {
            Ok(self.select.clone())
        }
    }

    struct Failing {
        panic: bool,
    }

    #[async_trait]
    impl Participant for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn prepare(&self, _id: u64, _ctx: &Context) -> std::result::Result<Vote, BoxError> {
            if self.panic {
                panic!("participant bug");
            }
            Err("insufficient funds".into())
        }
    }

    type FailWhen = Box<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

    /// Log store whose first put matching `fail_when` fails
    struct FlakyLog {
        inner: MemoryStore<Vec<u8>>,
        fail_when: Mutex<Option<FailWhen>>,
    }

    impl FlakyLog {
        fn failing(fail_when: impl Fn(&str, &[u8]) -> bool + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                fail_when: Mutex::new(Some(Box::new(fail_when))),
            })
        }
    }

    #[async_trait]
    impl Store<Vec<u8>> for FlakyLog {
        fn push_with_ttl(
            &self,
            key: &str,
            value: Vec<u8>,
            ttl: Option<Duration>,
        ) -> tally_store::Result<()> {
            self.inner.push_with_ttl(key, value, ttl)
        }

        fn put(&self, key: &str, value: Vec<u8>) -> tally_store::Result<()> {
            {
                let mut fail_when = self.fail_when.lock();
                if fail_when.as_ref().is_some_and(|f| f(key, &value)) {
                    fail_when.take();
                    return Err(StoreError::Codec("disk full".to_string()));
                }
            }
            self.inner.put(key, value)
        }

        fn take_if_present(&self, key: &str) -> tally_store::Result<Option<Vec<u8>>> {
            self.inner.take_if_present(key)
        }

        fn read_if_present(&self, key: &str) -> tally_store::Result<Option<Vec<u8>>> {
            self.inner.read_if_present(key)
        }

        fn read_all(&self, key: &str) -> tally_store::Result<Vec<Vec<u8>>> {
            self.inner.read_all(key)
        }

        fn remove(&self, key: &str) -> tally_store::Result<()> {
            self.inner.remove(key)
        }

        fn changes(&self) -> &tokio::sync::Notify {
            self.inner.changes()
        }
    }

    fn coordinator(pipeline: Pipeline) -> Coordinator {
        Coordinator::new(CoordinatorConfig::new("test"), pipeline, Stores::in_memory()).unwrap()
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn calls(journal: &Journal) -> Vec<String> {
        journal.lock().clone()
    }

    #[tokio::test]
    async fn test_all_prepared_commits_members_in_order() {
        let journal = journal();
        let coordinator = coordinator(
            Pipeline::new()
                .with_participant(Arc::new(Scripted::new("A", Vote::prepared(), &journal)))
                .with_participant(Arc::new(Scripted::new("B", Vote::prepared().no_join(), &journal)))
                .with_participant(Arc::new(Scripted::new("C", Vote::prepared(), &journal))),
        );

        let disposition = coordinator.execute(Context::new()).await.unwrap();

        assert_eq!(disposition, Disposition::Prepared);
        assert_eq!(
            calls(&journal),
            vec!["A:prepare", "B:prepare", "C:prepare", "A:commit", "C:commit"]
        );
    }

    #[tokio::test]
    async fn test_read_only_then_aborted_aborts_both() {
        let journal = journal();
        let coordinator = coordinator(
            Pipeline::new()
                .with_participant(Arc::new(Scripted::new("A", Vote::prepared().read_only(), &journal)))
                .with_participant(Arc::new(Scripted::new("B", Vote::aborted(), &journal))),
        );

        let disposition = coordinator.execute(Context::new()).await.unwrap();

        assert_eq!(disposition, Disposition::Aborted);
        assert_eq!(
            calls(&journal),
            vec!["A:prepare", "B:prepare", "A:abort", "B:abort"]
        );
    }

    #[tokio::test]
    async fn test_prepare_for_abort_after_abort() {
        let journal = journal();
        let coordinator = coordinator(
            Pipeline::new()
                .with_participant(Arc::new(Scripted::new("A", Vote::aborted(), &journal)))
                .with_participant(Arc::new(
                    Scripted::new("B", Vote::prepared(), &journal)
                        .preparing_for_abort(Vote::prepared()),
                ))
                .with_participant(Arc::new(Scripted::new("C", Vote::prepared(), &journal))),
        );

        let disposition = coordinator.execute(Context::new()).await.unwrap();

        // C has no abort capability: ABORTED|NO_JOIN, never prepared
        assert_eq!(disposition, Disposition::Aborted);
        assert_eq!(
            calls(&journal),
            vec!["A:prepare", "B:prepare_for_abort", "A:abort", "B:abort"]
        );
    }

    #[tokio::test]
    async fn test_failures_and_panics_abort() {
        for panic in [false, true] {
            let journal = journal();
            let coordinator = coordinator(
                Pipeline::new()
                    .with_participant(Arc::new(Scripted::new("A", Vote::prepared(), &journal)))
                    .with_participant(Arc::new(Failing { panic })),
            );

            let disposition = coordinator.execute(Context::new()).await.unwrap();

            assert_eq!(disposition, Disposition::Aborted);
            assert_eq!(calls(&journal), vec!["A:prepare", "A:abort"]);
        }
    }

    #[tokio::test]
    async fn test_no_join_only() {
        let journal = journal();
        let coordinator = coordinator(
            Pipeline::new()
                .with_participant(Arc::new(Scripted::new("A", Vote::prepared().no_join(), &journal))),
        );

        let disposition = coordinator.execute(Context::new()).await.unwrap();

        assert_eq!(disposition, Disposition::NoJoin);
        assert_eq!(calls(&journal), vec!["A:prepare"]);
    }

    #[tokio::test]
    async fn test_group_selection_splices_before_remaining() {
        let journal = journal();
        let coordinator = coordinator(
            Pipeline::new()
                .with_participant(Arc::new(
                    Scripted::new("router", Vote::prepared().no_join(), &journal)
                        .selecting("debit missing notify"),
                ))
                .with_participant(Arc::new(Scripted::new("close", Vote::prepared(), &journal)))
                .with_member("debit", Arc::new(Scripted::new("hold", Vote::prepared(), &journal)))
                .with_member("debit", Arc::new(Scripted::new("post", Vote::prepared(), &journal)))
                .with_member("notify", Arc::new(Scripted::new("sms", Vote::prepared(), &journal))),
        );

        let disposition = coordinator.execute(Context::new()).await.unwrap();

        assert_eq!(disposition, Disposition::Prepared);
        let prepared: Vec<String> = calls(&journal)
            .into_iter()
            .filter(|c| c.ends_with(":prepare"))
            .collect();
        assert_eq!(
            prepared,
            vec![
                "router:prepare",
                "hold:prepare",
                "post:prepare",
                "sms:prepare",
                "close:prepare"
            ]
        );
    }

    #[tokio::test]
    async fn test_self_selecting_group_hits_loop_cap() {
        let journal = journal();
        let pipeline = Pipeline::new()
            .with_participant(Arc::new(
                Scripted::new("entry", Vote::prepared().no_join(), &journal).selecting("spin"),
            ))
            .with_member(
                "spin",
                Arc::new(Scripted::new("spin", Vote::prepared().read_only(), &journal).selecting("spin")),
            );

        let config = CoordinatorConfig::new("test").with_max_participants(50);
        let coordinator = Coordinator::new(config, pipeline, Stores::in_memory()).unwrap();

        let disposition = coordinator.execute(Context::new()).await.unwrap();

        assert_eq!(disposition, Disposition::Aborted);
        let calls = calls(&journal);
        assert_eq!(calls.iter().filter(|c| *c == "spin:prepare").count(), 49);
        assert_eq!(calls.iter().filter(|c| *c == "spin:abort").count(), 49);
        assert!(!calls.iter().any(|c| c.ends_with(":commit")));
    }

    #[tokio::test]
    async fn test_finished_transactions_are_purged() {
        let journal = journal();
        let coordinator = coordinator(
            Pipeline::new()
                .with_participant(Arc::new(
                    Scripted::new("router", Vote::prepared(), &journal).selecting("debit"),
                ))
                .with_member("debit", Arc::new(Scripted::new("hold", Vote::prepared(), &journal))),
        );

        for _ in 0..3 {
            coordinator.execute(Context::new()).await.unwrap();
        }

        let log = coordinator.log();
        assert_eq!(log.head().unwrap(), 4);
        assert_eq!(log.tail().unwrap(), 4);
        for id in 1..4 {
            assert!(!log.contains(id).unwrap());
        }
    }

    #[tokio::test]
    async fn test_retry_moves_context_to_retry_queue() {
        let journal = journal();
        let config = CoordinatorConfig::new("test").with_retry_interval(Duration::from_secs(3600));
        let coordinator = Coordinator::new(
            config,
            Pipeline::new()
                .with_participant(Arc::new(Scripted::new("A", Vote::prepared(), &journal)))
                .with_participant(Arc::new(Scripted::new("B", Vote::retry(), &journal))),
            Stores::in_memory(),
        )
        .unwrap();

        let ctx = Context::new();
        ctx.put_with("STAN", "000001", true);
        let disposition = coordinator.execute(ctx).await.unwrap();

        assert_eq!(disposition, Disposition::Retry);
        assert_eq!(
            calls(&journal),
            vec!["A:prepare", "B:prepare", "A:abort", "B:abort"]
        );
        let stores = coordinator.stores();
        assert_eq!(stores.retry.read_all("TEST.RETRY").unwrap().len(), 1);
        assert!(stores.input.read_if_present("TEST").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_paused_transaction_resumes_after_pause_point() {
        let journal = journal();
        let coordinator = coordinator(
            Pipeline::new()
                .with_participant(Arc::new(Scripted::new("A", Vote::prepared(), &journal)))
                .with_participant(Arc::new(Scripted::new("B", Vote::pause(), &journal)))
                .with_participant(Arc::new(Scripted::new("C", Vote::prepared(), &journal))),
        );

        let ctx = Context::new();
        let disposition = coordinator.execute(ctx.clone()).await.unwrap();
        assert_eq!(disposition, Disposition::Paused);
        assert_eq!(calls(&journal), vec!["A:prepare", "B:prepare"]);

        let paused = ctx.get_object::<PausedTransaction>(PAUSED_TRANSACTION).unwrap();
        assert_eq!(paused.id(), 1);
        assert_eq!(paused.members().len(), 2);
        assert_eq!(paused.remaining().len(), 1);
        assert_eq!(coordinator.log().state(1).unwrap(), Some(TxnState::Preparing));

        let disposition = coordinator.execute(ctx.clone()).await.unwrap();
        assert_eq!(disposition, Disposition::Prepared);
        assert_eq!(
            calls(&journal),
            vec!["A:prepare", "B:prepare", "C:prepare", "A:commit", "B:commit", "C:commit"]
        );
        assert!(!ctx.contains(PAUSED_TRANSACTION));
        assert_eq!(coordinator.log().tail().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_open_does_not_block_the_tail() {
        let journal = journal();
        let log = FlakyLog::failing(|key, _| key.contains(":CONTEXT."));
        let coordinator = Coordinator::new(
            CoordinatorConfig::new("test"),
            Pipeline::new().with_participant(Arc::new(Scripted::new("A", Vote::prepared(), &journal))),
            Stores::with_log(log),
        )
        .unwrap();

        assert!(matches!(
            coordinator.execute(Context::new()).await,
            Err(CoordinatorError::Store(_))
        ));
        assert!(calls(&journal).is_empty());

        for _ in 0..5 {
            let disposition = coordinator.execute(Context::new()).await.unwrap();
            assert_eq!(disposition, Disposition::Prepared);
        }

        let log = coordinator.log();
        assert_eq!(log.head().unwrap(), 7);
        assert_eq!(log.tail().unwrap(), 7);
        for id in 1..7 {
            assert!(!log.contains(id).unwrap());
        }
    }

    #[tokio::test]
    async fn test_unrecorded_commit_aborts_members() {
        let journal = journal();
        let committing = TxnState::Committing.to_bytes().unwrap();
        let log = FlakyLog::failing(move |key, value| key.contains(":STATE.") && value == committing);
        let coordinator = Coordinator::new(
            CoordinatorConfig::new("test"),
            Pipeline::new()
                .with_participant(Arc::new(Scripted::new("A", Vote::prepared(), &journal)))
                .with_participant(Arc::new(Scripted::new("B", Vote::prepared(), &journal))),
            Stores::with_log(log),
        )
        .unwrap();

        let ctx = Context::new();
        assert!(coordinator.execute(ctx.clone()).await.is_err());
        assert_eq!(
            calls(&journal),
            vec!["A:prepare", "B:prepare", "A:abort", "B:abort"]
        );
        assert_eq!(coordinator.log().tail().unwrap(), 2);

        // The context is free to run again
        assert_eq!(coordinator.execute(ctx).await.unwrap(), Disposition::Prepared);
        assert_eq!(coordinator.log().tail().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_context_runs_in_one_session_at_a_time() {
        let journal = journal();
        let coordinator = coordinator(
            Pipeline::new()
                .with_participant(Arc::new(Scripted::new("A", Vote::prepared(), &journal)))
                .with_participant(Arc::new(Scripted::new("B", Vote::pause(), &journal))),
        );

        let ctx = Context::new();
        assert_eq!(coordinator.execute(ctx.clone()).await.unwrap(), Disposition::Paused);

        // Another session already holds the context
        let latch = ctx.get_object::<RunLatch>(RUN_LATCH).unwrap();
        assert!(latch.enter());
        assert!(matches!(
            coordinator.execute(ctx.clone()).await,
            Err(CoordinatorError::InProgress)
        ));
        assert!(ctx.contains(PAUSED_TRANSACTION));
        assert_eq!(calls(&journal), vec!["A:prepare", "B:prepare"]);
    }

    #[tokio::test]
    async fn test_start_and_shutdown_state() {
        let journal = journal();
        let coordinator = coordinator(
            Pipeline::new()
                .with_participant(Arc::new(Scripted::new("A", Vote::prepared(), &journal))),
        );

        assert!(matches!(
            coordinator.shutdown().await,
            Err(CoordinatorError::NotRunning)
        ));
        coordinator.start().await.unwrap();
        assert!(coordinator.is_running());
        assert!(matches!(
            coordinator.start().await,
            Err(CoordinatorError::AlreadyRunning)
        ));
        coordinator.shutdown().await.unwrap();
        assert!(!coordinator.is_running());
    }
}
