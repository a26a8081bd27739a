//! Suspended transactions
//!
//! When a participant votes PAUSE the engine stores a [`PausedTransaction`]
//! in the context under [`PAUSED_TRANSACTION`] and stops working on it. The
//! next session that takes the context off the input queue picks up exactly
//! where the prepare loop left off.
//!
//! A [`RunLatch`] kept in the context tracks whether a session is working on
//! it, so a context delivered twice runs once, and a resume that arrives
//! before the pause is recorded is not lost.

use crate::participant::Participant;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

/// Reserved context key holding the paused state
pub const PAUSED_TRANSACTION: &str = "PAUSED_TRANSACTION";

/// Snapshot of an interrupted prepare loop
pub struct PausedTransaction {
    id: u64,
    members: Vec<Arc<dyn Participant>>,
    remaining: VecDeque<Arc<dyn Participant>>,
    aborting: bool,
    retry: bool,
    visited: usize,
    resumed: AtomicBool,
    expired: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PausedTransaction {
    pub(crate) fn new(
        id: u64,
        members: Vec<Arc<dyn Participant>>,
        remaining: VecDeque<Arc<dyn Participant>>,
        aborting: bool,
        retry: bool,
        visited: usize,
    ) -> Self {
        Self {
            id,
            members,
            remaining,
            aborting,
            retry,
            visited,
            resumed: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            timer: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Participants that joined before the pause, in join order
    pub fn members(&self) -> &[Arc<dyn Participant>] {
        &self.members
    }

    /// Participants still to be prepared
    pub fn remaining(&self) -> &VecDeque<Arc<dyn Participant>> {
        &self.remaining
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting
    }

    pub fn is_retry(&self) -> bool {
        self.retry
    }

    pub fn visited(&self) -> usize {
        self.visited
    }

    /// Claim the right to re-queue this transaction.
    ///
    /// Only the first caller gets `true`; a pending pause timer is cancelled.
    pub fn claim(&self) -> bool {
        let claimed = self.try_resume();
        if claimed {
            self.cancel_timer();
        }
        claimed
    }

    /// Claim on behalf of the pause timer, marking the pause as expired so
    /// the resumed transaction aborts
    pub(crate) fn claim_expired(&self) -> bool {
        let claimed = self.try_resume();
        if claimed {
            self.expired.store(true, Ordering::Release);
        }
        claimed
    }

    fn try_resume(&self) -> bool {
        self.resumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    pub(crate) fn set_timer(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

/// Reserved context key holding the [`RunLatch`]
pub(crate) const RUN_LATCH: &str = "COORDINATOR_RUN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    Idle,
    Running,
    /// Running, and resume() was called before the transaction paused
    ResumeRequested,
    Paused,
}

/// Ownership of a context by the session running its transaction
#[derive(Debug)]
pub(crate) struct RunLatch {
    state: Mutex<LatchState>,
}

impl Default for RunLatch {
    fn default() -> Self {
        Self {
            state: Mutex::new(LatchState::Idle),
        }
    }
}

impl RunLatch {
    /// Take the context for one session; `false` if another session has it
    pub(crate) fn enter(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            LatchState::Idle | LatchState::Paused => {
                *state = LatchState::Running;
                true
            }
            LatchState::Running | LatchState::ResumeRequested => false,
        }
    }

    /// Release the context after a run that did not pause
    pub(crate) fn leave(&self) {
        *self.state.lock() = LatchState::Idle;
    }

    /// Mark the running transaction paused.
    ///
    /// Returns `true` when a resume was requested while it was running; the
    /// caller then re-queues it right away.
    pub(crate) fn pause(&self) -> bool {
        let mut state = self.state.lock();
        let requested = *state == LatchState::ResumeRequested;
        *state = LatchState::Paused;
        requested
    }

    /// Ask a running transaction to resume as soon as it pauses
    pub(crate) fn request_resume(&self) -> bool {
        let mut state = self.state.lock();
        if *state == LatchState::Running {
            *state = LatchState::ResumeRequested;
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for PausedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PausedTransaction")
            .field("id", &self.id)
            .field("members", &names(self.members.iter()))
            .field("remaining", &names(self.remaining.iter()))
            .field("aborting", &self.aborting)
            .field("retry", &self.retry)
            .field("visited", &self.visited)
            .field("resumed", &self.is_resumed())
            .field("expired", &self.is_expired())
            .finish()
    }
}

fn names<'a>(list: impl Iterator<Item = &'a Arc<dyn Participant>>) -> Vec<&'a str> {
    list.map(|p| p.name()).collect()
}
