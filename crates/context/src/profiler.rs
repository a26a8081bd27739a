//! Lightweight checkpoint profiler

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Time spent between two checkpoints
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub name: String,
    /// Time since the previous checkpoint
    pub elapsed: Duration,
    /// Time since the profiler was created (or reset)
    pub total: Duration,
}

#[derive(Debug)]
struct ProfilerState {
    started: Instant,
    last: Instant,
    checkpoints: Vec<Checkpoint>,
}

/// Records named checkpoints for a transaction
#[derive(Debug)]
pub struct Profiler {
    state: Mutex<ProfilerState>,
}

impl Profiler {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(ProfilerState {
                started: now,
                last: now,
                checkpoints: Vec::new(),
            }),
        }
    }

    /// Record a checkpoint and return the time since the previous one
    pub fn checkpoint(&self, name: impl Into<String>) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock();
        let elapsed = now.duration_since(state.last);
        let total = now.duration_since(state.started);
        state.last = now;
        state.checkpoints.push(Checkpoint {
            name: name.into(),
            elapsed,
            total,
        });
        elapsed
    }

    /// Time since creation or the last reset
    pub fn elapsed(&self) -> Duration {
        self.state.lock().started.elapsed()
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.state.lock().checkpoints.clone()
    }

    /// Drop all checkpoints and restart the clock
    pub fn reset(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.started = now;
        state.last = now;
        state.checkpoints.clear();
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        for (i, cp) in state.checkpoints.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "{} [{:.3}/{:.3}ms]",
                cp.name,
                cp.elapsed.as_secs_f64() * 1000.0,
                cp.total.as_secs_f64() * 1000.0
            )?;
        }
        Ok(())
    }
}
