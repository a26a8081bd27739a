//! Per-transaction trace log

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;

/// A single trace message
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Ordered trace messages collected while a transaction runs
///
/// The coordinator drains it when the transaction finishes and emits it as
/// one structured log event.
#[derive(Debug, Default)]
pub struct TraceLog {
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message
    pub fn record(&self, message: impl Into<String>) {
        self.events.lock().push(TraceEvent {
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// Copy of every recorded event
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Remove and return every recorded event
    pub fn drain(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl fmt::Display for TraceLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, event) in self.events.lock().iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{} {}", event.at.format("%H:%M:%S%.3f"), event.message)?;
        }
        Ok(())
    }
}
