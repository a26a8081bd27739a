//! Startup replay of unfinished transactions

use crate::coordinator::Engine;
use crate::error::Result;
use crate::log::TxnState;
use crate::participant::Participant;
use std::sync::Arc;

/// What a recovery pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Transactions found COMMITTING and committed
    pub committed: usize,
    /// Transactions found PREPARING and aborted
    pub aborted: usize,
    /// Ids that were already resolved and only needed purging
    pub purged: usize,
    /// Ids owned by a transaction still live or paused in this process
    pub in_flight: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.committed == 0 && self.aborted == 0 && self.purged == 0 && self.in_flight == 0
    }
}

impl Engine {
    /// Resolve every id in `[tail, head)`, then move the tail up to head.
    ///
    /// Ids still in flight in this process are skipped and the tail stops at
    /// the first of them; ids resolved above it are marked DONE instead of
    /// purged, so tail advancement purges them once the live one finishes.
    pub(crate) async fn recover(&self) -> Result<RecoveryReport> {
        let _guard = self.log.lock_tail().await?;
        let (head, active) = self
            .log
            .with_head(|head| (head, self.active.lock().clone()))
            .await?;
        let tail = self.log.tail()?;
        let mut report = RecoveryReport::default();
        let mut floor = None;

        for id in tail..head {
            if active.contains(&id) {
                tracing::debug!(txn = id, "Transaction still in flight, skipped");
                floor.get_or_insert(id);
                report.in_flight += 1;
                continue;
            }

            match self.log.state(id)? {
                None => {
                    tracing::debug!(txn = id, "No state recorded, treating as resolved");
                    report.purged += 1;
                }
                Some(TxnState::Done) => report.purged += 1,
                Some(TxnState::Committing) => {
                    self.replay(id, true).await?;
                    report.committed += 1;
                }
                Some(TxnState::Preparing) => {
                    self.replay(id, false).await?;
                    report.aborted += 1;
                }
            }
            if floor.is_some() {
                self.log.set_state(id, TxnState::Done)?;
            } else {
                self.log.purge(id)?;
            }
        }

        let new_tail = floor.unwrap_or(head);
        if new_tail != tail {
            self.log.set_tail(new_tail)?;
        }
        if head != tail {
            tracing::info!(
                "{} recovered [{}, {}): {} committed, {} aborted, {} purged, {} in flight",
                self.config.name,
                tail,
                head,
                report.committed,
                report.aborted,
                report.purged,
                report.in_flight
            );
        }
        Ok(report)
    }

    async fn replay(&self, id: u64, commit: bool) -> Result<()> {
        let ctx = self.log.context(id)?.unwrap_or_default();
        let members = self.recovery_members(id)?;

        tracing::info!(
            txn = id,
            "Recovering transaction: {} {} participants",
            if commit { "commit" } else { "abort" },
            members.len()
        );
        self.finish(id, &ctx, &members, commit, true).await;
        Ok(())
    }

    /// The default group followed by every recorded group, each participant
    /// once
    fn recovery_members(&self, id: u64) -> Result<Vec<Arc<dyn Participant>>> {
        let mut members: Vec<Arc<dyn Participant>> = Vec::new();
        let mut add = |participants: &[Arc<dyn Participant>]| {
            for participant in participants {
                if !members.iter().any(|m| Arc::ptr_eq(m, participant)) {
                    members.push(participant.clone());
                }
            }
        };

        add(self.pipeline.default_group());
        for group in self.log.groups(id)? {
            match self.pipeline.group(&group) {
                Some(participants) => add(participants),
                None => tracing::warn!(txn = id, "Recorded group '{}' no longer exists", group),
            }
        }

        Ok(members)
    }
}
