use std::collections::VecDeque;

use tracing::{debug, warn};

use am_types::{AmError, TxId};

use crate::requests::RequestTable;
use crate::update::SectorUpdate;

/// What the caller must do after a sector transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockResult {
    /// Queued behind other work, or a stale response was ignored.
    Delayed,
    /// A partial write is waiting on a read of the current contents.
    FirstEntry,
    /// A new in-flight update is ready to be put.
    MergedEntry,
    /// The in-flight put landed; the catalog update must follow.
    Stable,
    /// The sector has nothing left to do.
    Finished,
}

/// Per-sector serialization point.
///
/// Holds a FIFO of queued updates and at most one in-flight update. Queued
/// writes never overtake the in-flight one, so writes to a sector take
/// effect in arrival order. Only consecutive updates of the same transaction
/// are ever combined; the catalog entry of a merged update is staged under
/// that one transaction.
#[derive(Debug, Default)]
pub struct SectorLock {
    pending: VecDeque<SectorUpdate>,
    inflight: Option<SectorUpdate>,
}

impl SectorLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.inflight.is_none()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn inflight(&self) -> Option<&SectorUpdate> {
        self.inflight.as_ref()
    }

    pub fn inflight_mut(&mut self) -> Option<&mut SectorUpdate> {
        self.inflight.as_mut()
    }

    /// Oldest queued update.
    pub fn front(&self) -> Option<&SectorUpdate> {
        self.pending.front()
    }

    /// A read for RMW is outstanding.
    pub fn is_reading(&self) -> bool {
        self.inflight.is_none() && !self.pending.is_empty()
    }

    /// Queue `update`. Anything already queued or in flight makes it wait,
    /// even a whole-sector write: a second in-flight update would let the
    /// two puts land out of order.
    pub fn queue_update(&mut self, update: SectorUpdate) -> LockResult {
        if !self.is_idle() {
            self.pending.push_back(update);
            LockResult::Delayed
        } else if update.is_complete() {
            self.inflight = Some(update);
            LockResult::MergedEntry
        } else {
            self.pending.push_back(update);
            LockResult::FirstEntry
        }
    }

    /// Apply the RMW read. On success the leading queued updates of the
    /// oldest one's transaction are combined onto the read contents in
    /// arrival order and the result goes in flight. On failure those updates
    /// fail and the rest are restarted.
    pub fn get_resp(
        &mut self,
        read: Result<SectorUpdate, AmError>,
        requests: &mut RequestTable,
    ) -> LockResult {
        if !self.is_reading() {
            warn!("read response for a sector that is not reading; ignored");
            return LockResult::Delayed;
        }
        match read {
            Ok(mut base) => {
                let tx = self.pending.front().and_then(SectorUpdate::tx);
                self.combine_run(tx, &mut base, requests);
                self.inflight = Some(base);
                LockResult::MergedEntry
            }
            Err(error) => {
                let run = self.run_len(self.pending.front().and_then(SectorUpdate::tx));
                for update in self.pending.drain(..run) {
                    update.notify_all(Some(&error), requests);
                }
                self.restart(requests)
            }
        }
    }

    /// Apply the put response for `completed`, a result update naming the
    /// content that was written.
    pub fn write_resp(
        &mut self,
        completed: SectorUpdate,
        error: Option<AmError>,
        requests: &mut RequestTable,
    ) -> LockResult {
        if !self.matches_inflight(&completed) {
            return LockResult::Delayed;
        }
        let Some(mut failed) = self.inflight.take() else {
            return LockResult::Delayed;
        };
        match error {
            None => {
                failed.mark_cached();
                self.inflight = Some(failed);
                LockResult::Stable
            }
            Some(error) if self.run_len(failed.tx()) > 0 => {
                warn!(
                    offset = failed.offset(),
                    queued = self.pending.len(),
                    %error,
                    "sector put failed; retrying with queued writes folded in"
                );
                self.combine_run(failed.tx(), &mut failed, requests);
                self.inflight = Some(failed);
                LockResult::MergedEntry
            }
            Some(error) => {
                let mut completed = completed;
                failed.fold_into(&mut completed);
                completed.notify_all(Some(&error), requests);
                self.restart(requests)
            }
        }
    }

    /// Apply the catalog response for the in-flight update. Its waiters are
    /// notified either way; queued writes are then restarted.
    pub fn cat_resp(
        &mut self,
        completed: SectorUpdate,
        error: Option<AmError>,
        requests: &mut RequestTable,
    ) -> LockResult {
        if !self.matches_inflight(&completed) {
            return LockResult::Delayed;
        }
        let Some(done) = self.inflight.take() else {
            return LockResult::Delayed;
        };
        let mut completed = completed;
        for waiter in done.waiters() {
            completed.add_waiter(*waiter);
        }
        completed.notify_all(error.as_ref(), requests);
        match error {
            None => self.data_stable(done, requests),
            Some(_) => self.fail(requests),
        }
    }

    /// Restart queued writes on top of `stable`, whose contents are now
    /// durable and catalogued. Writes of another transaction cannot build on
    /// them and start over from a read in their own context.
    pub fn data_stable(&mut self, mut stable: SectorUpdate, requests: &mut RequestTable) -> LockResult {
        if self.run_len(stable.tx()) == 0 {
            return self.restart(requests);
        }
        stable.clear_waiters();
        self.combine_run(stable.tx(), &mut stable, requests);
        self.inflight = Some(stable);
        LockResult::MergedEntry
    }

    /// Restart queued writes after the in-flight update failed. Its contents
    /// cannot be trusted, so a fresh read is needed unless the oldest queued
    /// write replaces the whole sector.
    pub fn fail(&mut self, requests: &mut RequestTable) -> LockResult {
        self.restart(requests)
    }

    fn restart(&mut self, requests: &mut RequestTable) -> LockResult {
        let Some(front) = self.pending.front() else {
            return LockResult::Finished;
        };
        if !front.is_complete() {
            return LockResult::FirstEntry;
        }
        let Some(mut head) = self.pending.pop_front() else {
            return LockResult::Finished;
        };
        self.combine_run(head.tx(), &mut head, requests);
        self.inflight = Some(head);
        LockResult::MergedEntry
    }

    /// Number of leading queued updates that belong to `tx`.
    fn run_len(&self, tx: Option<TxId>) -> usize {
        self.pending.iter().take_while(|u| u.tx() == tx).count()
    }

    /// Combine the leading queued updates of `tx` onto `base`.
    fn combine_run(&mut self, tx: Option<TxId>, base: &mut SectorUpdate, requests: &mut RequestTable) {
        let run = self.run_len(tx);
        for update in self.pending.drain(..run) {
            base.combine(update, requests);
        }
    }

    fn matches_inflight(&self, completed: &SectorUpdate) -> bool {
        let current = self.inflight.as_ref().and_then(SectorUpdate::peek_content_id);
        let matched = current.is_some() && current == completed.peek_content_id();
        if !matched {
            debug!(
                offset = completed.offset(),
                "response does not match in-flight content; ignored"
            );
        }
        matched
    }
}
