//! Work Queue (§4.3, master mode only): a bounded FIFO of pending
//! per-change handlers, populated by the LISTEN callback and drained by
//! the Controller's heartbeat.

use std::collections::VecDeque;

/// One change awaiting the `get_replication_log` → peer fan-out handler.
#[derive(Debug, Clone)]
pub struct WorkQueueEntry {
    pub replication_id: i64,
    /// False once the entry has been handed to the drain loop, preventing
    /// a second fire for the same notify.
    pub allow: bool,
}

/// Bounded FIFO gated by `max_queue`, equal to the database connection-pool
/// minimum so outstanding master work never starves the pool.
pub struct WorkQueue {
    entries: VecDeque<WorkQueueEntry>,
    progress: u32,
    max_queue: u32,
}

impl WorkQueue {
    pub fn new(max_queue: u32) -> Self {
        WorkQueue {
            entries: VecDeque::new(),
            progress: 0,
            max_queue,
        }
    }

    pub fn enqueue(&mut self, replication_id: i64) {
        self.entries.push_back(WorkQueueEntry {
            replication_id,
            allow: true,
        });
    }

    pub fn progress(&self) -> u32 {
        self.progress
    }

    pub fn max_queue(&self) -> u32 {
        self.max_queue
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pop the next fireable entry, per the drain rule in §4.3: entries
    /// with `allow = false` are skipped (already in flight), and the
    /// caller must stop requesting further entries once `progress()` has
    /// reached `max_queue()`.
    pub fn next_fireable(&mut self) -> Option<i64> {
        if self.progress >= self.max_queue {
            return None;
        }
        while let Some(front) = self.entries.front() {
            if front.allow {
                let entry = self.entries.pop_front().expect("front just matched Some");
                self.progress += 1;
                return Some(entry.replication_id);
            }
            self.entries.pop_front();
        }
        None
    }

    /// Called once a fired handler's fan-out completes (success or not):
    /// the entry is gone already (removed by `next_fireable`), only
    /// `progress` needs to drop so the drain can continue.
    pub fn complete(&mut self) {
        self.progress = self.progress.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_then_drain_respects_fifo_order() {
        let mut q = WorkQueue::new(4);
        q.enqueue(1);
        q.enqueue(2);
        assert_eq!(q.next_fireable(), Some(1));
        q.complete();
        assert_eq!(q.next_fireable(), Some(2));
        q.complete();
        assert_eq!(q.next_fireable(), None);
    }

    #[test]
    fn drain_pauses_once_progress_reaches_max_queue() {
        let mut q = WorkQueue::new(1);
        q.enqueue(1);
        q.enqueue(2);
        assert_eq!(q.next_fireable(), Some(1));
        // progress == max_queue now; second entry must wait for complete().
        assert_eq!(q.next_fireable(), None);
        q.complete();
        assert_eq!(q.next_fireable(), Some(2));
    }

    #[test]
    fn progress_never_goes_negative_on_extra_complete_calls() {
        let mut q = WorkQueue::new(4);
        q.complete();
        q.complete();
        assert_eq!(q.progress(), 0);
    }

    #[test]
    fn empty_queue_reports_len_zero() {
        let q = WorkQueue::new(4);
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }
}
