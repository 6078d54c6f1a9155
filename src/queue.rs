//! Priority + FIFO queue of runnable test attempts.
//!
//! Entries are ordered by `(priority desc, enqueued_at asc, seq asc)`. The
//! sequence number breaks timestamp ties so ordering is total and stable.
//!
//! A test whose allocation comes back `Pending` is never popped: workers use
//! [`QueueMonitor::claim_first`], which leaves non-runnable entries exactly
//! where they were. That keeps a saturated high-priority test at the head
//! while lower-priority tests that *can* run proceed around it.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::model::{PlanId, Priority, TestKey};
use crate::pool::AllocationRequest;

/// One queued attempt of one test.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTest {
    pub key: TestKey,
    pub attempt: u32,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub request: AllocationRequest,
}

type Position = (Reverse<Priority>, DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<Position, QueuedTest>,
    next_seq: u64,
}

impl Inner {
    fn insert(&mut self, test: QueuedTest) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert((Reverse(test.priority), test.enqueued_at, seq), test);
    }
}

/// The queue monitor.
#[derive(Debug, Default)]
pub struct QueueMonitor {
    inner: Mutex<Inner>,
}

impl QueueMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, test: QueuedTest) {
        self.lock().insert(test);
    }

    pub fn extend(&self, tests: impl IntoIterator<Item = QueuedTest>) {
        let mut inner = self.lock();
        for test in tests {
            inner.insert(test);
        }
    }

    /// Pops the head of the queue.
    pub fn next(&self) -> Option<QueuedTest> {
        self.lock().entries.pop_first().map(|(_, test)| test)
    }

    /// Walks the queue in order and removes the first entry for which `f`
    /// returns `Some`. Entries for which `f` returns `None` keep their place.
    ///
    /// `f` runs with the queue locked, so claims are serialized and start
    /// order follows queue order.
    pub fn claim_first<T>(
        &self,
        mut f: impl FnMut(&QueuedTest) -> Option<T>,
    ) -> Option<(QueuedTest, T)> {
        let mut inner = self.lock();
        let (position, claimed) = inner
            .entries
            .iter()
            .find_map(|(pos, test)| f(test).map(|claimed| (*pos, claimed)))?;
        let test = inner.entries.remove(&position)?;
        Some((test, claimed))
    }

    /// Re-inserts an attempt that was taken out but could not start. It keeps
    /// its original priority and timestamp; only equal-timestamp ties may
    /// reorder.
    pub fn requeue(&self, test: QueuedTest) {
        self.push(test);
    }

    /// Queues a retry attempt behind everything already waiting at its
    /// priority.
    pub fn requeue_retry(&self, mut test: QueuedTest) {
        test.enqueued_at = Utc::now();
        self.push(test);
    }

    /// Removes every queued entry of `plan`.
    pub fn remove_plan(&self, plan: &PlanId) -> Vec<QueuedTest> {
        let mut inner = self.lock();
        let positions: Vec<Position> = inner
            .entries
            .iter()
            .filter(|(_, test)| &test.key.plan == plan)
            .map(|(pos, _)| *pos)
            .collect();
        positions
            .into_iter()
            .filter_map(|pos| inner.entries.remove(&pos))
            .collect()
    }

    /// Removes entries matching `f`.
    pub fn drain_where(&self, mut f: impl FnMut(&QueuedTest) -> bool) -> Vec<QueuedTest> {
        let mut inner = self.lock();
        let positions: Vec<Position> = inner
            .entries
            .iter()
            .filter(|(_, test)| f(test))
            .map(|(pos, _)| *pos)
            .collect();
        positions
            .into_iter()
            .filter_map(|pos| inner.entries.remove(&pos))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Queue contents in dequeue order.
    pub fn snapshot(&self) -> Vec<QueuedTest> {
        self.lock().entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn queued(test: &str, priority: Priority, at: DateTime<Utc>) -> QueuedTest {
        QueuedTest {
            key: TestKey::new("plan", test),
            attempt: 1,
            priority,
            enqueued_at: at,
            request: AllocationRequest::default(),
        }
    }

    fn order(queue: &QueueMonitor) -> Vec<String> {
        queue
            .snapshot()
            .iter()
            .map(|t| t.key.test.to_string())
            .collect()
    }

    #[test]
    fn test_priority_then_fifo() {
        let t0 = Utc::now();
        let queue = QueueMonitor::new();
        queue.push(queued("low", Priority::Low, t0));
        queue.push(queued("normal-late", Priority::Normal, t0 + Duration::seconds(2)));
        queue.push(queued("normal-early", Priority::Normal, t0 + Duration::seconds(1)));
        queue.push(queued("critical", Priority::Critical, t0 + Duration::seconds(9)));

        assert_eq!(
            order(&queue),
            vec!["critical", "normal-early", "normal-late", "low"]
        );
        assert_eq!(queue.next().unwrap().key.test.as_str(), "critical");
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let t0 = Utc::now();
        let queue = QueueMonitor::new();
        for name in ["a", "b", "c"] {
            queue.push(queued(name, Priority::High, t0));
        }
        assert_eq!(order(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_claim_first_skips_without_reordering() {
        let t0 = Utc::now();
        let queue = QueueMonitor::new();
        queue.push(queued("blocked", Priority::High, t0));
        queue.push(queued("runnable", Priority::Low, t0));

        let (claimed, tag) = queue
            .claim_first(|t| (t.key.test.as_str() == "runnable").then_some(7))
            .unwrap();
        assert_eq!(claimed.key.test.as_str(), "runnable");
        assert_eq!(tag, 7);
        assert_eq!(order(&queue), vec!["blocked"]);

        assert!(queue.claim_first(|_| None::<()>).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_requeue_preserves_position() {
        let t0 = Utc::now();
        let queue = QueueMonitor::new();
        queue.push(queued("first", Priority::Normal, t0));
        queue.push(queued("second", Priority::Normal, t0 + Duration::seconds(1)));

        let head = queue.next().unwrap();
        queue.requeue(head);
        assert_eq!(order(&queue), vec!["first", "second"]);
    }

    #[test]
    fn test_requeue_retry_goes_behind_peers() {
        let t0 = Utc::now() - Duration::minutes(1);
        let queue = QueueMonitor::new();
        queue.push(queued("flaky", Priority::Normal, t0));
        queue.push(queued("other", Priority::Normal, t0 + Duration::seconds(1)));
        queue.push(queued("urgent", Priority::Critical, t0 + Duration::seconds(2)));

        let mut flaky = queue
            .claim_first(|t| (t.key.test.as_str() == "flaky").then_some(()))
            .unwrap()
            .0;
        flaky.attempt = 2;
        queue.requeue_retry(flaky);

        assert_eq!(order(&queue), vec!["urgent", "other", "flaky"]);
    }

    #[test]
    fn test_remove_plan() {
        let t0 = Utc::now();
        let queue = QueueMonitor::new();
        queue.push(queued("a", Priority::Normal, t0));
        let mut other = queued("b", Priority::Normal, t0);
        other.key = TestKey::new("other-plan", "b");
        queue.push(other);

        let removed = queue.remove_plan(&PlanId::from("plan"));
        assert_eq!(removed.len(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.snapshot()[0].key.plan.as_str(), "other-plan");
    }
}
