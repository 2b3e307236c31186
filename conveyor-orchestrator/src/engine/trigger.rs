//! Trigger admission
//!
//! Duplicate suppression and the bounded admission queue feeding the worker
//! pool. Runs sharing a (repository, branch) lane are handed to workers one
//! at a time in arrival order.

use conveyor_core::domain::run::TriggerContext;
use conveyor_core::domain::trigger::LaneKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::engine::error::TriggerError;

type DedupKey = (String, String, String);

fn dedup_key(ctx: &TriggerContext) -> DedupKey {
    (
        ctx.repository.clone(),
        ctx.branch.clone(),
        ctx.change_ref.clone(),
    )
}

/// Remembers recent triggers by (repository, branch, changeRef)
pub struct Deduplicator {
    window: Duration,
    seen: Mutex<HashMap<DedupKey, (Uuid, Instant)>>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Claims the trigger for `run_id`, or returns the run that already
    /// claimed it within the window
    pub fn claim(&self, ctx: &TriggerContext, run_id: Uuid) -> Result<(), Uuid> {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.retain(|_, (_, at)| now.duration_since(*at) < self.window);

        let key = dedup_key(ctx);
        if let Some((existing, _)) = seen.get(&key) {
            return Err(*existing);
        }
        seen.insert(key, (run_id, now));
        Ok(())
    }

    /// Drops a claim whose run was never created
    pub fn release(&self, ctx: &TriggerContext, run_id: Uuid) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let key = dedup_key(ctx);
        if seen.get(&key).is_some_and(|(id, _)| *id == run_id) {
            seen.remove(&key);
        }
    }
}

/// A run handed to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub run_id: Uuid,
    pub lane: LaneKey,
}

#[derive(Default)]
struct QueueState {
    /// Runs waiting behind the active run of their lane
    lanes: HashMap<LaneKey, VecDeque<Uuid>>,
    /// Lanes with a run dispatched to a worker
    active: HashSet<LaneKey>,
    /// Admitted runs not yet picked up by a worker
    pending: usize,
}

/// Bounded admission queue with FIFO lanes
pub struct RunQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    sender: mpsc::UnboundedSender<Admission>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Admission>>,
}

impl RunQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserves a slot for a run about to be created
    pub fn try_reserve(&self) -> Result<(), TriggerError> {
        let mut state = self.state();
        if state.pending >= self.capacity {
            return Err(TriggerError::QueueFull);
        }
        state.pending += 1;
        Ok(())
    }

    /// Returns a reserved slot that was not used
    pub fn cancel_reservation(&self) {
        let mut state = self.state();
        state.pending = state.pending.saturating_sub(1);
    }

    /// Admits a run into a reserved slot
    pub fn admit(&self, run_id: Uuid, lane: LaneKey) {
        let mut state = self.state();
        if state.active.contains(&lane) {
            debug!("Run {} waits behind active run in lane {}", run_id, lane);
            state.lanes.entry(lane).or_default().push_back(run_id);
            return;
        }
        state.active.insert(lane.clone());
        drop(state);
        self.dispatch(Admission { run_id, lane });
    }

    /// Admits a run regardless of capacity (recovery and re-opened runs)
    pub fn readmit(&self, run_id: Uuid, lane: LaneKey) {
        self.state().pending += 1;
        self.admit(run_id, lane);
    }

    fn dispatch(&self, admission: Admission) {
        // The receiver lives as long as the queue
        let _ = self.sender.send(admission);
    }

    /// Waits for the next run to execute
    pub async fn next(&self) -> Option<Admission> {
        let admission = self.receiver.lock().await.recv().await?;
        let mut state = self.state();
        state.pending = state.pending.saturating_sub(1);
        Some(admission)
    }

    /// Marks the lane's active run terminal and dispatches the next one
    pub fn complete(&self, lane: &LaneKey) {
        let mut state = self.state();
        let next = state.lanes.get_mut(lane).and_then(VecDeque::pop_front);
        if state.lanes.get(lane).is_some_and(VecDeque::is_empty) {
            state.lanes.remove(lane);
        }

        match next {
            Some(run_id) => {
                drop(state);
                self.dispatch(Admission {
                    run_id,
                    lane: lane.clone(),
                });
            }
            None => {
                state.active.remove(lane);
            }
        }
    }

    /// Admitted runs not yet picked up by a worker
    pub fn pending(&self) -> usize {
        self.state().pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(branch: &str, change_ref: &str) -> TriggerContext {
        TriggerContext {
            repository: "acme/api".to_string(),
            branch: branch.to_string(),
            change_ref: change_ref.to_string(),
        }
    }

    fn lane(branch: &str) -> LaneKey {
        LaneKey::from(&ctx(branch, ""))
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_window() {
        let dedup = Deduplicator::new(Duration::from_secs(300));
        let first = Uuid::new_v4();

        assert!(dedup.claim(&ctx("main", "abc"), first).is_ok());
        assert_eq!(dedup.claim(&ctx("main", "abc"), Uuid::new_v4()), Err(first));
        // Different ref or branch is not a duplicate
        assert!(dedup.claim(&ctx("main", "def"), Uuid::new_v4()).is_ok());
        assert!(dedup.claim(&ctx("dev", "abc"), Uuid::new_v4()).is_ok());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(dedup.claim(&ctx("main", "abc"), Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_dedup_release() {
        let dedup = Deduplicator::new(Duration::from_secs(300));
        let run_id = Uuid::new_v4();
        dedup.claim(&ctx("main", "abc"), run_id).unwrap();
        dedup.release(&ctx("main", "abc"), run_id);
        assert!(dedup.claim(&ctx("main", "abc"), Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_queue_capacity() {
        let queue = RunQueue::new(2);
        queue.try_reserve().unwrap();
        queue.try_reserve().unwrap();
        assert!(matches!(queue.try_reserve(), Err(TriggerError::QueueFull)));

        queue.cancel_reservation();
        assert!(queue.try_reserve().is_ok());
    }

    #[tokio::test]
    async fn test_lane_fifo() {
        let queue = RunQueue::new(10);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let other = Uuid::new_v4();

        for (id, branch) in [(a, "main"), (b, "main"), (other, "dev"), (c, "main")] {
            queue.try_reserve().unwrap();
            queue.admit(id, lane(branch));
        }

        // Only the head of each lane is dispatched
        assert_eq!(queue.next().await.unwrap().run_id, a);
        assert_eq!(queue.next().await.unwrap().run_id, other);
        assert_eq!(queue.pending(), 2);

        queue.complete(&lane("main"));
        assert_eq!(queue.next().await.unwrap().run_id, b);
        queue.complete(&lane("main"));
        assert_eq!(queue.next().await.unwrap().run_id, c);
        queue.complete(&lane("main"));
        assert_eq!(queue.pending(), 0);

        // An idle lane dispatches immediately again
        let d = Uuid::new_v4();
        queue.try_reserve().unwrap();
        queue.admit(d, lane("main"));
        assert_eq!(queue.next().await.unwrap().run_id, d);
    }
}
