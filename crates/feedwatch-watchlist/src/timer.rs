use std::collections::{BTreeMap, HashMap};

use feedwatch_core::StreamId;

use crate::state::AggregateId;

pub type TimerId = u64;

/// What a single-shot timer fires for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// First refresh for an aggregate's provider stream did not arrive.
    Request(AggregateId),
    /// Ack for a post did not arrive. Keyed by provider stream and post id.
    PostAck { provider_stream: StreamId, post_id: u32 },
}

/// Deadline-ordered single-shot timers.
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: TimerId,
    by_deadline: BTreeMap<(u64, TimerId), TimerKind>,
    deadlines: HashMap<TimerId, u64>,
}

impl TimerQueue {
    pub fn schedule(&mut self, deadline_ms: u64, kind: TimerKind) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        self.by_deadline.insert((deadline_ms, id), kind);
        self.deadlines.insert(id, deadline_ms);
        id
    }

    /// Cancels a timer; cancelling an already-fired timer is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(deadline) = self.deadlines.remove(&id) {
            self.by_deadline.remove(&(deadline, id));
        }
    }

    /// Removes and returns every timer due at or before `now_ms`, oldest first.
    pub fn expire(&mut self, now_ms: u64) -> Vec<TimerKind> {
        let later = self.by_deadline.split_off(&(now_ms.saturating_add(1), 0));
        let due = std::mem::replace(&mut self.by_deadline, later);
        due.into_iter()
            .map(|((_, id), kind)| {
                self.deadlines.remove(&id);
                kind
            })
            .collect()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn clear(&mut self) {
        self.by_deadline.clear();
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{TimerKind, TimerQueue};

    #[test]
    fn expire_returns_due_timers_in_deadline_order() {
        let mut timers = TimerQueue::default();
        timers.schedule(30, TimerKind::Request(3));
        timers.schedule(10, TimerKind::Request(1));
        timers.schedule(20, TimerKind::Request(2));

        assert!(timers.expire(5).is_empty());
        assert_eq!(
            timers.expire(20),
            vec![TimerKind::Request(1), TimerKind::Request(2)]
        );
        assert_eq!(timers.next_deadline(), Some(30));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let mut timers = TimerQueue::default();
        let id = timers.schedule(10, TimerKind::Request(1));
        timers.schedule(
            10,
            TimerKind::PostAck {
                provider_stream: 5,
                post_id: 9,
            },
        );
        timers.cancel(id);
        timers.cancel(id);
        assert_eq!(
            timers.expire(100),
            vec![TimerKind::PostAck {
                provider_stream: 5,
                post_id: 9
            }]
        );
        assert!(timers.is_empty());
    }
}
