use std::{cmp::Reverse, collections::BinaryHeap};

use crate::clock::Timestamp;

use super::SimulationEvent;

/// The priority queue driving the whole run. Events come out in
/// nondecreasing timestamp order; ties are broken by insertion order, so
/// same-timestamp events run FIFO.
pub(crate) struct EventQueue {
    scheduled: BinaryHeap<FutureEvent>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            scheduled: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, at: Timestamp, event: SimulationEvent) {
        self.scheduled.push(FutureEvent(at, self.next_seq, event));
        self.next_seq += 1;
    }

    pub fn pop(&mut self) -> Option<(Timestamp, SimulationEvent)> {
        let FutureEvent(at, _, event) = self.scheduled.pop()?;
        Some((at, event))
    }
}

// wrapper struct which holds a SimulationEvent,
// but is ordered by (timestamp, insertion order) in reverse
struct FutureEvent(Timestamp, u64, SimulationEvent);
impl FutureEvent {
    fn key(&self) -> Reverse<(Timestamp, u64)> {
        Reverse((self.0, self.1))
    }
}

impl PartialEq for FutureEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for FutureEvent {}
impl PartialOrd for FutureEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for FutureEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::millis, config::NodeId};

    fn tick(node: usize) -> SimulationEvent {
        SimulationEvent::GenerateTx(NodeId::new(node))
    }

    #[test]
    fn should_pop_in_timestamp_order() {
        let mut queue = EventQueue::new();
        let t0 = Timestamp::zero();
        queue.schedule(t0 + millis(20.0), tick(0));
        queue.schedule(t0 + millis(5.0), tick(1));
        queue.schedule(t0 + millis(10.0), tick(2));
        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|(at, _)| at).collect();
        assert_eq!(
            order,
            vec![t0 + millis(5.0), t0 + millis(10.0), t0 + millis(20.0)]
        );
    }

    #[test]
    fn should_break_timestamp_ties_fifo() {
        let mut queue = EventQueue::new();
        let at = Timestamp::zero() + millis(7.0);
        for node in 0..5 {
            queue.schedule(at, tick(node));
        }
        for expected in 0..5 {
            let Some((_, SimulationEvent::GenerateTx(node))) = queue.pop() else {
                panic!("expected a generation tick");
            };
            assert_eq!(node, NodeId::new(expected));
        }
    }
}
