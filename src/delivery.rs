// Delivery tracking. A broker message is only acknowledged once every batch
// it was fanned out to has completed, and messages are released strictly in
// arrival order. Each worker owns its own tracker for the streams hashed to
// it, so per-stream ordering needs no cross-worker coordination.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rumqttc::QoS;

use crate::sink::{BatchId, DeliveryId};

/// What the broker needs to acknowledge one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub id: DeliveryId,
    pub topic: String,
    pub pkid: u16,
    pub qos: QoS,
}

/// Forwards acknowledgments to the broker. Must not block.
pub trait Acknowledger: Send + Sync {
    fn acknowledge(&self, receipt: &Receipt);
}

/// Terminal state of a received message. Ordered by severity: when a message
/// went to several batches the worst outcome wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    /// Written to every sink it was routed to.
    Stored,
    /// Undecodable; acknowledged because redelivery cannot fix it.
    Discarded,
    /// Recorded in the dead-letter log, then acknowledged.
    DeadLettered,
    /// The dead-letter write failed too; left unacknowledged so the broker
    /// redelivers it.
    Abandoned,
}

impl Outcome {
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, Outcome::Abandoned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub id: DeliveryId,
    pub outcome: Outcome,
}

struct Pending {
    receipt: Receipt,
    outstanding: usize,
    outcome: Outcome,
}

pub struct DeliveryTracker {
    order: VecDeque<DeliveryId>,
    pending: HashMap<DeliveryId, Pending>,
    batches: HashMap<BatchId, Vec<DeliveryId>>,
    acker: Arc<dyn Acknowledger>,
}

impl DeliveryTracker {
    pub fn new(acker: Arc<dyn Acknowledger>) -> Self {
        DeliveryTracker {
            order: VecDeque::new(),
            pending: HashMap::new(),
            batches: HashMap::new(),
            acker,
        }
    }

    /// Start tracking a message that will be written to `parts` batches.
    /// Zero parts means the message was discarded.
    pub fn register(&mut self, receipt: Receipt, parts: usize) -> Vec<Settled> {
        let id = receipt.id;
        let outcome = if parts == 0 { Outcome::Discarded } else { Outcome::Stored };
        self.order.push_back(id);
        self.pending.insert(
            id,
            Pending {
                receipt,
                outstanding: parts,
                outcome,
            },
        );
        self.release()
    }

    /// Record that `deliveries` are part of `batch`.
    pub fn attach(&mut self, batch: BatchId, deliveries: impl IntoIterator<Item = DeliveryId>) {
        self.batches.entry(batch).or_default().extend(deliveries);
    }

    /// Mark a batch as finished and acknowledge every message at the head of
    /// the arrival order that has no outstanding batch left.
    pub fn complete(&mut self, batch: BatchId, outcome: Outcome) -> Vec<Settled> {
        let Some(deliveries) = self.batches.remove(&batch) else {
            tracing::warn!(batch, "completion for unknown batch");
            return Vec::new();
        };
        for id in deliveries {
            if let Some(p) = self.pending.get_mut(&id) {
                p.outstanding = p.outstanding.saturating_sub(1);
                p.outcome = p.outcome.max(outcome);
            }
        }
        self.release()
    }

    fn release(&mut self) -> Vec<Settled> {
        let mut settled = Vec::new();
        while let Some(&id) = self.order.front() {
            match self.pending.get(&id) {
                Some(p) if p.outstanding > 0 => break,
                _ => {}
            }
            self.order.pop_front();
            if let Some(p) = self.pending.remove(&id) {
                if p.outcome.is_acknowledged() {
                    self.acker.acknowledge(&p.receipt);
                }
                settled.push(Settled { id, outcome: p.outcome });
            }
        }
        settled
    }

    /// Messages received but not yet settled.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records acknowledged delivery ids in call order.
    #[derive(Default)]
    pub(crate) struct RecordingAcker {
        pub acked: Mutex<Vec<DeliveryId>>,
    }

    impl RecordingAcker {
        pub(crate) fn acked(&self) -> Vec<DeliveryId> {
            self.acked.lock().unwrap().clone()
        }
    }

    impl Acknowledger for RecordingAcker {
        fn acknowledge(&self, receipt: &Receipt) {
            self.acked.lock().unwrap().push(receipt.id);
        }
    }

    pub(crate) fn receipt(id: DeliveryId) -> Receipt {
        Receipt {
            id,
            topic: "logistics/t/speed".to_string(),
            pkid: 0,
            qos: QoS::AtMostOnce,
        }
    }

    fn tracker() -> (DeliveryTracker, Arc<RecordingAcker>) {
        let acker = Arc::new(RecordingAcker::default());
        (DeliveryTracker::new(acker.clone()), acker)
    }

    #[test]
    fn test_acks_follow_arrival_order() {
        let (mut t, acker) = tracker();
        t.register(receipt(1), 1);
        t.register(receipt(2), 1);
        t.attach(10, [1]);
        t.attach(11, [2]);

        // the later batch finishes first: nothing may be acked yet
        assert!(t.complete(11, Outcome::Stored).is_empty());
        assert!(acker.acked().is_empty());

        let settled = t.complete(10, Outcome::Stored);
        assert_eq!(settled.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(acker.acked(), vec![1, 2]);
        assert_eq!(t.in_flight(), 0);
    }

    #[test]
    fn test_fan_out_waits_for_every_batch() {
        let (mut t, acker) = tracker();
        t.register(receipt(1), 2);
        t.attach(20, [1]);
        t.attach(21, [1]);

        assert!(t.complete(20, Outcome::Stored).is_empty());
        let settled = t.complete(21, Outcome::DeadLettered);
        assert_eq!(settled, vec![Settled { id: 1, outcome: Outcome::DeadLettered }]);
        assert_eq!(acker.acked(), vec![1]);
    }

    #[test]
    fn test_discard_is_acked_in_order() {
        let (mut t, acker) = tracker();
        t.register(receipt(1), 1);
        t.attach(30, [1]);
        // discarded message queued behind a pending one
        assert!(t.register(receipt(2), 0).is_empty());
        let settled = t.complete(30, Outcome::Stored);
        assert_eq!(
            settled,
            vec![
                Settled { id: 1, outcome: Outcome::Stored },
                Settled { id: 2, outcome: Outcome::Discarded },
            ]
        );
        assert_eq!(acker.acked(), vec![1, 2]);
    }

    #[test]
    fn test_abandoned_is_settled_without_ack() {
        let (mut t, acker) = tracker();
        t.register(receipt(1), 1);
        t.register(receipt(2), 1);
        t.attach(40, [1, 2]);
        let settled = t.complete(40, Outcome::Abandoned);
        assert_eq!(settled.len(), 2);
        assert!(settled.iter().all(|s| s.outcome == Outcome::Abandoned));
        assert!(acker.acked().is_empty());
        assert_eq!(t.in_flight(), 0);
    }

    #[test]
    fn test_every_delivery_settles_exactly_once() {
        let (mut t, acker) = tracker();
        let mut settled = Vec::new();
        for id in 0..50u64 {
            let parts = (id % 3) as usize; // 0, 1 or 2 batches
            settled.extend(t.register(receipt(id), parts));
            for p in 0..parts {
                let batch = id * 10 + p as u64;
                t.attach(batch, [id]);
            }
        }
        // complete in reverse order
        for id in (0..50u64).rev() {
            for p in 0..(id % 3) {
                let outcome = if id % 5 == 0 { Outcome::DeadLettered } else { Outcome::Stored };
                settled.extend(t.complete(id * 10 + p, outcome));
            }
        }
        let ids: Vec<_> = settled.iter().map(|s| s.id).collect();
        assert_eq!(ids, (0..50).collect::<Vec<_>>());
        assert_eq!(acker.acked(), ids);
        assert_eq!(t.in_flight(), 0);
    }
}
