//! Fan-out of accepted writes to live subscribers.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;

use crate::types::{Flag, Id, Measurement};

struct Subscription {
    id: u64,
    ids: Vec<Id>,
    flag: Flag,
    sender: Sender<Measurement>,
}

/// Identifies a live subscription for later cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

pub struct SubscribeNotifier {
    next_id: AtomicU64,
    subs: RwLock<Vec<Subscription>>,
}

impl SubscribeNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), subs: RwLock::new(Vec::new()) }
    }

    /// Register a subscriber matching `ids` (empty = all) and `flag`
    /// (0 = any). Returns its id plus the receiving end of its channel.
    pub fn subscribe(&self, ids: Vec<Id>, flag: Flag) -> (SubscriptionId, Receiver<Measurement>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = crossbeam_channel::bounded(1024);
        self.subs.write().push(Subscription { id, ids, flag, sender });
        (SubscriptionId(id), receiver)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subs.write().retain(|s| s.id != id.0);
    }

    /// Fan an accepted write out to every matching subscriber. A subscriber
    /// whose channel is full or whose receiver was dropped is pruned.
    pub fn notify(&self, m: Measurement) {
        let mut dead = Vec::new();
        {
            let subs = self.subs.read();
            for sub in subs.iter() {
                if !m.in_ids(&sub.ids) || !m.in_flag(sub.flag) {
                    continue;
                }
                match sub.sender.try_send(m) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => dead.push(sub.id),
                }
            }
        }
        if !dead.is_empty() {
            self.subs.write().retain(|s| !dead.contains(&s.id));
        }
    }
}

impl Default for SubscribeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_subscriber_receives_write() {
        let notifier = SubscribeNotifier::new();
        let (_id, rx) = notifier.subscribe(vec![1], 0);
        notifier.notify(Measurement::new(1, 10, 1.0, 0));
        notifier.notify(Measurement::new(2, 10, 1.0, 0));
        assert_eq!(rx.try_recv().unwrap().id, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let notifier = SubscribeNotifier::new();
        let (id, rx) = notifier.subscribe(vec![], 0);
        notifier.unsubscribe(id);
        notifier.notify(Measurement::new(1, 10, 1.0, 0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_pruned_on_next_notify() {
        let notifier = SubscribeNotifier::new();
        {
            let (_id, _rx) = notifier.subscribe(vec![], 0);
        }
        notifier.notify(Measurement::new(1, 1, 0.0, 0));
        assert_eq!(notifier.subs.read().len(), 0);
    }
}
