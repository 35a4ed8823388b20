//! Observable topic store: per-topic subscriber registry.
//!
//! The store handles "notify" (push an event to whoever subscribed);
//! "snapshot" (pull the current value for a topic) is served separately
//! by [`crate::manager::RootManager::snapshot`], because snapshots read
//! live tree state. External reactive-store bindings need exactly that
//! pair: a subscribe function and a snapshot getter.

use rustc_hash::FxHashMap;

use crate::events::{Topic, TreeEvent};

/// Handle returned by `subscribe`; pass to `unsubscribe` to release.
pub type SubscriberId = u64;

type Callback = Box<dyn FnMut(&TreeEvent)>;

/// Per-topic subscriber registry plus a firehose channel.
///
/// Dispatch order: topic subscribers in registration order, then
/// firehose subscribers in registration order.
#[derive(Default)]
pub struct TopicStore {
    next_id: SubscriberId,
    by_topic: FxHashMap<Topic, Vec<(SubscriberId, Callback)>>,
    firehose: Vec<(SubscriberId, Callback)>,
}

impl TopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one topic.
    pub fn subscribe(
        &mut self,
        topic: Topic,
        callback: impl FnMut(&TreeEvent) + 'static,
    ) -> SubscriberId {
        let id = self.fresh_id();
        self.by_topic
            .entry(topic)
            .or_default()
            .push((id, Box::new(callback)));
        id
    }

    /// Subscribe to every event regardless of topic.
    pub fn subscribe_all(&mut self, callback: impl FnMut(&TreeEvent) + 'static) -> SubscriberId {
        let id = self.fresh_id();
        self.firehose.push((id, Box::new(callback)));
        id
    }

    /// Remove a subscriber. Returns false if the id was not found.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        for subs in self.by_topic.values_mut() {
            if let Some(pos) = subs.iter().position(|(sid, _)| *sid == id) {
                let _ = subs.remove(pos);
                return true;
            }
        }
        if let Some(pos) = self.firehose.iter().position(|(sid, _)| *sid == id) {
            let _ = self.firehose.remove(pos);
            return true;
        }
        false
    }

    /// Deliver one event to its topic subscribers, then the firehose.
    pub fn notify(&mut self, event: &TreeEvent) {
        if let Some(subs) = self.by_topic.get_mut(&event.topic()) {
            for (_, callback) in subs.iter_mut() {
                callback(event);
            }
        }
        for (_, callback) in self.firehose.iter_mut() {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.by_topic.values().map(Vec::len).sum::<usize>() + self.firehose.len()
    }

    fn fresh_id(&mut self) -> SubscriberId {
        self.next_id += 1;
        self.next_id
    }
}
