//! Event types for tree change notifications.
//!
//! Every mutation queues `TreeEvent`s which are flushed to subscribers
//! in FIFO order at well-defined points. A UI binding subscribes to the
//! topics it renders; the test harness uses the same events to verify
//! ordering and revision invariants.

use crate::fetch::LayerStatus;
use crate::item::ItemId;
use crate::setting::SettingKey;

/// Events emitted by the root manager during mutation and settling.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeEvent {
    /// A group's ordered child list changed (insert, remove, move).
    ChildrenChanged { group: ItemId },
    /// Some structural change happened anywhere in the tree.
    ItemsChanged,
    /// A setting's effective value changed (plain write, fix-up, or
    /// override install/clear).
    SettingValueChanged { item: ItemId, key: SettingKey },
    /// A setting's override slot was written.
    SettingOverrideChanged { item: ItemId, key: SettingKey },
    /// A setting's available-value set changed.
    AvailableValuesChanged { item: ItemId, key: SettingKey },
    /// A layer's resolved settings tuple materially changed.
    SettingsChanged { layer: ItemId },
    /// A global setting changed on the root manager (real change only).
    GlobalSettingsChanged { key: String },
    /// A layer's fetch status moved.
    LayerStatusChanged { layer: ItemId, status: LayerStatus },
    /// A layer's fetched payload was replaced.
    LayerDataChanged { layer: ItemId },
    /// A composite parent took or released control of a layer.
    SubordinationChanged { layer: ItemId, subordinated: bool },
    /// The data revision counter advanced. Emitted once per bump.
    RevisionChanged { revision: u64, previous: u64 },
}

/// Subscription key: which class of event, scoped to an item where that
/// makes sense.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Children(ItemId),
    ItemsChanged,
    SettingValue(ItemId, SettingKey),
    SettingOverride(ItemId, SettingKey),
    AvailableValues(ItemId, SettingKey),
    SettingsChanged(ItemId),
    GlobalSettings,
    LayerStatus(ItemId),
    LayerData(ItemId),
    Subordination(ItemId),
    Revision,
}

impl TreeEvent {
    /// The topic this event is published under.
    pub fn topic(&self) -> Topic {
        match self {
            TreeEvent::ChildrenChanged { group } => Topic::Children(*group),
            TreeEvent::ItemsChanged => Topic::ItemsChanged,
            TreeEvent::SettingValueChanged { item, key } => Topic::SettingValue(*item, *key),
            TreeEvent::SettingOverrideChanged { item, key } => Topic::SettingOverride(*item, *key),
            TreeEvent::AvailableValuesChanged { item, key } => Topic::AvailableValues(*item, *key),
            TreeEvent::SettingsChanged { layer } => Topic::SettingsChanged(*layer),
            TreeEvent::GlobalSettingsChanged { .. } => Topic::GlobalSettings,
            TreeEvent::LayerStatusChanged { layer, .. } => Topic::LayerStatus(*layer),
            TreeEvent::LayerDataChanged { layer } => Topic::LayerData(*layer),
            TreeEvent::SubordinationChanged { layer, .. } => Topic::Subordination(*layer),
            TreeEvent::RevisionChanged { .. } => Topic::Revision,
        }
    }
}

/// Simple event collector for testing.
#[derive(Default)]
pub struct EventCollector {
    events: Vec<TreeEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn push(&mut self, event: TreeEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[TreeEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events published under the given topic, in arrival order.
    pub fn for_topic(&self, topic: &Topic) -> Vec<&TreeEvent> {
        self.events.iter().filter(|e| e.topic() == *topic).collect()
    }

    /// Revision values in arrival order.
    pub fn revisions(&self) -> Vec<u64> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TreeEvent::RevisionChanged { revision, .. } => Some(*revision),
                _ => None,
            })
            .collect()
    }

    /// Status transitions recorded for one layer, in arrival order.
    pub fn statuses_of(&self, layer: ItemId) -> Vec<LayerStatus> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TreeEvent::LayerStatusChanged { layer: l, status } if *l == layer => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Position of the first event matching the predicate.
    pub fn position(&self, pred: impl Fn(&TreeEvent) -> bool) -> Option<usize> {
        self.events.iter().position(|e| pred(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_collector_filtering() {
        let layer = ItemId(7);
        let mut collector = EventCollector::new();
        collector.push(TreeEvent::RevisionChanged {
            revision: 1,
            previous: 0,
        });
        collector.push(TreeEvent::LayerStatusChanged {
            layer,
            status: LayerStatus::Loading,
        });
        collector.push(TreeEvent::LayerStatusChanged {
            layer,
            status: LayerStatus::Success,
        });

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.revisions(), vec![1]);
        assert_eq!(
            collector.statuses_of(layer),
            vec![LayerStatus::Loading, LayerStatus::Success]
        );
        assert_eq!(collector.for_topic(&Topic::LayerStatus(layer)).len(), 2);
    }

    #[test]
    fn test_topic_scoping() {
        let a = ItemId(1);
        let b = ItemId(2);
        let ev = TreeEvent::SettingValueChanged {
            item: a,
            key: SettingKey::Ensemble,
        };
        assert_eq!(ev.topic(), Topic::SettingValue(a, SettingKey::Ensemble));
        assert_ne!(ev.topic(), Topic::SettingValue(b, SettingKey::Ensemble));
    }
}
