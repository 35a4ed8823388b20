//! Root manager: the arena of tree items, global settings, the event
//! queue, and the fetch/settle pipeline.
//!
//! All mutation funnels through here. Each public operation queues
//! `TreeEvent`s while it works and flushes them FIFO before returning,
//! with one ordering guarantee: setting-change events are flushed
//! before any refetch those changes trigger, so a subscriber always
//! observes the new value before the Loading status that follows it.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use strata_protocol::SettingValue;

use crate::context::{LayerDefinition, SettingDelta};
use crate::dep_graph::DepNode;
use crate::error::TreeError;
use crate::events::{Topic, TreeEvent};
use crate::fetch::{
    abort_pair, CacheClient, FetchCtx, FetchError, FetchOutcome, FetchTicket, LayerStatus,
    NoopCacheClient, Payload,
};
use crate::item::{
    ColorScaleData, GroupData, GroupKind, Item, ItemId, ItemIdentity, ItemKind, LayerData,
    SharedSettingData,
};
use crate::setting::{Setting, SettingKey};
use crate::store::{SubscriberId, TopicStore};

/// Tuning knobs for the settle pipeline.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Maximum reaction/shared-recompute rounds per settle. Exceeding
    /// it logs a warning and stops rather than looping forever on a
    /// cyclic derivation.
    pub settle_budget: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { settle_budget: 8 }
    }
}

/// Current value for a topic, served on demand so late subscribers can
/// catch up without replaying events.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicSnapshot {
    Children(Vec<ItemId>),
    Items(Vec<ItemId>),
    Value(SettingValue),
    Override(Option<SettingValue>),
    AvailableValues(Vec<SettingValue>),
    Settings(Vec<(SettingKey, SettingValue)>),
    Globals(Vec<(String, SettingValue)>),
    Status(LayerStatus),
    Data(Option<Payload>),
    Subordinated(bool),
    Revision(u64),
}

/// What one settle pass did, for the debug log.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SettleReport {
    pub shared_passes: usize,
    pub refetches: usize,
    pub events: usize,
}

impl SettleReport {
    pub fn log_line(&self) -> String {
        format!(
            "settle: {} shared pass(es), {} refetch(es), {} event(s)",
            self.shared_passes, self.refetches, self.events
        )
    }
}

/// Owner of the item tree and everything reactive around it.
pub struct RootManager {
    pub(crate) items: FxHashMap<ItemId, Item>,
    pub(crate) root: ItemId,
    pub(crate) next_item_id: u64,
    pub(crate) global_settings: FxHashMap<String, SettingValue>,
    pub(crate) data_revision: u64,
    pub(crate) store: TopicStore,
    pub(crate) pending: VecDeque<TreeEvent>,
    pub(crate) cache: Box<dyn CacheClient>,
    pub(crate) config: EngineConfig,
}

impl Default for RootManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RootManager {
    pub fn new() -> Self {
        Self::with_cache(Box::new(NoopCacheClient))
    }

    pub fn with_cache(cache: Box<dyn CacheClient>) -> Self {
        let root = ItemId(1);
        let mut items = FxHashMap::default();
        let mut root_item = Item::new(
            root,
            ItemIdentity::new("root"),
            ItemKind::Group(GroupData::new(GroupKind::View)),
        );
        root_item.attached = true;
        items.insert(root, root_item);
        Self {
            items,
            root,
            next_item_id: 2,
            global_settings: FxHashMap::default(),
            data_revision: 0,
            store: TopicStore::new(),
            pending: VecDeque::new(),
            cache,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn root(&self) -> ItemId {
        self.root
    }

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.items.get(&id)
    }

    pub fn data_revision(&self) -> u64 {
        self.data_revision
    }

    pub fn global_setting(&self, key: &str) -> Option<&SettingValue> {
        self.global_settings.get(key)
    }

    pub fn children_of(&self, id: ItemId) -> Result<&[ItemId], TreeError> {
        let item = self.items.get(&id).ok_or(TreeError::UnknownItem(id))?;
        let group = item.as_group().ok_or(TreeError::NotAGroup(id))?;
        Ok(group.children())
    }

    /// Pre-order traversal of the subtree rooted at `id`, including the
    /// root of the subtree itself.
    pub fn subtree_preorder(&self, id: ItemId) -> Vec<ItemId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(item) = self.items.get(&next) else {
                continue;
            };
            order.push(next);
            if let Some(group) = item.as_group() {
                for child in group.children().iter().rev() {
                    stack.push(*child);
                }
            }
        }
        order
    }

    /// Direct children of a group matching the predicate.
    pub fn find_children(
        &self,
        id: ItemId,
        predicate: impl Fn(&Item) -> bool,
    ) -> Result<Vec<ItemId>, TreeError> {
        Ok(self
            .children_of(id)?
            .iter()
            .filter(|c| self.items.get(c).is_some_and(&predicate))
            .copied()
            .collect())
    }

    /// All descendants of a group matching the predicate, pre-order.
    /// The group itself is not included.
    pub fn descendant_items(
        &self,
        id: ItemId,
        predicate: impl Fn(&Item) -> bool,
    ) -> Vec<ItemId> {
        self.subtree_preorder(id)
            .into_iter()
            .skip(1)
            .filter(|c| self.items.get(c).is_some_and(&predicate))
            .collect()
    }

    /// Matching siblings at every ancestor level, climbing to the root:
    /// the item's own siblings first, then its parent's siblings, and
    /// so on. The complement of [`RootManager::descendant_items`] —
    /// this search recurses *up*.
    pub fn ancestor_and_sibling_items(
        &self,
        id: ItemId,
        predicate: impl Fn(&Item) -> bool,
    ) -> Vec<ItemId> {
        let mut found = Vec::new();
        let mut cursor = self.items.get(&id).and_then(Item::parent);
        let mut below = id;
        while let Some(gid) = cursor {
            if let Some(group) = self.items.get(&gid).and_then(Item::as_group) {
                for child in group.children() {
                    if *child == below {
                        continue;
                    }
                    if self.items.get(child).is_some_and(&predicate) {
                        found.push(*child);
                    }
                }
            }
            below = gid;
            cursor = self.items.get(&gid).and_then(Item::parent);
        }
        found
    }

    /// Direct lookup by id, restricted to items reachable from the
    /// root. Detached items (and stale ids) miss.
    pub fn find_descendant_by_id(&self, id: ItemId) -> Option<&Item> {
        self.items.get(&id).filter(|i| i.is_attached())
    }

    /// All attached layers, in tree order.
    pub fn attached_layers(&self) -> Vec<ItemId> {
        self.subtree_preorder(self.root)
            .into_iter()
            .filter(|id| {
                self.items
                    .get(id)
                    .is_some_and(|i| i.is_attached() && i.as_layer().is_some())
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Item creation (detached until inserted into a group)
    // -------------------------------------------------------------------------

    pub fn new_group(&mut self, kind: GroupKind, name: &str) -> ItemId {
        self.insert_item(ItemIdentity::new(name), ItemKind::Group(GroupData::new(kind)))
    }

    pub fn new_layer(&mut self, name: &str, definition: LayerDefinition) -> ItemId {
        let (class, context, provider) = definition.into_parts();
        self.insert_item(
            ItemIdentity::new(name),
            ItemKind::Layer(LayerData {
                class,
                context,
                provider,
                orchestrator: Default::default(),
            }),
        )
    }

    pub fn new_shared_setting(&mut self, name: &str, class: &str, key: SettingKey) -> ItemId {
        self.insert_item(
            ItemIdentity::new(name),
            ItemKind::SharedSetting(SharedSettingData::new(class, Setting::new(key))),
        )
    }

    pub fn new_color_scale(&mut self, name: &str, scale: serde_json::Value) -> ItemId {
        self.insert_item(
            ItemIdentity::new(name),
            ItemKind::ColorScale(ColorScaleData { scale }),
        )
    }

    pub(crate) fn insert_item(&mut self, identity: ItemIdentity, kind: ItemKind) -> ItemId {
        let id = ItemId(self.next_item_id);
        self.next_item_id += 1;
        self.items.insert(id, Item::new(id, identity, kind));
        id
    }

    // -------------------------------------------------------------------------
    // Tree structure
    // -------------------------------------------------------------------------

    pub fn append_child(&mut self, parent: ItemId, child: ItemId) -> Result<(), TreeError> {
        let len = self.children_of(parent)?.len();
        self.insert_child(parent, len, child)
    }

    pub fn prepend_child(&mut self, parent: ItemId, child: ItemId) -> Result<(), TreeError> {
        self.insert_child(parent, 0, child)
    }

    /// Insert a detached item into a group at `index`. If the parent is
    /// attached the whole inserted subtree attaches: layer contexts are
    /// evaluated and valid layers start their first fetch.
    pub fn insert_child(
        &mut self,
        parent: ItemId,
        index: usize,
        child: ItemId,
    ) -> Result<(), TreeError> {
        {
            let child_item = self.items.get(&child).ok_or(TreeError::UnknownItem(child))?;
            if child_item.parent.is_some() || child_item.attached {
                return Err(TreeError::AlreadyAttached(child));
            }
        }
        let parent_attached = {
            let parent_item = self
                .items
                .get_mut(&parent)
                .ok_or(TreeError::UnknownItem(parent))?;
            let attached = parent_item.attached;
            let group = parent_item.as_group_mut().ok_or(TreeError::NotAGroup(parent))?;
            if index > group.children.len() {
                return Err(TreeError::IndexOutOfBounds {
                    index,
                    len: group.children.len(),
                });
            }
            group.children.insert(index, child);
            attached
        };
        if let Some(child_item) = self.items.get_mut(&child) {
            child_item.parent = Some(parent);
        }

        self.pending
            .push_back(TreeEvent::ChildrenChanged { group: parent });
        self.pending.push_back(TreeEvent::ItemsChanged);

        if parent_attached {
            self.attach_subtree(child);
        }
        self.settle_and_flush();
        Ok(())
    }

    /// Remove an item and its whole subtree. In-flight fetches and
    /// helper lookups of removed layers are cancelled; overrides this
    /// subtree's shared settings applied elsewhere are withdrawn by the
    /// settle pass.
    pub fn remove_item(&mut self, id: ItemId) -> Result<(), TreeError> {
        if id == self.root {
            return Err(TreeError::NotAGroup(id));
        }
        let parent = {
            let item = self.items.get(&id).ok_or(TreeError::UnknownItem(id))?;
            item.parent
        };

        let subtree = self.subtree_preorder(id);
        // Overrides pushed by shared settings inside the subtree must
        // be withdrawn by hand: after removal no settle pass will ever
        // see those shared settings again.
        let mut withdrawals: Vec<(SettingKey, Vec<ItemId>)> = Vec::new();
        for sid in &subtree {
            if let Some(shared) = self.items.get_mut(sid).and_then(Item::as_shared_setting_mut) {
                withdrawals.push((
                    shared.setting.key(),
                    std::mem::take(&mut shared.applied_to),
                ));
            }
            self.teardown_item(*sid);
        }

        if let Some(parent) = parent {
            if let Some(group) = self.items.get_mut(&parent).and_then(Item::as_group_mut) {
                group.children.retain(|c| *c != id);
            }
            self.pending
                .push_back(TreeEvent::ChildrenChanged { group: parent });
        }
        self.pending.push_back(TreeEvent::ItemsChanged);

        for sid in subtree {
            self.items.remove(&sid);
        }
        for (key, layers) in withdrawals {
            for lid in layers {
                if self.items.contains_key(&lid) {
                    self.apply_override(lid, key, None);
                }
            }
        }

        self.recompute_subordination();
        self.settle_and_flush();
        Ok(())
    }

    /// Reposition an attached item under a new (attached) parent group.
    pub fn move_child(
        &mut self,
        id: ItemId,
        new_parent: ItemId,
        index: usize,
    ) -> Result<(), TreeError> {
        let old_parent = {
            let item = self.items.get(&id).ok_or(TreeError::UnknownItem(id))?;
            if !item.attached {
                return Err(TreeError::DetachedItem(id));
            }
            item.parent.ok_or(TreeError::DetachedItem(id))?
        };
        {
            let parent_item = self
                .items
                .get(&new_parent)
                .ok_or(TreeError::UnknownItem(new_parent))?;
            if !parent_item.attached {
                return Err(TreeError::DetachedItem(new_parent));
            }
            parent_item.as_group().ok_or(TreeError::NotAGroup(new_parent))?;
        }
        // Reject moving an item under its own subtree.
        let mut cursor = Some(new_parent);
        while let Some(ancestor) = cursor {
            if ancestor == id {
                return Err(TreeError::WouldCycle(id));
            }
            cursor = self.items.get(&ancestor).and_then(Item::parent);
        }

        if let Some(group) = self.items.get_mut(&old_parent).and_then(Item::as_group_mut) {
            group.children.retain(|c| *c != id);
        }
        {
            let group = self
                .items
                .get_mut(&new_parent)
                .and_then(Item::as_group_mut)
                .ok_or(TreeError::NotAGroup(new_parent))?;
            let index = index.min(group.children.len());
            group.children.insert(index, id);
        }
        if let Some(item) = self.items.get_mut(&id) {
            item.parent = Some(new_parent);
        }

        self.pending
            .push_back(TreeEvent::ChildrenChanged { group: old_parent });
        if new_parent != old_parent {
            // A same-parent move is a pure reorder; only reparenting is
            // a structural change worth the broad topic.
            self.pending
                .push_back(TreeEvent::ChildrenChanged { group: new_parent });
            self.pending.push_back(TreeEvent::ItemsChanged);
        }

        self.recompute_subordination();
        self.settle_and_flush();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    pub fn set_name(&mut self, id: ItemId, name: &str) -> Result<(), TreeError> {
        let item = self.items.get_mut(&id).ok_or(TreeError::UnknownItem(id))?;
        if item.identity.name == name {
            return Ok(());
        }
        item.identity.name = name.to_string();
        self.pending.push_back(TreeEvent::ItemsChanged);
        self.bump_revision();
        self.flush_events();
        Ok(())
    }

    /// Toggle visibility. Bumps the data revision: consumers rebuild
    /// their view of "what is displayed" from it.
    pub fn set_visible(&mut self, id: ItemId, visible: bool) -> Result<(), TreeError> {
        let item = self.items.get_mut(&id).ok_or(TreeError::UnknownItem(id))?;
        if item.identity.visible == visible {
            return Ok(());
        }
        item.identity.visible = visible;
        self.pending.push_back(TreeEvent::ItemsChanged);
        self.bump_revision();
        self.flush_events();
        Ok(())
    }

    pub fn set_color(&mut self, id: ItemId, color: Option<String>) -> Result<(), TreeError> {
        let item = self.items.get_mut(&id).ok_or(TreeError::UnknownItem(id))?;
        if item.identity.color == color {
            return Ok(());
        }
        item.identity.color = color;
        self.pending.push_back(TreeEvent::ItemsChanged);
        self.flush_events();
        Ok(())
    }

    pub fn set_expanded(&mut self, id: ItemId, expanded: bool) -> Result<(), TreeError> {
        let item = self.items.get_mut(&id).ok_or(TreeError::UnknownItem(id))?;
        if item.identity.expanded == expanded {
            return Ok(());
        }
        item.identity.expanded = expanded;
        self.pending.push_back(TreeEvent::ItemsChanged);
        self.flush_events();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Settings
    // -------------------------------------------------------------------------

    /// Write a layer setting's value. A deep-equal write is a no-op and
    /// produces zero notifications.
    pub fn set_setting_value(
        &mut self,
        layer_id: ItemId,
        key: SettingKey,
        value: SettingValue,
    ) -> Result<(), TreeError> {
        {
            let Self {
                items,
                global_settings,
                pending,
                config,
                ..
            } = self;
            let item = items.get_mut(&layer_id).ok_or(TreeError::UnknownItem(layer_id))?;
            if !item.attached {
                return Err(TreeError::DetachedItem(layer_id));
            }
            let layer = item.as_layer_mut().ok_or(TreeError::NotALayer(layer_id))?;
            {
                let setting = layer
                    .context
                    .setting_mut(key)
                    .ok_or_else(|| TreeError::UnknownSettingKey(key.as_str().to_string()))?;
                if !setting.set_value(value) {
                    return Ok(());
                }
            }
            pending.push_back(TreeEvent::SettingValueChanged {
                item: layer_id,
                key,
            });
            let deltas = layer.context.react(
                layer_id,
                vec![DepNode::LocalValue(key)],
                global_settings,
                config.settle_budget,
            );
            Self::queue_setting_deltas(pending, layer_id, deltas);
        }
        self.settle_and_flush();
        Ok(())
    }

    /// Write a shared setting's value. The settle pass pushes it down
    /// as an override to every participating layer.
    pub fn set_shared_setting_value(
        &mut self,
        shared_id: ItemId,
        value: SettingValue,
    ) -> Result<(), TreeError> {
        {
            let item = self
                .items
                .get_mut(&shared_id)
                .ok_or(TreeError::UnknownItem(shared_id))?;
            if !item.attached {
                return Err(TreeError::DetachedItem(shared_id));
            }
            let shared = item
                .as_shared_setting_mut()
                .ok_or(TreeError::NotALayer(shared_id))?;
            let key = shared.setting.key();
            if !shared.setting.set_value(value) {
                return Ok(());
            }
            self.pending.push_back(TreeEvent::SettingValueChanged {
                item: shared_id,
                key,
            });
        }
        self.settle_and_flush();
        Ok(())
    }

    /// Write a global setting. Equality-gated; a real change re-runs
    /// every layer derivation that read the key.
    pub fn update_global_setting(&mut self, key: &str, value: SettingValue) {
        if self.global_settings.get(key) == Some(&value) {
            return;
        }
        self.global_settings.insert(key.to_string(), value);
        self.pending.push_back(TreeEvent::GlobalSettingsChanged {
            key: key.to_string(),
        });

        let layers = self.attached_layers();
        {
            let Self {
                items,
                global_settings,
                pending,
                config,
                ..
            } = self;
            for id in layers {
                let Some(layer) = items.get_mut(&id).and_then(Item::as_layer_mut) else {
                    continue;
                };
                let deltas = layer.context.react(
                    id,
                    vec![DepNode::Global(key.to_string())],
                    global_settings,
                    config.settle_budget,
                );
                Self::queue_setting_deltas(pending, id, deltas);
            }
        }
        self.settle_and_flush();
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    pub fn subscribe(
        &mut self,
        topic: Topic,
        callback: impl FnMut(&TreeEvent) + 'static,
    ) -> SubscriberId {
        self.store.subscribe(topic, callback)
    }

    pub fn subscribe_all(&mut self, callback: impl FnMut(&TreeEvent) + 'static) -> SubscriberId {
        self.store.subscribe_all(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.store.unsubscribe(id)
    }

    /// Current value for a topic. `None` when the topic references an
    /// unknown item or a kind without that facet.
    pub fn snapshot(&self, topic: &Topic) -> Option<TopicSnapshot> {
        match topic {
            Topic::Children(id) => self
                .item(*id)?
                .as_group()
                .map(|g| TopicSnapshot::Children(g.children().to_vec())),
            Topic::ItemsChanged => Some(TopicSnapshot::Items(self.subtree_preorder(self.root))),
            Topic::SettingValue(id, key) => {
                let item = self.item(*id)?;
                if let Some(layer) = item.as_layer() {
                    layer
                        .context
                        .setting(*key)
                        .map(|s| TopicSnapshot::Value(s.effective_value().clone()))
                } else if let Some(shared) = item.as_shared_setting() {
                    (shared.setting.key() == *key)
                        .then(|| TopicSnapshot::Value(shared.setting.value().clone()))
                } else {
                    None
                }
            }
            Topic::SettingOverride(id, key) => self
                .item(*id)?
                .as_layer()?
                .context
                .setting(*key)
                .map(|s| TopicSnapshot::Override(s.overridden_value().cloned())),
            Topic::AvailableValues(id, key) => {
                let item = self.item(*id)?;
                if let Some(layer) = item.as_layer() {
                    layer
                        .context
                        .setting(*key)
                        .map(|s| TopicSnapshot::AvailableValues(s.available_values().to_vec()))
                } else if let Some(shared) = item.as_shared_setting() {
                    (shared.setting.key() == *key).then(|| {
                        TopicSnapshot::AvailableValues(shared.setting.available_values().to_vec())
                    })
                } else {
                    None
                }
            }
            Topic::SettingsChanged(id) => self
                .item(*id)?
                .as_layer()
                .map(|l| TopicSnapshot::Settings(l.context.resolved_values())),
            Topic::GlobalSettings => {
                let mut globals: Vec<(String, SettingValue)> = self
                    .global_settings
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                globals.sort_by(|a, b| a.0.cmp(&b.0));
                Some(TopicSnapshot::Globals(globals))
            }
            Topic::LayerStatus(id) => self
                .item(*id)?
                .as_layer()
                .map(|l| TopicSnapshot::Status(l.orchestrator.status())),
            Topic::LayerData(id) => self
                .item(*id)?
                .as_layer()
                .map(|l| TopicSnapshot::Data(l.orchestrator.payload().cloned())),
            Topic::Subordination(id) => self
                .item(*id)?
                .as_layer()
                .map(|l| TopicSnapshot::Subordinated(l.orchestrator.is_subordinated())),
            Topic::Revision => Some(TopicSnapshot::Revision(self.data_revision)),
        }
    }

    // -------------------------------------------------------------------------
    // Completion injection
    // -------------------------------------------------------------------------

    /// Hand back the result of a pending fetch. Stale tickets (the
    /// attempt was superseded) are discarded.
    pub fn complete_fetch(&mut self, ticket: FetchTicket, result: Result<Payload, FetchError>) {
        self.apply_fetch_result(ticket.layer, ticket.generation, result);
        self.flush_events();
    }

    /// Hand back the result of a pending helper lookup. Stale tickets
    /// are discarded.
    pub fn resolve_helper(&mut self, ticket: crate::context::HelperTicket, value: SettingValue) {
        {
            let Self {
                items,
                global_settings,
                pending,
                config,
                ..
            } = self;
            let Some(layer) = items.get_mut(&ticket.layer).and_then(Item::as_layer_mut) else {
                log::debug!("helper resolution for unknown layer {}", ticket.layer);
                return;
            };
            if let Some(deltas) = layer.context.resolve_helper(
                ticket.layer,
                ticket.helper,
                ticket.generation,
                value,
                global_settings,
                config.settle_budget,
            ) {
                Self::queue_setting_deltas(pending, ticket.layer, deltas);
            } else {
                return;
            }
        }
        self.settle_and_flush();
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    pub(crate) fn queue_setting_deltas(
        pending: &mut VecDeque<TreeEvent>,
        item: ItemId,
        deltas: Vec<SettingDelta>,
    ) {
        for delta in deltas {
            match delta {
                SettingDelta::ValueChanged(key) => {
                    pending.push_back(TreeEvent::SettingValueChanged { item, key });
                }
                SettingDelta::AvailableChanged(key) => {
                    pending.push_back(TreeEvent::AvailableValuesChanged { item, key });
                }
            }
        }
    }

    fn bump_revision(&mut self) {
        let previous = self.data_revision;
        self.data_revision += 1;
        self.pending.push_back(TreeEvent::RevisionChanged {
            revision: self.data_revision,
            previous,
        });
    }

    fn flush_events(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(event) = self.pending.pop_front() {
            self.store.notify(&event);
            flushed += 1;
        }
        flushed
    }

    /// Mark a freshly inserted subtree attached, evaluate layer
    /// contexts, and start first fetches for valid layers.
    fn attach_subtree(&mut self, id: ItemId) {
        let order = self.subtree_preorder(id);
        for sid in &order {
            if let Some(item) = self.items.get_mut(sid) {
                item.attached = true;
            }
        }

        {
            let Self {
                items,
                global_settings,
                pending,
                config,
                ..
            } = self;
            for sid in &order {
                let Some(layer) = items.get_mut(sid).and_then(Item::as_layer_mut) else {
                    continue;
                };
                let deltas =
                    layer
                        .context
                        .evaluate_all(*sid, global_settings, config.settle_budget);
                Self::queue_setting_deltas(pending, *sid, deltas);
                let resolved = layer.context.resolved_values();
                layer.context.set_cached_values(resolved);
            }
        }

        self.recompute_subordination();
        for sid in order {
            if self
                .items
                .get(&sid)
                .is_some_and(|i| i.as_layer().is_some())
            {
                self.trigger_fetch(sid);
            }
        }
    }

    /// Cancel everything an item owns before it leaves the tree.
    fn teardown_item(&mut self, id: ItemId) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        item.attached = false;
        if let Some(layer) = item.as_layer_mut() {
            layer.context.abort_all_helpers();
            let keys = layer.orchestrator.supersede();
            for key in &keys {
                self.cache.cancel(key);
            }
            for key in &keys {
                self.cache.invalidate(key);
            }
            for key in &keys {
                self.cache.evict(key);
            }
        }
    }

    /// A layer directly under a delta-surface group is subordinated: it
    /// resolves settings but never fetches for itself. Becoming
    /// subordinated cancels any in-flight fetch; being released starts
    /// one.
    pub(crate) fn recompute_subordination(&mut self) {
        let order = self.subtree_preorder(self.root);
        let mut desired: Vec<(ItemId, bool)> = Vec::new();
        for id in &order {
            let Some(item) = self.items.get(id) else {
                continue;
            };
            if item.as_layer().is_none() {
                continue;
            }
            let under_delta = item
                .parent
                .and_then(|p| self.items.get(&p))
                .and_then(Item::as_group)
                .is_some_and(|g| g.kind == GroupKind::DeltaSurface);
            desired.push((*id, under_delta));
        }

        let mut released = Vec::new();
        for (id, subordinated) in desired {
            let Some(layer) = self.items.get_mut(&id).and_then(Item::as_layer_mut) else {
                continue;
            };
            if !layer.orchestrator.set_subordinated(subordinated) {
                continue;
            }
            self.pending.push_back(TreeEvent::SubordinationChanged {
                layer: id,
                subordinated,
            });
            if subordinated {
                let keys = layer.orchestrator.supersede();
                for key in &keys {
                    self.cache.cancel(key);
                }
            } else {
                released.push(id);
            }
        }
        for id in released {
            self.trigger_fetch(id);
        }
    }

    /// Settle everything a mutation perturbed, then flush in two
    /// stages: setting events first, fetch-side events after.
    pub(crate) fn settle_and_flush(&mut self) {
        let mut report = SettleReport::default();
        loop {
            report.shared_passes += 1;
            if !self.recompute_shared_settings() {
                break;
            }
            if report.shared_passes >= self.config.settle_budget {
                log::warn!(
                    "shared settings did not settle within {} passes",
                    self.config.settle_budget
                );
                break;
            }
        }
        report.events += self.flush_events();
        report.refetches = self.detect_refetches();
        report.events += self.flush_events();
        log::debug!("{}", report.log_line());
    }

    /// Compare each layer's resolved settings against the tuple that
    /// drove its last fetch; queue `SettingsChanged` and refetch where
    /// the provider says the transition warrants it.
    fn detect_refetches(&mut self) -> usize {
        let mut refetch = Vec::new();
        let layers = self.attached_layers();
        for id in layers {
            let Some(layer) = self.items.get_mut(&id).and_then(Item::as_layer_mut) else {
                continue;
            };
            let resolved = layer.context.resolved_values();
            if &resolved == layer.context.cached_values() {
                continue;
            }
            let wants = layer
                .provider
                .settings_require_refetch(layer.context.cached_values(), &resolved);
            layer.context.set_cached_values(resolved);
            self.pending.push_back(TreeEvent::SettingsChanged { layer: id });
            if wants {
                refetch.push(id);
            }
        }
        let count = refetch.len();
        for id in refetch {
            self.trigger_fetch(id);
        }
        count
    }

    /// Start one fetch for a layer: cancel the previous attempt's
    /// queries, gate on settings validity and subordination, invoke the
    /// provider.
    pub(crate) fn trigger_fetch(&mut self, id: ItemId) {
        let pending_outcome = {
            let Self {
                items,
                global_settings,
                pending,
                cache,
                ..
            } = self;
            let Some(layer) = items.get_mut(&id).and_then(Item::as_layer_mut) else {
                return;
            };

            // Cancel before refetch: the previous attempt's queries are
            // cancelled, invalidated, and evicted, in that order, then
            // the generation advances so its completion is stale.
            let keys = layer.orchestrator.supersede();
            for key in &keys {
                cache.cancel(key);
            }
            for key in &keys {
                cache.invalidate(key);
            }
            for key in &keys {
                cache.evict(key);
            }

            if layer.orchestrator.is_subordinated() {
                return;
            }
            let resolved = layer.context.resolved_values();
            if !layer.context.all_settings_valid()
                || !layer.provider.are_settings_valid(&resolved)
            {
                log::debug!("layer {id} settings not valid, fetch skipped");
                return;
            }

            let (signal, handle) = abort_pair();
            if layer.orchestrator.begin_loading(handle) {
                pending.push_back(TreeEvent::LayerStatusChanged {
                    layer: id,
                    status: LayerStatus::Loading,
                });
            }
            let generation = layer.orchestrator.generation();
            let mut ctx = FetchCtx::new(id, generation, &resolved, global_settings, signal);
            let outcome = layer.provider.fetch(&mut ctx);
            layer.orchestrator.set_registered_keys(ctx.into_registered_keys());
            match outcome {
                FetchOutcome::Ready(result) => Some((generation, result)),
                FetchOutcome::Pending => None,
            }
        };
        if let Some((generation, result)) = pending_outcome {
            self.apply_fetch_result(id, generation, result);
        }
    }

    fn apply_fetch_result(
        &mut self,
        id: ItemId,
        generation: u64,
        result: Result<Payload, FetchError>,
    ) {
        let succeeded = {
            let Self { items, pending, .. } = self;
            let Some(item) = items.get_mut(&id) else {
                log::debug!("fetch completion for unknown layer {id}");
                return;
            };
            let name = item.name().to_string();
            let Some(layer) = item.as_layer_mut() else {
                log::debug!("fetch completion for unknown layer {id}");
                return;
            };
            if !layer.orchestrator.accepts(generation) {
                log::debug!("discarding stale fetch completion for layer {id} (gen {generation})");
                return;
            }
            match result {
                Ok(payload) => {
                    let bbox = layer.provider.make_bounding_box(&payload);
                    let range = layer.provider.make_value_range(&payload);
                    let was = layer.orchestrator.status();
                    layer.orchestrator.succeed(payload, bbox, range);
                    if was != LayerStatus::Success {
                        pending.push_back(TreeEvent::LayerStatusChanged {
                            layer: id,
                            status: LayerStatus::Success,
                        });
                    }
                    pending.push_back(TreeEvent::LayerDataChanged { layer: id });
                    true
                }
                Err(FetchError::Cancelled) => {
                    // Swallowed: a replacement fetch owns the status now.
                    false
                }
                Err(FetchError::Message(message)) => {
                    log::warn!("layer {id} fetch failed: {message}");
                    let was = layer.orchestrator.status();
                    // Stored prefixed with the display name so a status
                    // panel can show it without a second lookup.
                    layer.orchestrator.fail(format!("{name}: {message}"));
                    if was != LayerStatus::Error {
                        pending.push_back(TreeEvent::LayerStatusChanged {
                            layer: id,
                            status: LayerStatus::Error,
                        });
                    }
                    false
                }
            }
        };
        if succeeded {
            self.bump_revision();
        }
    }
}
