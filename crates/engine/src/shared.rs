//! Shared settings: one setting item whose available values are the
//! intersection of the same-keyed setting across every layer its parent
//! group can see, and whose value is pushed into those layers as an
//! override.
//!
//! Each settle pass walks the attached shared settings shallowest
//! first, siblings in child order:
//!
//! 1. participants — the parent group's descendant layers carrying the
//!    key, plus same-key shared settings among the item's siblings at
//!    every ancestor level (the subtree the parent sees, plus
//!    everything above it);
//! 2. available set — value-equality intersection across participants,
//!    ordered by the first one; a peer shared setting whose own set is
//!    still empty has not computed yet and is skipped;
//! 3. value — fixed up to the first intersection element when the
//!    current value fell out;
//! 4. overrides — each valid shared value is pushed to its descendant
//!    layers. When two shared settings cover the same layer, the
//!    shallower one wins (the first sibling, for a same-level tie).
//!    Layers no longer covered by any valid shared value get their
//!    override withdrawn and fall back to their own local value.
//!
//! The pass reports whether it changed anything so the caller can
//! re-run it until stable (bounded by the settle budget).

use rustc_hash::FxHashMap;
use strata_protocol::SettingValue;

use crate::dep_graph::DepNode;
use crate::events::TreeEvent;
use crate::item::{Item, ItemId};
use crate::manager::RootManager;
use crate::setting::SettingKey;

/// Outcome of refreshing one shared setting's own state.
struct SharedRefresh {
    id: ItemId,
    key: SettingKey,
    layers: Vec<ItemId>,
    desired: Option<SettingValue>,
    prev_applied: Vec<ItemId>,
    changed: bool,
}

impl RootManager {
    /// One shared-setting pass over the whole tree. Returns true when
    /// any setting, available set, or override changed.
    pub(crate) fn recompute_shared_settings(&mut self) -> bool {
        let mut shared_ids: Vec<ItemId> = self
            .subtree_preorder(self.root)
            .into_iter()
            .filter(|id| {
                self.items
                    .get(id)
                    .is_some_and(|i| i.is_attached() && i.as_shared_setting().is_some())
            })
            .collect();
        // Shallowest first, tree order breaking ties. Stable sort, so
        // siblings keep their child order.
        shared_ids.sort_by_key(|id| self.depth_of(*id));

        let mut changed = false;
        let mut refreshed: Vec<SharedRefresh> = Vec::new();
        // (layer, key) -> owning shared setting and its value. First
        // claim wins, so an outer shared setting beats a nested one on
        // layers they both cover, and the first sibling beats a later
        // same-key one.
        let mut claims: FxHashMap<(ItemId, SettingKey), (ItemId, SettingValue)> =
            FxHashMap::default();

        // Sequential: a later shared setting's intersection sees the
        // refreshed sets of earlier ones.
        for sid in shared_ids {
            let Some(refresh) = self.refresh_shared(sid) else {
                continue;
            };
            changed |= refresh.changed;
            if let Some(value) = &refresh.desired {
                for lid in &refresh.layers {
                    claims
                        .entry((*lid, refresh.key))
                        .or_insert((refresh.id, value.clone()));
                }
            }
            refreshed.push(refresh);
        }

        for refresh in refreshed {
            let mut applied = Vec::new();
            for lid in &refresh.layers {
                let won = claims
                    .get(&(*lid, refresh.key))
                    .is_some_and(|(owner, _)| *owner == refresh.id);
                if !won {
                    continue;
                }
                if let Some((_, value)) = claims.get(&(*lid, refresh.key)) {
                    let value = value.clone();
                    if self.apply_override(*lid, refresh.key, Some(value)) {
                        changed = true;
                    }
                    applied.push(*lid);
                }
            }
            for lid in refresh.prev_applied {
                if !claims.contains_key(&(lid, refresh.key))
                    && self.apply_override(lid, refresh.key, None)
                {
                    changed = true;
                }
            }
            if let Some(shared) = self
                .items
                .get_mut(&refresh.id)
                .and_then(Item::as_shared_setting_mut)
            {
                shared.applied_to = applied;
            }
        }
        changed
    }

    fn depth_of(&self, id: ItemId) -> usize {
        let mut depth = 0;
        let mut cursor = self.items.get(&id).and_then(Item::parent);
        while let Some(pid) = cursor {
            depth += 1;
            cursor = self.items.get(&pid).and_then(Item::parent);
        }
        depth
    }

    /// Recompute one shared setting's available set and value from its
    /// participants. Override application happens afterwards, once all
    /// claims are known.
    fn refresh_shared(&mut self, sid: ItemId) -> Option<SharedRefresh> {
        let (key, parent) = {
            let item = self.items.get(&sid)?;
            let shared = item.as_shared_setting()?;
            (shared.setting.key(), item.parent()?)
        };

        let layers = self.descendant_items(parent, |i| {
            i.is_attached()
                && i.as_layer()
                    .is_some_and(|l| l.context.setting(key).is_some())
        });
        let peers = self.ancestor_and_sibling_items(sid, |i| {
            i.is_attached()
                && i.as_shared_setting()
                    .is_some_and(|s| s.setting.key() == key)
        });

        // Intersection by value equality, ordered by the first
        // contributor. No contributors means an empty set, which makes
        // the shared value invalid and withdraws every override below.
        let mut intersection: Option<Vec<SettingValue>> = None;
        for lid in &layers {
            let Some(layer) = self.items.get(lid).and_then(Item::as_layer) else {
                continue;
            };
            let Some(setting) = layer.context.setting(key) else {
                continue;
            };
            intersect_into(&mut intersection, setting.available_values());
        }
        for pid in &peers {
            let Some(peer) = self.items.get(pid).and_then(Item::as_shared_setting) else {
                continue;
            };
            // An empty peer set means "not computed yet", not "nothing
            // is legal"; skipping it lets sibling sets converge.
            if peer.setting.available_values().is_empty() {
                continue;
            }
            intersect_into(&mut intersection, peer.setting.available_values());
        }
        let intersection = intersection.unwrap_or_default();

        let mut changed = false;
        let Self { items, pending, .. } = self;
        let shared = items.get_mut(&sid).and_then(Item::as_shared_setting_mut)?;
        if shared.setting.set_available(intersection.clone()) {
            pending.push_back(TreeEvent::AvailableValuesChanged { item: sid, key });
            changed = true;
        }
        if !intersection.contains(shared.setting.value()) {
            let replacement = intersection
                .first()
                .cloned()
                .unwrap_or(SettingValue::Null);
            if shared.setting.set_value(replacement) {
                pending.push_back(TreeEvent::SettingValueChanged { item: sid, key });
                changed = true;
            }
        }
        let value = shared.setting.value().clone();
        let desired = (!value.is_null() && intersection.contains(&value)).then_some(value);
        let prev_applied = std::mem::take(&mut shared.applied_to);

        Some(SharedRefresh {
            id: sid,
            key,
            layers,
            desired,
            prev_applied,
            changed,
        })
    }

    /// Install or withdraw one layer's override and re-run its local
    /// derivations when the effective value moved. Returns true when
    /// anything changed.
    pub(crate) fn apply_override(
        &mut self,
        layer_id: ItemId,
        key: SettingKey,
        value: Option<SettingValue>,
    ) -> bool {
        let Self {
            items,
            global_settings,
            pending,
            config,
            ..
        } = self;
        let Some(layer) = items.get_mut(&layer_id).and_then(Item::as_layer_mut) else {
            return false;
        };
        let effective_changed = {
            let Some(setting) = layer.context.setting_mut(key) else {
                return false;
            };
            if setting.overridden_value() == value.as_ref() {
                return false;
            }
            let before = setting.effective_value().clone();
            setting.set_overridden(value);
            let effective_changed = setting.effective_value() != &before;
            pending.push_back(TreeEvent::SettingOverrideChanged {
                item: layer_id,
                key,
            });
            if effective_changed {
                pending.push_back(TreeEvent::SettingValueChanged {
                    item: layer_id,
                    key,
                });
            }
            effective_changed
        };
        if effective_changed {
            let deltas = layer.context.react(
                layer_id,
                vec![DepNode::LocalValue(key)],
                global_settings,
                config.settle_budget,
            );
            Self::queue_setting_deltas(pending, layer_id, deltas);
        }
        true
    }
}

fn intersect_into(accumulator: &mut Option<Vec<SettingValue>>, available: &[SettingValue]) {
    *accumulator = Some(match accumulator.take() {
        None => available.to_vec(),
        Some(current) => current
            .into_iter()
            .filter(|v| available.contains(v))
            .collect(),
    });
}
