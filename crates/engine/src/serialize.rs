//! Document save/load against the frozen v1 format in
//! `strata-protocol`.
//!
//! Saving walks the tree and records each setting's *plain* value
//! (overrides are derived state and are reconstructed by the settle
//! pass after load). Loading materializes the whole document into
//! detached items first and only then swaps it in, so a malformed
//! document leaves the current tree untouched. Restored ids are kept
//! verbatim; the id counter resumes past the highest one seen.

use std::collections::BTreeMap;

use strata_protocol::{
    PersistedDocument, SerializedColorScale, SerializedGroup, SerializedItem, SerializedLayer,
    SerializedSharedSetting,
};

use crate::error::TreeError;
use crate::item::{
    ColorScaleData, GroupData, GroupKind, Item, ItemId, ItemIdentity, ItemKind, LayerData,
    SharedSettingData,
};
use crate::manager::RootManager;
use crate::registry::{LayerRegistry, SettingRegistry};
use crate::setting::{Setting, SettingKey};

impl RootManager {
    /// Serialize the current tree (children of the root, recursively).
    pub fn to_document(&self) -> PersistedDocument {
        let items = self
            .children_of(self.root)
            .map(|children| {
                children
                    .iter()
                    .filter_map(|id| self.serialize_item(*id))
                    .collect()
            })
            .unwrap_or_default();
        PersistedDocument::new(items)
    }

    /// Replace the current tree with a document's contents.
    ///
    /// Layer and shared-setting classes are looked up in the given
    /// registries; an unknown class aborts the load with the tree
    /// unchanged. Restored layer settings are flagged persisted until a
    /// loaded available set confirms them.
    pub fn load_document(
        &mut self,
        document: &PersistedDocument,
        layers: &LayerRegistry,
        settings: &SettingRegistry,
    ) -> Result<(), TreeError> {
        let mut created: Vec<ItemId> = Vec::new();
        let mut top_level: Vec<ItemId> = Vec::new();
        for serialized in &document.items {
            match self.materialize(serialized, layers, settings, &mut created) {
                Ok(id) => top_level.push(id),
                Err(err) => {
                    for id in created {
                        self.items.remove(&id);
                    }
                    return Err(err);
                }
            }
        }

        let old_children: Vec<ItemId> = self
            .children_of(self.root)
            .map(<[ItemId]>::to_vec)
            .unwrap_or_default();
        for child in old_children {
            self.remove_item(child)?;
        }
        for id in top_level {
            self.append_child(self.root, id)?;
        }
        Ok(())
    }

    fn serialize_item(&self, id: ItemId) -> Option<SerializedItem> {
        let item = self.items.get(&id)?;
        let serialized = match item.kind() {
            ItemKind::Group(group) => {
                let serialized = SerializedGroup {
                    id: id.0,
                    name: item.name().to_string(),
                    visible: item.is_visible(),
                    expanded: item.is_expanded(),
                    color: item.color().map(str::to_string),
                    children: group
                        .children()
                        .iter()
                        .filter_map(|c| self.serialize_item(*c))
                        .collect(),
                };
                match group.kind {
                    GroupKind::View => SerializedItem::View(serialized),
                    GroupKind::SettingsGroup => SerializedItem::SettingsGroup(serialized),
                    GroupKind::DeltaSurface => SerializedItem::DeltaSurface(serialized),
                }
            }
            ItemKind::Layer(layer) => {
                let mut values: BTreeMap<String, _> = BTreeMap::new();
                for setting in layer.context.settings() {
                    if setting.value().is_null() {
                        continue;
                    }
                    values.insert(setting.key().as_str().to_string(), setting.value().clone());
                }
                SerializedItem::Layer(SerializedLayer {
                    id: id.0,
                    name: item.name().to_string(),
                    visible: item.is_visible(),
                    expanded: item.is_expanded(),
                    class: layer.class.clone(),
                    settings: values,
                })
            }
            ItemKind::SharedSetting(shared) => {
                SerializedItem::SharedSetting(SerializedSharedSetting {
                    id: id.0,
                    name: item.name().to_string(),
                    visible: item.is_visible(),
                    expanded: item.is_expanded(),
                    class: shared.class.clone(),
                    value: shared.setting.value().clone(),
                })
            }
            ItemKind::ColorScale(scale) => SerializedItem::ColorScale(SerializedColorScale {
                id: id.0,
                name: item.name().to_string(),
                visible: item.is_visible(),
                expanded: item.is_expanded(),
                scale: scale.scale.clone(),
            }),
        };
        Some(serialized)
    }

    fn materialize(
        &mut self,
        serialized: &SerializedItem,
        layers: &LayerRegistry,
        settings: &SettingRegistry,
        created: &mut Vec<ItemId>,
    ) -> Result<ItemId, TreeError> {
        let id = match serialized {
            SerializedItem::View(g) | SerializedItem::SettingsGroup(g)
            | SerializedItem::DeltaSurface(g) => {
                let kind = match serialized {
                    SerializedItem::View(_) => GroupKind::View,
                    SerializedItem::SettingsGroup(_) => GroupKind::SettingsGroup,
                    _ => GroupKind::DeltaSurface,
                };
                let mut identity = identity_of(serialized);
                identity.color = g.color.clone();
                let id = self.restore_item(g.id, identity, ItemKind::Group(GroupData::new(kind)))?;
                created.push(id);
                for child in &g.children {
                    let cid = self.materialize(child, layers, settings, created)?;
                    if let Some(item) = self.items.get_mut(&cid) {
                        item.parent = Some(id);
                    }
                    if let Some(group) = self.items.get_mut(&id).and_then(Item::as_group_mut) {
                        group.children.push(cid);
                    }
                }
                id
            }
            SerializedItem::Layer(l) => {
                let definition = layers.create(&l.class)?;
                let (class, mut context, provider) = definition.into_parts();
                for (tag, value) in &l.settings {
                    let Some(key) = SettingKey::parse(tag) else {
                        return Err(TreeError::UnknownSettingKey(tag.clone()));
                    };
                    let Some(setting) = context.setting_mut(key) else {
                        log::warn!("layer class '{class}' has no '{tag}' setting, value dropped");
                        continue;
                    };
                    setting.set_value(value.clone());
                    setting.mark_persisted();
                }
                let id = self.restore_item(
                    l.id,
                    identity_of(serialized),
                    ItemKind::Layer(LayerData {
                        class,
                        context,
                        provider,
                        orchestrator: Default::default(),
                    }),
                )?;
                created.push(id);
                id
            }
            SerializedItem::SharedSetting(s) => {
                let key = settings.key_of(&s.class)?;
                let mut setting = Setting::new(key);
                setting.set_value(s.value.clone());
                let id = self.restore_item(
                    s.id,
                    identity_of(serialized),
                    ItemKind::SharedSetting(SharedSettingData::new(&s.class, setting)),
                )?;
                created.push(id);
                id
            }
            SerializedItem::ColorScale(c) => {
                let id = self.restore_item(
                    c.id,
                    identity_of(serialized),
                    ItemKind::ColorScale(ColorScaleData {
                        scale: c.scale.clone(),
                    }),
                )?;
                created.push(id);
                id
            }
        };
        Ok(id)
    }

    /// Insert a detached item under its persisted id and advance the id
    /// counter past it.
    fn restore_item(
        &mut self,
        raw_id: u64,
        identity: ItemIdentity,
        kind: ItemKind,
    ) -> Result<ItemId, TreeError> {
        let id = ItemId(raw_id);
        if self.items.contains_key(&id) {
            return Err(TreeError::AlreadyAttached(id));
        }
        self.next_item_id = self.next_item_id.max(raw_id + 1);
        self.items.insert(id, Item::new(id, identity, kind));
        Ok(id)
    }
}

fn identity_of(serialized: &SerializedItem) -> ItemIdentity {
    let (name, visible, expanded) = match serialized {
        SerializedItem::View(g) | SerializedItem::SettingsGroup(g)
        | SerializedItem::DeltaSurface(g) => (&g.name, g.visible, g.expanded),
        SerializedItem::Layer(l) => (&l.name, l.visible, l.expanded),
        SerializedItem::SharedSetting(s) => (&s.name, s.visible, s.expanded),
        SerializedItem::ColorScale(c) => (&c.name, c.visible, c.expanded),
    };
    let mut identity = ItemIdentity::new(name.clone());
    identity.visible = visible;
    identity.expanded = expanded;
    identity
}

#[cfg(test)]
mod tests {
    use strata_protocol::SettingValue;

    use super::*;
    use crate::context::LayerDefinition;
    use crate::fetch::{DataProvider, FetchCtx, FetchOutcome};

    struct StubProvider;

    impl DataProvider for StubProvider {
        fn fetch(&mut self, _ctx: &mut FetchCtx<'_>) -> FetchOutcome {
            FetchOutcome::Ready(Ok(serde_json::Value::Null))
        }
    }

    fn surface_definition() -> LayerDefinition {
        let mut def = LayerDefinition::new("surface", StubProvider)
            .with_setting(Setting::new(SettingKey::Ensemble))
            .with_setting(Setting::new(SettingKey::Attribute));
        def.available_values_updater(SettingKey::Ensemble, |_ctx| {
            Some(vec![SettingValue::from("E1"), SettingValue::from("E2")])
        });
        def.available_values_updater(SettingKey::Attribute, |_ctx| {
            Some(vec![SettingValue::from("depth"), SettingValue::from("time")])
        });
        def
    }

    fn registries() -> (LayerRegistry, SettingRegistry) {
        let mut layers = LayerRegistry::new();
        layers.register("surface", surface_definition);
        let mut settings = SettingRegistry::new();
        settings.register("attribute", SettingKey::Attribute);
        (layers, settings)
    }

    fn build_tree() -> RootManager {
        let mut mgr = RootManager::new();
        let view = mgr.new_group(GroupKind::View, "Main view");
        mgr.append_child(mgr.root(), view).unwrap();
        mgr.set_color(view, Some("#1f77b4".to_string())).unwrap();

        let layer = mgr.new_layer("Depth surface", surface_definition());
        mgr.append_child(view, layer).unwrap();
        mgr.set_setting_value(layer, SettingKey::Ensemble, SettingValue::from("E2"))
            .unwrap();
        mgr.set_visible(layer, false).unwrap();

        let shared = mgr.new_shared_setting("Attribute", "attribute", SettingKey::Attribute);
        mgr.append_child(view, shared).unwrap();
        mgr
    }

    #[test]
    fn test_document_roundtrip() {
        let mgr = build_tree();
        let doc = mgr.to_document();
        let json = serde_json::to_string(&doc).unwrap();
        let parsed: PersistedDocument = serde_json::from_str(&json).unwrap();

        let (layers, settings) = registries();
        let mut restored = RootManager::new();
        restored.load_document(&parsed, &layers, &settings).unwrap();

        // Ids, identity, and structure survive.
        let root_children = restored.children_of(restored.root()).unwrap().to_vec();
        assert_eq!(root_children.len(), 1);
        let view = restored.item(root_children[0]).unwrap();
        assert_eq!(view.name(), "Main view");
        assert_eq!(view.color(), Some("#1f77b4"));
        let view_children = restored.children_of(view.id()).unwrap().to_vec();
        assert_eq!(view_children.len(), 2);

        let layer_item = restored.item(view_children[0]).unwrap();
        assert!(!layer_item.is_visible());
        let layer = layer_item.as_layer().unwrap();
        assert_eq!(layer.class, "surface");
        // Restored value confirmed against the loaded available set.
        let ensemble = layer.context.setting(SettingKey::Ensemble).unwrap();
        assert_eq!(ensemble.value(), &SettingValue::from("E2"));
        assert!(!ensemble.is_persisted());

        // A second save produces the identical document.
        assert_eq!(
            serde_json::to_value(restored.to_document()).unwrap(),
            serde_json::to_value(&doc).unwrap()
        );
    }

    #[test]
    fn test_restored_ids_not_reused() {
        let mgr = build_tree();
        let doc = mgr.to_document();
        let max_id = doc.items.iter().map(SerializedItem::id).max().unwrap();

        let (layers, settings) = registries();
        let mut restored = RootManager::new();
        restored.load_document(&doc, &layers, &settings).unwrap();

        let fresh = restored.new_group(GroupKind::View, "Fresh");
        assert!(fresh.0 > max_id);
    }

    #[test]
    fn test_unknown_layer_class_leaves_tree_untouched() {
        let doc: PersistedDocument = serde_json::from_value(serde_json::json!({
            "items": [{
                "type": "layer",
                "id": 10,
                "name": "L",
                "visible": true,
                "expanded": true,
                "class": "seismic",
                "settings": {}
            }]
        }))
        .unwrap();

        let (layers, settings) = registries();
        let mut mgr = build_tree();
        let before = mgr.subtree_preorder(mgr.root());
        assert_eq!(
            mgr.load_document(&doc, &layers, &settings),
            Err(TreeError::UnknownLayerClass("seismic".to_string()))
        );
        assert_eq!(mgr.subtree_preorder(mgr.root()), before);
        assert!(mgr.item(ItemId(10)).is_none(), "partial load rolled back");
    }

    #[test]
    fn test_load_starts_fetches_for_valid_layers() {
        let mgr = build_tree();
        let doc = mgr.to_document();

        let (layers, settings) = registries();
        let mut restored = RootManager::new();
        restored.load_document(&doc, &layers, &settings).unwrap();

        let layer_id = restored
            .attached_layers()
            .first()
            .copied()
            .expect("one restored layer");
        let layer = restored.item(layer_id).unwrap().as_layer().unwrap();
        assert_eq!(
            layer.orchestrator.status(),
            crate::fetch::LayerStatus::Success
        );
    }
}
