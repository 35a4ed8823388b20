//! End-to-end scenarios across the tree, the settle pipeline, and the
//! fetch orchestration.

use serde_json::json;
use strata_protocol::SettingValue;

use crate::context::{HelperOutcome, LayerDefinition};
use crate::events::{Topic, TreeEvent};
use crate::fetch::{FetchError, LayerStatus};
use crate::harness::{
    surface_definition, CacheOp, EngineHarness, FailingProvider, FetchLog, ImmediateProvider,
    PendingProvider,
};
use crate::item::{GroupKind, ItemId};
use crate::setting::{Setting, SettingKey};

fn status_of(h: &EngineHarness, layer: ItemId) -> LayerStatus {
    h.manager
        .item(layer)
        .unwrap()
        .as_layer()
        .unwrap()
        .orchestrator
        .status()
}

fn payload_query(h: &EngineHarness, layer: ItemId) -> String {
    h.manager
        .item(layer)
        .unwrap()
        .as_layer()
        .unwrap()
        .orchestrator
        .payload()
        .and_then(|p| p["query"].as_str())
        .unwrap_or_default()
        .to_string()
}

#[test]
fn test_attach_triggers_first_fetch() {
    let mut h = EngineHarness::new();
    let log = FetchLog::new();
    let layer = h
        .manager
        .new_layer("Surface", surface_definition(ImmediateProvider::new(log.clone())));
    let root = h.manager.root();
    h.manager.append_child(root, layer).unwrap();

    assert_eq!(log.fetch_count(), 1);
    assert_eq!(status_of(&h, layer), LayerStatus::Success);
    // Fix-up chose the first available everywhere.
    assert!(payload_query(&h, layer).contains("ensemble=\"E1\""));
    assert_eq!(
        h.events().statuses_of(layer),
        vec![LayerStatus::Loading, LayerStatus::Success]
    );
}

#[test]
fn test_setting_change_cancels_before_refetching() {
    let mut h = EngineHarness::new();
    let log = FetchLog::new();
    let layer = h
        .manager
        .new_layer("Surface", surface_definition(PendingProvider::new(log.clone())));
    let root = h.manager.root();
    h.manager.append_child(root, layer).unwrap();

    assert_eq!(log.fetch_count(), 1);
    assert_eq!(status_of(&h, layer), LayerStatus::Loading);
    let first = log.last_ticket().unwrap();
    h.cache.take_ops();

    h.manager
        .set_setting_value(layer, SettingKey::Attribute, SettingValue::from("time"))
        .unwrap();

    // The in-flight attempt's query is cancelled, invalidated, and
    // evicted, in that order, before the replacement fetch runs.
    assert_eq!(log.fetch_count(), 2);
    let ops = h.cache.take_ops();
    assert_eq!(ops.len(), 3);
    let CacheOp::Cancel(cancelled) = &ops[0] else {
        panic!("expected cancel first, got {ops:?}");
    };
    assert!(cancelled.contains("attribute=\"depth\""));
    assert_eq!(ops[1], CacheOp::Invalidate(cancelled.clone()));
    assert_eq!(ops[2], CacheOp::Evict(cancelled.clone()));

    // The superseded completion is discarded by generation.
    h.manager.complete_fetch(first, Ok(json!({"stale": true})));
    assert_eq!(status_of(&h, layer), LayerStatus::Loading);

    let current = log.last_ticket().unwrap();
    h.manager.complete_fetch(current, Ok(json!({"query": "fresh"})));
    assert_eq!(status_of(&h, layer), LayerStatus::Success);
    assert_eq!(payload_query(&h, layer), "fresh");
}

#[test]
fn test_value_change_event_precedes_loading_status() {
    let mut h = EngineHarness::new();
    let log = FetchLog::new();
    let layer = h
        .manager
        .new_layer("Surface", surface_definition(ImmediateProvider::new(log)));
    let root = h.manager.root();
    h.manager.append_child(root, layer).unwrap();
    h.clear_events();

    h.manager
        .set_setting_value(layer, SettingKey::Attribute, SettingValue::from("time"))
        .unwrap();

    let events = h.events();
    let value_pos = events
        .position(|e| {
            matches!(
                e,
                TreeEvent::SettingValueChanged { item, key }
                    if *item == layer && *key == SettingKey::Attribute
            )
        })
        .expect("value change published");
    let settings_pos = events
        .position(|e| matches!(e, TreeEvent::SettingsChanged { layer: l } if *l == layer))
        .expect("settings change published");
    let loading_pos = events
        .position(|e| {
            matches!(
                e,
                TreeEvent::LayerStatusChanged { layer: l, status: LayerStatus::Loading }
                    if *l == layer
            )
        })
        .expect("loading published");
    assert!(value_pos < settings_pos);
    assert!(settings_pos < loading_pos);
}

#[test]
fn test_noop_write_produces_zero_notifications_and_no_fetch() {
    let mut h = EngineHarness::new();
    let log = FetchLog::new();
    let layer = h
        .manager
        .new_layer("Surface", surface_definition(ImmediateProvider::new(log.clone())));
    let root = h.manager.root();
    h.manager.append_child(root, layer).unwrap();
    h.clear_events();

    // Fix-up already selected E1; writing it again must be silent.
    h.manager
        .set_setting_value(layer, SettingKey::Ensemble, SettingValue::from("E1"))
        .unwrap();

    assert!(h.events().is_empty());
    assert_eq!(log.fetch_count(), 1);
}

#[test]
fn test_cancelled_completion_is_swallowed() {
    let mut h = EngineHarness::new();
    let log = FetchLog::new();
    let layer = h
        .manager
        .new_layer("Surface", surface_definition(PendingProvider::new(log.clone())));
    let root = h.manager.root();
    h.manager.append_child(root, layer).unwrap();
    h.clear_events();

    let ticket = log.last_ticket().unwrap();
    h.manager.complete_fetch(ticket, Err(FetchError::Cancelled));

    assert_eq!(status_of(&h, layer), LayerStatus::Loading);
    assert!(h.events().is_empty());
    let layer_data = h.manager.item(layer).unwrap().as_layer().unwrap();
    assert!(layer_data.orchestrator.error().is_none());
}

#[test]
fn test_failed_fetch_sets_error_without_revision_bump() {
    let mut h = EngineHarness::new();
    let log = FetchLog::new();
    let layer = h.manager.new_layer(
        "Surface",
        surface_definition(FailingProvider::new(log, "backend unavailable")),
    );
    let root = h.manager.root();
    h.manager.append_child(root, layer).unwrap();

    assert_eq!(status_of(&h, layer), LayerStatus::Error);
    let layer_data = h.manager.item(layer).unwrap().as_layer().unwrap();
    // Stored error carries the layer's display name.
    assert_eq!(
        layer_data.orchestrator.error(),
        Some("Surface: backend unavailable")
    );
    assert_eq!(h.manager.data_revision(), 0);
    assert!(h.events().revisions().is_empty());
}

#[test]
fn test_revision_is_monotonic_across_fetches_and_toggles() {
    let mut h = EngineHarness::new();
    let log = FetchLog::new();
    let layer = h
        .manager
        .new_layer("Surface", surface_definition(ImmediateProvider::new(log)));
    let root = h.manager.root();
    h.manager.append_child(root, layer).unwrap();

    h.manager.set_visible(layer, false).unwrap();
    h.manager
        .set_setting_value(layer, SettingKey::Ensemble, SettingValue::from("E2"))
        .unwrap();
    h.manager.set_visible(layer, true).unwrap();

    let revisions = h.events().revisions();
    assert_eq!(revisions.len(), 4, "fetch, hide, refetch, show");
    assert!(revisions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(h.manager.data_revision(), *revisions.last().unwrap());
}

#[test]
fn test_global_setting_change_flows_into_refetch() {
    let mut h = EngineHarness::new();
    let log = FetchLog::new();
    let layer = h
        .manager
        .new_layer("Surface", surface_definition(ImmediateProvider::new(log.clone())));
    let root = h.manager.root();
    h.manager.append_child(root, layer).unwrap();
    assert_eq!(log.fetch_count(), 1);

    h.manager.update_global_setting(
        "ensembles",
        SettingValue::List(vec![SettingValue::from("E5")]),
    );

    // New available set invalidated the old value; fix-up picked E5 and
    // the changed resolved settings refetched.
    assert_eq!(log.fetch_count(), 2);
    assert!(payload_query(&h, layer).contains("ensemble=\"E5\""));
}

#[test]
fn test_shared_ensemble_override_end_to_end() {
    let mut h = EngineHarness::new();
    let log = FetchLog::new();
    let root = h.manager.root();
    let group = h.manager.new_group(GroupKind::SettingsGroup, "Ensemble group");
    h.manager.append_child(root, group).unwrap();
    let shared = h
        .manager
        .new_shared_setting("Ensemble", "ensemble", SettingKey::Ensemble);
    h.manager.append_child(group, shared).unwrap();

    let l1 = h
        .manager
        .new_layer("Top", surface_definition(ImmediateProvider::new(log.clone())));
    let l2 = h
        .manager
        .new_layer("Base", surface_definition(ImmediateProvider::new(log.clone())));
    h.manager.append_child(group, l1).unwrap();
    h.manager.append_child(group, l2).unwrap();
    assert_eq!(log.fetch_count(), 2);
    h.clear_events();

    h.manager
        .set_shared_setting_value(shared, SettingValue::from("E2"))
        .unwrap();

    // Both layers were overridden and refetched with the shared value.
    assert_eq!(log.fetch_count(), 4);
    for lid in [l1, l2] {
        let layer = h.manager.item(lid).unwrap().as_layer().unwrap();
        let setting = layer.context.setting(SettingKey::Ensemble).unwrap();
        assert!(setting.is_overridden());
        assert_eq!(setting.effective_value(), &SettingValue::from("E2"));
        // The local value survives untouched beneath the override.
        assert_eq!(setting.value(), &SettingValue::from("E1"));
        assert!(payload_query(&h, lid).contains("ensemble=\"E2\""));
        assert!(h
            .events()
            .for_topic(&Topic::SettingOverride(lid, SettingKey::Ensemble))
            .len()
            >= 1);
    }

    // Removing the shared setting releases the overrides; each layer
    // falls back to its own value and refetches.
    h.manager.remove_item(shared).unwrap();
    assert_eq!(log.fetch_count(), 6);
    for lid in [l1, l2] {
        let layer = h.manager.item(lid).unwrap().as_layer().unwrap();
        let setting = layer.context.setting(SettingKey::Ensemble).unwrap();
        assert!(!setting.is_overridden());
        assert_eq!(setting.effective_value(), &SettingValue::from("E1"));
    }
}

#[test]
fn test_delta_surface_subordinates_direct_layer_children() {
    let mut h = EngineHarness::new();
    let log = FetchLog::new();
    let root = h.manager.root();
    let delta = h.manager.new_group(GroupKind::DeltaSurface, "Delta");
    h.manager.append_child(root, delta).unwrap();

    let l1 = h
        .manager
        .new_layer("Minuend", surface_definition(PendingProvider::new(log.clone())));
    let l2 = h
        .manager
        .new_layer("Subtrahend", surface_definition(PendingProvider::new(log.clone())));
    h.manager.append_child(delta, l1).unwrap();
    h.manager.append_child(delta, l2).unwrap();

    // Subordinated layers resolve settings but never fetch.
    assert_eq!(log.fetch_count(), 0);
    for lid in [l1, l2] {
        let layer = h.manager.item(lid).unwrap().as_layer().unwrap();
        assert!(layer.orchestrator.is_subordinated());
        assert_eq!(layer.orchestrator.status(), LayerStatus::Idle);
        assert!(layer.context.all_settings_valid());
    }

    // Moving a layer out releases it and starts its fetch.
    h.manager.move_child(l1, root, 0).unwrap();
    assert_eq!(log.fetch_count(), 1);
    let layer = h.manager.item(l1).unwrap().as_layer().unwrap();
    assert!(!layer.orchestrator.is_subordinated());
    assert_eq!(layer.orchestrator.status(), LayerStatus::Loading);
    let events = h.events();
    let subordinations = events.for_topic(&Topic::Subordination(l1));
    assert_eq!(
        subordinations.last().map(|e| (*e).clone()),
        Some(TreeEvent::SubordinationChanged {
            layer: l1,
            subordinated: false
        })
    );
}

#[test]
fn test_pending_helper_gates_fetch_until_resolved() {
    let helper_tickets = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = helper_tickets.clone();

    let log = FetchLog::new();
    let mut def = LayerDefinition::new("surface", ImmediateProvider::new(log.clone()))
        .with_setting(Setting::new(SettingKey::SurfaceName));
    let names = def.helper_dependency(move |ctx| {
        let _ = ctx.global_setting("field_id");
        sink.borrow_mut().push(ctx.ticket());
        HelperOutcome::Pending
    });
    def.available_values_updater(SettingKey::SurfaceName, move |ctx| {
        ctx.helper(names).map(|v| match v {
            SettingValue::List(items) => items,
            other => vec![other],
        })
    });

    let mut h = EngineHarness::new();
    let root = h.manager.root();
    let layer = h.manager.new_layer("Surface", def);
    h.manager.append_child(root, layer).unwrap();

    // Settings are loading until the helper resolves; no fetch yet.
    assert_eq!(log.fetch_count(), 0);
    assert_eq!(status_of(&h, layer), LayerStatus::Idle);

    let ticket = *helper_tickets.borrow().last().unwrap();
    h.manager.resolve_helper(
        ticket,
        SettingValue::List(vec![SettingValue::from("top"), SettingValue::from("base")]),
    );

    assert_eq!(log.fetch_count(), 1);
    assert_eq!(status_of(&h, layer), LayerStatus::Success);
    assert!(payload_query(&h, layer).contains("surface_name=\"top\""));
}

#[test]
fn test_removed_layer_cancels_inflight_queries() {
    let mut h = EngineHarness::new();
    let log = FetchLog::new();
    let layer = h
        .manager
        .new_layer("Surface", surface_definition(PendingProvider::new(log.clone())));
    let root = h.manager.root();
    h.manager.append_child(root, layer).unwrap();
    h.cache.take_ops();
    let ticket = log.last_ticket().unwrap();

    h.manager.remove_item(layer).unwrap();

    let ops = h.cache.take_ops();
    assert!(matches!(ops.first(), Some(CacheOp::Cancel(_))));
    assert_eq!(ops.len(), 3);

    // A completion arriving after removal is dropped on the floor.
    h.manager.complete_fetch(ticket, Ok(json!({"late": true})));
    assert!(h.manager.item(layer).is_none());
}
