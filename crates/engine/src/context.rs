//! Settings context: one layer's ordered setting collection plus the
//! declarative dependency graph that derives each setting's legal
//! values.
//!
//! Two registration primitives, both called once while building a
//! [`LayerDefinition`], before any data flows:
//!
//! - [`LayerDefinition::available_values_updater`] — a pure derivation
//!   of one setting's available-value set from local settings, global
//!   settings, and helper dependencies. Every read is recorded; the
//!   function re-runs whenever any input it read last time changes.
//! - [`LayerDefinition::helper_dependency`] — a memoized, possibly
//!   asynchronous lookup. A pending run hands out a generation ticket;
//!   superseding input changes abort the old signal and bump the
//!   generation so a stale resolution is discarded.
//!
//! Fix-up policy: when a recomputed available set no longer contains
//! the setting's value, the first element (or `Null` for an empty set)
//! is written back through the normal value path so dependents
//! re-evaluate transitively.

use rustc_hash::{FxHashMap, FxHashSet};
use strata_protocol::SettingValue;

use crate::dep_graph::{DepGraph, DepNode, GraphTarget, HelperId};
use crate::fetch::{abort_pair, AbortHandle, AbortSignal, DataProvider};
use crate::item::ItemId;
use crate::setting::{Setting, SettingKey};

/// The resolved value of every non-persisted setting, in declaration
/// order. This is the tuple compared to decide "did settings materially
/// change".
pub type ResolvedSettings = Vec<(SettingKey, SettingValue)>;

/// Result of one helper invocation.
pub enum HelperOutcome {
    /// The lookup resolved synchronously (typically memoized).
    Ready(SettingValue),
    /// The lookup started asynchronous work; it completes later through
    /// `RootManager::resolve_helper` with its ticket.
    Pending,
}

/// Opaque handle to a registered helper dependency, passed to
/// `UpdaterCtx::helper` by updater functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperHandle(pub(crate) HelperId);

/// Ticket identifying one pending helper invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperTicket {
    pub layer: ItemId,
    pub helper: HelperId,
    pub generation: u64,
}

pub type UpdaterFn = Box<dyn Fn(&mut UpdaterCtx<'_>) -> Option<Vec<SettingValue>>>;
pub type HelperFn = Box<dyn Fn(&mut HelperCtx<'_>) -> HelperOutcome>;

struct Updater {
    key: SettingKey,
    run: UpdaterFn,
}

struct HelperSlot {
    run: HelperFn,
    value: Option<SettingValue>,
    generation: u64,
    pending: bool,
    abort: Option<AbortHandle>,
}

/// Accessors handed to an available-values updater. Every read is
/// recorded as a dependency edge for the next incremental re-run.
pub struct UpdaterCtx<'a> {
    settings: &'a [Setting],
    index: &'a FxHashMap<SettingKey, usize>,
    helpers: &'a [HelperSlot],
    globals: &'a FxHashMap<String, SettingValue>,
    reads: FxHashSet<DepNode>,
}

impl UpdaterCtx<'_> {
    /// Effective value of a local setting. `Null` for unknown keys.
    pub fn local_setting(&mut self, key: SettingKey) -> SettingValue {
        self.reads.insert(DepNode::LocalValue(key));
        self.index
            .get(&key)
            .map(|i| self.settings[*i].effective_value().clone())
            .unwrap_or(SettingValue::Null)
    }

    pub fn global_setting(&mut self, key: &str) -> Option<SettingValue> {
        self.reads.insert(DepNode::Global(key.to_string()));
        self.globals.get(key).cloned()
    }

    /// Last resolved value of a helper dependency, without re-triggering
    /// it. `None` while the helper has never resolved.
    pub fn helper(&mut self, handle: HelperHandle) -> Option<SettingValue> {
        self.reads.insert(DepNode::Helper(handle.0));
        self.helpers.get(handle.0).and_then(|h| h.value.clone())
    }
}

/// Accessors handed to a helper dependency function.
pub struct HelperCtx<'a> {
    layer: ItemId,
    helper: HelperId,
    generation: u64,
    settings: &'a [Setting],
    index: &'a FxHashMap<SettingKey, usize>,
    globals: &'a FxHashMap<String, SettingValue>,
    abort: AbortSignal,
    reads: FxHashSet<DepNode>,
}

impl HelperCtx<'_> {
    pub fn local_setting(&mut self, key: SettingKey) -> SettingValue {
        self.reads.insert(DepNode::LocalValue(key));
        self.index
            .get(&key)
            .map(|i| self.settings[*i].effective_value().clone())
            .unwrap_or(SettingValue::Null)
    }

    pub fn global_setting(&mut self, key: &str) -> Option<SettingValue> {
        self.reads.insert(DepNode::Global(key.to_string()));
        self.globals.get(key).cloned()
    }

    /// Signal aborted when this invocation is superseded before it
    /// resolves.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Ticket to hand back through `RootManager::resolve_helper` when
    /// returning [`HelperOutcome::Pending`].
    pub fn ticket(&self) -> HelperTicket {
        HelperTicket {
            layer: self.layer,
            helper: self.helper,
            generation: self.generation,
        }
    }
}

/// Internal change record produced by a context reaction, converted to
/// tree events by the manager.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SettingDelta {
    ValueChanged(SettingKey),
    AvailableChanged(SettingKey),
}

// =============================================================================
// Layer definition (builder)
// =============================================================================

/// Everything needed to construct a layer: its class tag, its settings
/// in display order, its dependency graph functions, and its data
/// provider. Built by concrete layer modules (or registry factories)
/// outside the engine.
pub struct LayerDefinition {
    class: String,
    settings: Vec<Setting>,
    updaters: Vec<Updater>,
    helpers: Vec<HelperFn>,
    provider: Box<dyn DataProvider>,
}

impl LayerDefinition {
    pub fn new(class: impl Into<String>, provider: impl DataProvider + 'static) -> Self {
        Self {
            class: class.into(),
            settings: Vec::new(),
            updaters: Vec::new(),
            helpers: Vec::new(),
            provider: Box::new(provider),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Add one setting slot. Declaration order is display order and
    /// resolution order.
    pub fn with_setting(mut self, setting: Setting) -> Self {
        self.settings.push(setting);
        self
    }

    /// Register a memoized (possibly asynchronous) lookup. The returned
    /// handle lets updaters read its last resolved value.
    pub fn helper_dependency(
        &mut self,
        f: impl Fn(&mut HelperCtx<'_>) -> HelperOutcome + 'static,
    ) -> HelperHandle {
        self.helpers.push(Box::new(f));
        HelperHandle(self.helpers.len() - 1)
    }

    /// Register the derivation of one setting's available-value set.
    /// Returning `None` means "an input is still resolving" and flags
    /// the setting as loading.
    pub fn available_values_updater(
        &mut self,
        key: SettingKey,
        f: impl Fn(&mut UpdaterCtx<'_>) -> Option<Vec<SettingValue>> + 'static,
    ) {
        self.updaters.push(Updater {
            key,
            run: Box::new(f),
        });
    }

    pub(crate) fn into_parts(self) -> (String, SettingsContext, Box<dyn DataProvider>) {
        (
            self.class,
            SettingsContext::new(self.settings, self.updaters, self.helpers),
            self.provider,
        )
    }
}

// =============================================================================
// Settings context
// =============================================================================

/// One layer's settings plus their dependency graph and the cached
/// resolved tuple used for change detection.
pub struct SettingsContext {
    settings: Vec<Setting>,
    index: FxHashMap<SettingKey, usize>,
    updaters: Vec<Updater>,
    helpers: Vec<HelperSlot>,
    graph: DepGraph,
    cached_values: ResolvedSettings,
}

impl SettingsContext {
    fn new(settings: Vec<Setting>, updaters: Vec<Updater>, helpers: Vec<HelperFn>) -> Self {
        let mut index = FxHashMap::default();
        for (i, setting) in settings.iter().enumerate() {
            let prev = index.insert(setting.key(), i);
            debug_assert!(prev.is_none(), "duplicate setting key {:?}", setting.key());
        }
        let helpers = helpers
            .into_iter()
            .map(|run| HelperSlot {
                run,
                value: None,
                generation: 0,
                pending: false,
                abort: None,
            })
            .collect();
        Self {
            settings,
            index,
            updaters,
            helpers,
            graph: DepGraph::new(),
            cached_values: Vec::new(),
        }
    }

    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    pub fn setting(&self, key: SettingKey) -> Option<&Setting> {
        self.index.get(&key).map(|i| &self.settings[*i])
    }

    pub(crate) fn setting_mut(&mut self, key: SettingKey) -> Option<&mut Setting> {
        let i = *self.index.get(&key)?;
        Some(&mut self.settings[i])
    }

    pub fn graph(&self) -> &DepGraph {
        &self.graph
    }

    /// Current resolved value of every setting, skipping ones still
    /// flagged persisted (restored but not yet confirmed).
    pub fn resolved_values(&self) -> ResolvedSettings {
        self.settings
            .iter()
            .filter(|s| !s.is_persisted())
            .map(|s| (s.key(), s.effective_value().clone()))
            .collect()
    }

    pub(crate) fn cached_values(&self) -> &ResolvedSettings {
        &self.cached_values
    }

    pub(crate) fn set_cached_values(&mut self, values: ResolvedSettings) {
        self.cached_values = values;
    }

    /// Every local setting holds a valid value.
    pub fn all_settings_valid(&self) -> bool {
        self.settings.iter().all(Setting::is_valid)
    }

    pub fn helper_value(&self, handle: HelperHandle) -> Option<&SettingValue> {
        self.helpers.get(handle.0).and_then(|h| h.value.as_ref())
    }

    /// Run every helper and updater once, in registration order, then
    /// settle downstream effects. Called on attach, before the first
    /// fetch.
    pub(crate) fn evaluate_all(
        &mut self,
        layer: ItemId,
        globals: &FxHashMap<String, SettingValue>,
        budget: usize,
    ) -> Vec<SettingDelta> {
        let mut deltas = Vec::new();
        let mut changed: Vec<DepNode> = Vec::new();

        for id in 0..self.helpers.len() {
            match self.run_helper(layer, id, globals) {
                HelperRun::Changed => changed.push(DepNode::Helper(id)),
                HelperRun::Pending => self.mark_helper_dependents_loading(id),
                HelperRun::Unchanged => {}
            }
        }
        for idx in 0..self.updaters.len() {
            self.run_updater(idx, globals, &mut deltas, &mut changed);
        }

        deltas.extend(self.react(layer, changed, globals, budget));
        deltas
    }

    /// Incrementally re-evaluate everything affected by the given
    /// changed input nodes, in dependency order, with a bounded settle
    /// loop for fix-up feedback.
    pub(crate) fn react(
        &mut self,
        layer: ItemId,
        mut changed: Vec<DepNode>,
        globals: &FxHashMap<String, SettingValue>,
        budget: usize,
    ) -> Vec<SettingDelta> {
        let mut deltas = Vec::new();
        let mut rounds = 0;
        while !changed.is_empty() {
            rounds += 1;
            if rounds > budget {
                log::warn!("settings context did not settle within {budget} rounds");
                break;
            }
            let order = self.graph.affected_in_order(&changed);
            changed.clear();
            for target in order {
                match target {
                    GraphTarget::Helper(id) => match self.run_helper(layer, id, globals) {
                        HelperRun::Changed => changed.push(DepNode::Helper(id)),
                        HelperRun::Pending => self.mark_helper_dependents_loading(id),
                        HelperRun::Unchanged => {}
                    },
                    GraphTarget::Available(key) => {
                        if let Some(idx) = self.updaters.iter().position(|u| u.key == key) {
                            self.run_updater(idx, globals, &mut deltas, &mut changed);
                        }
                    }
                }
            }
        }
        deltas
    }

    /// Accept a pending helper resolution. Stale generations are
    /// discarded (the superseding run's result is authoritative).
    pub(crate) fn resolve_helper(
        &mut self,
        layer: ItemId,
        helper: HelperId,
        generation: u64,
        value: SettingValue,
        globals: &FxHashMap<String, SettingValue>,
        budget: usize,
    ) -> Option<Vec<SettingDelta>> {
        let slot = self.helpers.get_mut(helper)?;
        if !slot.pending || slot.generation != generation {
            log::debug!("discarding stale helper resolution (helper {helper}, gen {generation})");
            return None;
        }
        slot.pending = false;
        slot.abort = None;
        slot.value = Some(value);

        // Dependents re-run even when the value is unchanged: they may
        // still be flagged loading from the pending run.
        let changed = vec![DepNode::Helper(helper)];
        Some(self.react(layer, changed, globals, budget))
    }

    /// Release every in-flight helper (layer is being destroyed).
    pub(crate) fn abort_all_helpers(&mut self) {
        for slot in &mut self.helpers {
            if let Some(handle) = slot.abort.take() {
                handle.abort();
            }
            slot.pending = false;
        }
    }

    // Loading has no dedicated topic; the flag is observed through
    // validity checks and snapshots.
    fn mark_helper_dependents_loading(&mut self, helper: HelperId) {
        for target in self.graph.dependents(&DepNode::Helper(helper)) {
            if let GraphTarget::Available(key) = target {
                if let Some(i) = self.index.get(&key) {
                    self.settings[*i].set_loading(true);
                }
            }
        }
    }

    fn run_helper(
        &mut self,
        layer: ItemId,
        id: HelperId,
        globals: &FxHashMap<String, SettingValue>,
    ) -> HelperRun {
        // Supersede any previous pending attempt.
        let generation = {
            let slot = &mut self.helpers[id];
            if let Some(handle) = slot.abort.take() {
                handle.abort();
            }
            slot.generation += 1;
            slot.generation
        };

        let (signal, handle) = abort_pair();
        let mut ctx = HelperCtx {
            layer,
            helper: id,
            generation,
            settings: &self.settings,
            index: &self.index,
            globals,
            abort: signal,
            reads: FxHashSet::default(),
        };
        let outcome = (self.helpers[id].run)(&mut ctx);
        let reads = ctx.reads;
        self.graph.replace_edges(GraphTarget::Helper(id), reads);

        let slot = &mut self.helpers[id];
        match outcome {
            HelperOutcome::Ready(value) => {
                slot.pending = false;
                slot.abort = None;
                if slot.value.as_ref() == Some(&value) {
                    HelperRun::Unchanged
                } else {
                    slot.value = Some(value);
                    HelperRun::Changed
                }
            }
            HelperOutcome::Pending => {
                slot.pending = true;
                slot.abort = Some(handle);
                HelperRun::Pending
            }
        }
    }

    fn run_updater(
        &mut self,
        idx: usize,
        globals: &FxHashMap<String, SettingValue>,
        deltas: &mut Vec<SettingDelta>,
        changed: &mut Vec<DepNode>,
    ) {
        let key = self.updaters[idx].key;
        let mut ctx = UpdaterCtx {
            settings: &self.settings,
            index: &self.index,
            helpers: &self.helpers,
            globals,
            reads: FxHashSet::default(),
        };
        let result = (self.updaters[idx].run)(&mut ctx);
        let reads = ctx.reads;
        self.graph.replace_edges(GraphTarget::Available(key), reads);

        let Some(i) = self.index.get(&key).copied() else {
            debug_assert!(false, "updater registered for unknown key {key:?}");
            return;
        };
        let setting = &mut self.settings[i];

        match result {
            Some(values) => {
                setting.set_loading(false);
                if setting.set_available(values) {
                    deltas.push(SettingDelta::AvailableChanged(key));
                }
                if setting.available_values().contains(setting.value()) {
                    if setting.is_persisted() {
                        // Restored value confirmed by the loaded set:
                        // it now participates in resolution.
                        setting.confirm_persisted();
                        deltas.push(SettingDelta::ValueChanged(key));
                        changed.push(DepNode::LocalValue(key));
                    }
                } else {
                    let replacement = setting
                        .available_values()
                        .first()
                        .cloned()
                        .unwrap_or(SettingValue::Null);
                    if setting.set_value(replacement) {
                        deltas.push(SettingDelta::ValueChanged(key));
                        changed.push(DepNode::LocalValue(key));
                    }
                }
            }
            None => {
                setting.set_loading(true);
            }
        }
    }
}

enum HelperRun {
    Unchanged,
    Changed,
    Pending,
}
