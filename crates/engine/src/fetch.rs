//! Layer fetch orchestration: status state machine, cancellation
//! bookkeeping, and the external data-provider contract.
//!
//! Fetches are completion-injected: a provider either resolves
//! synchronously (`FetchOutcome::Ready`) or returns `Pending` and later
//! hands the result back through
//! [`crate::manager::RootManager::complete_fetch`] with the generation
//! ticket it was given. Stale completions are discarded by generation
//! comparison even when a task ignored its abort signal.

use std::cell::Cell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use strata_protocol::SettingValue;

use crate::context::ResolvedSettings;
use crate::item::ItemId;
use crate::setting::SettingKey;

/// Key a fetch registers with the shared cache client, so a later
/// cancellation can target the exact queries it started.
pub type QueryKey = String;

/// Fetched layer payload. Opaque to the engine; the visualization layer
/// interprets it.
pub type Payload = serde_json::Value;

/// Fetch status of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Axis-aligned bounding box of a layer's fetched data.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub min_z: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub max_z: f64,
}

/// How a fetch attempt ended, from the provider's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// The request was cancelled. Swallowed silently: no status change,
    /// no recorded error — a replacement fetch is assumed imminent.
    Cancelled,
    /// Any other failure, normalized to a message.
    Message(String),
}

/// Result of invoking a provider's `fetch`.
pub enum FetchOutcome {
    /// The provider resolved synchronously.
    Ready(Result<Payload, FetchError>),
    /// The provider started asynchronous work and will complete via
    /// `RootManager::complete_fetch` with its ticket.
    Pending,
}

// =============================================================================
// Cooperative cancellation
// =============================================================================

/// Read side of a cancellation flag, threaded into providers and helper
/// lookups. Cooperative: a task that never checks it still has its
/// result discarded by generation comparison.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Rc<Cell<bool>>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.inner.get()
    }
}

/// Write side of a cancellation flag, kept by the orchestrator.
#[derive(Debug)]
pub struct AbortHandle {
    inner: Rc<Cell<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.inner.set(true);
    }
}

/// Create a connected (signal, handle) pair.
pub fn abort_pair() -> (AbortSignal, AbortHandle) {
    let inner: Rc<Cell<bool>> = Rc::new(Cell::new(false));
    (
        AbortSignal {
            inner: inner.clone(),
        },
        AbortHandle { inner },
    )
}

// =============================================================================
// Collaborator contracts
// =============================================================================

/// The shared query cache, reduced to the capabilities the
/// cancel-before-refetch protocol needs. Production binds this to the
/// real cache; tests use a spy.
pub trait CacheClient {
    fn cancel(&self, key: &QueryKey);
    fn invalidate(&self, key: &QueryKey);
    fn evict(&self, key: &QueryKey);
}

/// Cache client that ignores everything. Default for managers whose
/// providers do not register query keys.
#[derive(Debug, Default)]
pub struct NoopCacheClient;

impl CacheClient for NoopCacheClient {
    fn cancel(&self, _key: &QueryKey) {}
    fn invalidate(&self, _key: &QueryKey) {}
    fn evict(&self, _key: &QueryKey) {}
}

/// Per-layer data provider: builds addresses from resolved settings and
/// fetches external data. Implementations live outside the engine.
pub trait DataProvider {
    /// Start one fetch for the current resolved settings.
    fn fetch(&mut self, ctx: &mut FetchCtx<'_>) -> FetchOutcome;

    /// Derive a bounding box from a fetched payload.
    fn make_bounding_box(&self, _payload: &Payload) -> Option<BoundingBox> {
        None
    }

    /// Derive a [min, max] value range from a fetched payload.
    fn make_value_range(&self, _payload: &Payload) -> Option<(f64, f64)> {
        None
    }

    /// Whether a resolved-settings transition warrants a refetch.
    /// Every concrete provider observed so far wants deep inequality.
    fn settings_require_refetch(&self, prev: &ResolvedSettings, next: &ResolvedSettings) -> bool {
        prev != next
    }

    /// Layer-specific validity predicate, combined with per-setting
    /// validity by `are_current_settings_valid`.
    fn are_settings_valid(&self, _resolved: &ResolvedSettings) -> bool {
        true
    }
}

/// Ticket identifying one fetch attempt. A pending provider must return
/// this to `complete_fetch`; a stale ticket is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub layer: ItemId,
    pub generation: u64,
}

/// Everything a provider may read while starting a fetch.
pub struct FetchCtx<'a> {
    layer: ItemId,
    generation: u64,
    resolved: &'a ResolvedSettings,
    globals: &'a FxHashMap<String, SettingValue>,
    abort: AbortSignal,
    registered: Vec<QueryKey>,
}

impl<'a> FetchCtx<'a> {
    pub(crate) fn new(
        layer: ItemId,
        generation: u64,
        resolved: &'a ResolvedSettings,
        globals: &'a FxHashMap<String, SettingValue>,
        abort: AbortSignal,
    ) -> Self {
        Self {
            layer,
            generation,
            resolved,
            globals,
            abort,
            registered: Vec::new(),
        }
    }

    /// Resolved value of one local setting, if present and resolved.
    pub fn setting(&self, key: SettingKey) -> Option<&SettingValue> {
        self.resolved
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn global(&self, key: &str) -> Option<&SettingValue> {
        self.globals.get(key)
    }

    /// Cooperative cancellation signal for this attempt.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Ticket to hand back through `complete_fetch` when pending.
    pub fn ticket(&self) -> FetchTicket {
        FetchTicket {
            layer: self.layer,
            generation: self.generation,
        }
    }

    /// Declare a query key this fetch started, so a superseding trigger
    /// can cancel/invalidate/evict it.
    pub fn register_query_key(&mut self, key: impl Into<QueryKey>) {
        self.registered.push(key.into());
    }

    pub(crate) fn into_registered_keys(self) -> Vec<QueryKey> {
        self.registered
    }
}

// =============================================================================
// Orchestrator state
// =============================================================================

/// Per-layer fetch lifecycle state. The sequencing itself (cancel
/// before refetch, event ordering) lives on the root manager, which
/// owns the cache client and the event queue.
pub struct Orchestrator {
    status: LayerStatus,
    error: Option<String>,
    payload: Option<Payload>,
    bounding_box: Option<BoundingBox>,
    value_range: Option<(f64, f64)>,
    registered_keys: Vec<QueryKey>,
    generation: u64,
    abort: Option<AbortHandle>,
    subordinated: bool,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            status: LayerStatus::Idle,
            error: None,
            payload: None,
            bounding_box: None,
            value_range: None,
            registered_keys: Vec::new(),
            generation: 0,
            abort: None,
            subordinated: false,
        }
    }

    pub fn status(&self) -> LayerStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        self.bounding_box
    }

    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.value_range
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_subordinated(&self) -> bool {
        self.subordinated
    }

    pub(crate) fn set_subordinated(&mut self, subordinated: bool) -> bool {
        if subordinated == self.subordinated {
            return false;
        }
        self.subordinated = subordinated;
        true
    }

    /// Abort the in-flight attempt (if any), advance the generation so
    /// stale completions are discarded, and hand back the query keys
    /// the cancelled attempt registered.
    pub(crate) fn supersede(&mut self) -> Vec<QueryKey> {
        if let Some(handle) = self.abort.take() {
            handle.abort();
        }
        self.generation += 1;
        std::mem::take(&mut self.registered_keys)
    }

    /// Enter Loading: clear derived caches, install the new abort
    /// handle. Returns true if the visible status changed.
    pub(crate) fn begin_loading(&mut self, abort: AbortHandle) -> bool {
        self.abort = Some(abort);
        self.bounding_box = None;
        self.value_range = None;
        let changed = self.status != LayerStatus::Loading;
        self.status = LayerStatus::Loading;
        changed
    }

    pub(crate) fn set_registered_keys(&mut self, keys: Vec<QueryKey>) {
        self.registered_keys = keys;
    }

    /// Whether a completion for `generation` is still current.
    pub(crate) fn accepts(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub(crate) fn succeed(
        &mut self,
        payload: Payload,
        bounding_box: Option<BoundingBox>,
        value_range: Option<(f64, f64)>,
    ) {
        self.payload = Some(payload);
        self.bounding_box = bounding_box;
        self.value_range = value_range;
        self.error = None;
        self.status = LayerStatus::Success;
        self.abort = None;
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.error = Some(message);
        self.status = LayerStatus::Error;
        self.abort = None;
    }
}
