//! Test harness: a root manager wired to a spying cache client, an
//! event collector, and scripted data providers.
//!
//! Used by the crate's own tests and by integration tests; not intended
//! for production code.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use serde_json::json;
use strata_protocol::SettingValue;

use crate::context::LayerDefinition;
use crate::events::EventCollector;
use crate::fetch::{
    CacheClient, DataProvider, FetchCtx, FetchError, FetchOutcome, FetchTicket, QueryKey,
};
use crate::manager::RootManager;
use crate::setting::{Setting, SettingKey};

/// One call observed by the spy cache client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp {
    Cancel(QueryKey),
    Invalidate(QueryKey),
    Evict(QueryKey),
}

/// Cache client that records every call in order.
#[derive(Clone, Default)]
pub struct SpyCacheClient {
    ops: Rc<RefCell<Vec<CacheOp>>>,
}

impl SpyCacheClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Ref<'_, Vec<CacheOp>> {
        self.ops.borrow()
    }

    pub fn take_ops(&self) -> Vec<CacheOp> {
        std::mem::take(&mut self.ops.borrow_mut())
    }
}

impl CacheClient for SpyCacheClient {
    fn cancel(&self, key: &QueryKey) {
        self.ops.borrow_mut().push(CacheOp::Cancel(key.clone()));
    }

    fn invalidate(&self, key: &QueryKey) {
        self.ops.borrow_mut().push(CacheOp::Invalidate(key.clone()));
    }

    fn evict(&self, key: &QueryKey) {
        self.ops.borrow_mut().push(CacheOp::Evict(key.clone()));
    }
}

/// Shared fetch log for scripted providers.
#[derive(Clone, Default)]
pub struct FetchLog {
    count: Rc<RefCell<usize>>,
    tickets: Rc<RefCell<Vec<FetchTicket>>>,
}

impl FetchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch_count(&self) -> usize {
        *self.count.borrow()
    }

    /// Tickets handed out by pending fetches, oldest first.
    pub fn tickets(&self) -> Vec<FetchTicket> {
        self.tickets.borrow().clone()
    }

    pub fn last_ticket(&self) -> Option<FetchTicket> {
        self.tickets.borrow().last().copied()
    }

    fn record(&self, ticket: Option<FetchTicket>) {
        *self.count.borrow_mut() += 1;
        if let Some(ticket) = ticket {
            self.tickets.borrow_mut().push(ticket);
        }
    }
}

fn query_key_for(ctx: &FetchCtx<'_>) -> QueryKey {
    let mut parts: Vec<String> = Vec::new();
    for key in SettingKey::ALL {
        if let Some(value) = ctx.setting(key) {
            parts.push(format!("{key}={}", serde_json::to_string(value).unwrap()));
        }
    }
    parts.join("&")
}

/// Provider that resolves synchronously with a payload echoing the
/// resolved settings it saw.
pub struct ImmediateProvider {
    log: FetchLog,
}

impl ImmediateProvider {
    pub fn new(log: FetchLog) -> Self {
        Self { log }
    }
}

impl DataProvider for ImmediateProvider {
    fn fetch(&mut self, ctx: &mut FetchCtx<'_>) -> FetchOutcome {
        self.log.record(None);
        let key = query_key_for(ctx);
        ctx.register_query_key(key.clone());
        FetchOutcome::Ready(Ok(json!({ "query": key })))
    }
}

/// Provider that always goes pending; the test completes it through
/// `RootManager::complete_fetch` with a recorded ticket.
pub struct PendingProvider {
    log: FetchLog,
}

impl PendingProvider {
    pub fn new(log: FetchLog) -> Self {
        Self { log }
    }
}

impl DataProvider for PendingProvider {
    fn fetch(&mut self, ctx: &mut FetchCtx<'_>) -> FetchOutcome {
        self.log.record(Some(ctx.ticket()));
        ctx.register_query_key(query_key_for(ctx));
        FetchOutcome::Pending
    }
}

/// Provider that fails every fetch with the given message.
pub struct FailingProvider {
    log: FetchLog,
    message: String,
}

impl FailingProvider {
    pub fn new(log: FetchLog, message: &str) -> Self {
        Self {
            log,
            message: message.to_string(),
        }
    }
}

impl DataProvider for FailingProvider {
    fn fetch(&mut self, _ctx: &mut FetchCtx<'_>) -> FetchOutcome {
        self.log.record(None);
        FetchOutcome::Ready(Err(FetchError::Message(self.message.clone())))
    }
}

/// A surface-like layer definition: ensemble gates realization,
/// attribute is free-standing. Enough structure to exercise the
/// dependency graph without external data.
pub fn surface_definition(provider: impl DataProvider + 'static) -> LayerDefinition {
    let mut def = LayerDefinition::new("surface", provider)
        .with_setting(Setting::new(SettingKey::Ensemble))
        .with_setting(Setting::new(SettingKey::Realization))
        .with_setting(Setting::new(SettingKey::Attribute));
    def.available_values_updater(SettingKey::Ensemble, |ctx| {
        match ctx.global_setting("ensembles") {
            Some(SettingValue::List(items)) => Some(items),
            _ => Some(vec![SettingValue::from("E1"), SettingValue::from("E2")]),
        }
    });
    def.available_values_updater(SettingKey::Realization, |ctx| {
        match ctx.local_setting(SettingKey::Ensemble).as_text() {
            Some("E1") => Some(vec![SettingValue::Int(0), SettingValue::Int(1)]),
            Some(_) => Some(vec![SettingValue::Int(0)]),
            None => Some(vec![]),
        }
    });
    def.available_values_updater(SettingKey::Attribute, |_ctx| {
        Some(vec![SettingValue::from("depth"), SettingValue::from("time")])
    });
    def
}

/// Manager plus spies, ready for scenario tests.
pub struct EngineHarness {
    pub manager: RootManager,
    pub cache: SpyCacheClient,
    events: Rc<RefCell<EventCollector>>,
}

impl Default for EngineHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineHarness {
    pub fn new() -> Self {
        let cache = SpyCacheClient::new();
        let mut manager = RootManager::with_cache(Box::new(cache.clone()));
        let events: Rc<RefCell<EventCollector>> = Rc::new(RefCell::new(EventCollector::new()));
        let sink = events.clone();
        manager.subscribe_all(move |event| sink.borrow_mut().push(event.clone()));
        Self {
            manager,
            cache,
            events,
        }
    }

    pub fn events(&self) -> Ref<'_, EventCollector> {
        self.events.borrow()
    }

    pub fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }
}
