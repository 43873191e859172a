use std::sync::Arc;

use foreman_core::{ConfigStore, EventBus, RunOrchestrator, Storage};

mod http;

pub use http::{build_router, serve};

/// Shared state behind every handler. Everything in here is cheap to clone;
/// the registries inside are `Arc`-backed.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: RunOrchestrator,
    pub storage: Arc<Storage>,
    pub event_bus: EventBus,
    pub config: ConfigStore,
}

impl AppState {
    pub fn new(
        orchestrator: RunOrchestrator,
        storage: Arc<Storage>,
        event_bus: EventBus,
        config: ConfigStore,
    ) -> Self {
        Self {
            orchestrator,
            storage,
            event_bus,
            config,
        }
    }
}
