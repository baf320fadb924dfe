use std::sync::Arc;

use nexus_core::{Dispatcher, LlmRouter, Nexus};
use nexus_memory::{ConversationStore, RetrievalCoordinator};

/// Shared application state accessible from all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Credential pools, for health reporting
    pub router: Arc<LlmRouter>,
    pub retrieval: Arc<RetrievalCoordinator>,
    pub store: ConversationStore,
}

impl AppState {
    pub fn from_nexus(nexus: &Nexus) -> Self {
        Self {
            dispatcher: Arc::clone(&nexus.dispatcher),
            router: Arc::clone(&nexus.router),
            retrieval: Arc::clone(&nexus.retrieval),
            store: nexus.store.clone(),
        }
    }
}
