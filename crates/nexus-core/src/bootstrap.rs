use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use nexus_memory::{ConversationStore, RetrievalCoordinator};

use crate::agent::AgentFactory;
use crate::classifier::LlmClassifier;
use crate::config::NexusConfig;
use crate::dispatcher::Dispatcher;
use crate::formatter::{LlmApology, LlmFormatter};
use crate::handlers::{
    LibrarianHandler, MemoryQueryHandler, NewsHandler, OfferHandler, PersonaHandler,
    ReporterHandler,
};
use crate::pending::PendingTaskStore;
use crate::planner::Planner;
use crate::router::LlmRouter;

/// Everything a running instance needs, wired from one config root.
pub struct Nexus {
    pub config: NexusConfig,
    pub store: ConversationStore,
    pub router: Arc<LlmRouter>,
    pub retrieval: Arc<RetrievalCoordinator>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn bootstrap(root: &Path, config: NexusConfig) -> Result<Nexus> {
    let db_path = NexusConfig::resolve_path(root, &config.memory.db_path);
    let store = ConversationStore::open(&db_path)
        .with_context(|| format!("failed to open conversation store: {}", db_path.display()))?;

    let router = Arc::new(LlmRouter::from_config(&config)?);

    let retrieval_cfg = &config.retrieval;
    let embedder = retrieval_cfg.embedding.build()?;
    let reranker = retrieval_cfg.reranker.build()?;
    let index_root = NexusConfig::resolve_path(root, &retrieval_cfg.index_root);
    let retrieval = Arc::new(RetrievalCoordinator::load(
        index_root,
        embedder,
        reranker,
        retrieval_cfg.settings.clone(),
    ));
    tracing::info!("retrieval indexes loaded: {:?}", retrieval.summary());

    let factory = AgentFactory::new(
        Arc::clone(&router),
        config.agents.clone(),
        Some(root.to_path_buf()),
    );

    let dispatcher = Dispatcher::builder(
        store.clone(),
        Arc::new(LlmClassifier::new(&factory)),
        Arc::new(Planner::new(&factory, Arc::clone(&retrieval))),
    )
    .pending(Arc::new(PendingTaskStore::from_config(&config.pending)))
    .formatter(Arc::new(LlmFormatter::new(&factory)))
    .apology(Arc::new(LlmApology::new(&factory)))
    .retrieval(Arc::clone(&retrieval))
    .history_window(config.memory.history_window)
    .context_turns(config.memory.context_turns)
    .handler(Arc::new(ReporterHandler::new(config.important_days.clone())))
    .handler(Arc::new(LibrarianHandler::new(&factory, Arc::clone(&retrieval))))
    .handler(Arc::new(MemoryQueryHandler::new(&factory, store.clone())))
    .handler(Arc::new(NewsHandler::new(&factory, Arc::clone(&retrieval))))
    .handler(Arc::new(OfferHandler::new(&factory, Arc::clone(&retrieval))))
    .handler(Arc::new(PersonaHandler::general(&factory, Arc::clone(&retrieval))))
    .handler(Arc::new(PersonaHandler::counselor(&factory)))
    .handler(Arc::new(PersonaHandler::coder(&factory)))
    .handler(Arc::new(PersonaHandler::listener(&factory)))
    .build();

    Ok(Nexus {
        config,
        store,
        router,
        retrieval,
        dispatcher: Arc::new(dispatcher),
    })
}
