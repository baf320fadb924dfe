use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use nexus_memory::{RetrievalCoordinator, RetrievedChunk};

use crate::agent::{render_history, AgentFactory, LlmAgent};
use crate::handler::{agents, CallingConvention, Handler, HandlerOutcome, HandlerRequest};
use crate::prompts;

/// Conversational handler: one persona, the recent history, and for the
/// general handler the memory and knowledge-graph hits for the query.
pub struct PersonaHandler {
    name: String,
    agent: LlmAgent,
    enrichment: Option<Arc<RetrievalCoordinator>>,
}

impl PersonaHandler {
    pub fn new(name: impl Into<String>, agent: LlmAgent) -> Self {
        Self {
            name: name.into(),
            agent,
            enrichment: None,
        }
    }

    pub fn with_enrichment(mut self, retrieval: Arc<RetrievalCoordinator>) -> Self {
        self.enrichment = Some(retrieval);
        self
    }

    pub fn general(factory: &AgentFactory, retrieval: Arc<RetrievalCoordinator>) -> Self {
        Self::new(agents::GENERAL, factory.agent(agents::GENERAL, prompts::GENERAL))
            .with_enrichment(retrieval)
    }

    pub fn counselor(factory: &AgentFactory) -> Self {
        Self::new(agents::COUNSELOR, factory.agent(agents::COUNSELOR, prompts::COUNSELOR))
    }

    pub fn coder(factory: &AgentFactory) -> Self {
        Self::new(agents::CODER, factory.agent(agents::CODER, prompts::CODER))
    }

    pub fn listener(factory: &AgentFactory) -> Self {
        Self::new(agents::LISTENER, factory.agent(agents::LISTENER, prompts::LISTENER))
    }

    async fn related_context(&self, query: &str) -> Option<String> {
        let retrieval = self.enrichment.as_ref()?;
        let settings = retrieval.settings();
        let (memories, knowledge) = tokio::join!(
            retrieval.search_memory(query, settings.memory_k),
            retrieval.search_graph(query, settings.graph_k),
        );

        let mut sections = Vec::new();
        if !memories.is_empty() {
            sections.push(format!("Related memories:\n{}", bullets(&memories)));
        }
        if !knowledge.is_empty() {
            sections.push(format!("Related knowledge:\n{}", bullets(&knowledge)));
        }
        (!sections.is_empty()).then(|| sections.join("\n\n"))
    }
}

fn bullets(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|c| format!("- {}", c.text()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Handler for PersonaHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn convention(&self) -> CallingConvention {
        CallingConvention::Contextual
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerOutcome> {
        let mut prompt = format!("Recent conversation:\n{}", render_history(&request.history));
        if let Some(context) = self.related_context(&request.query).await {
            prompt.push_str("\n\n");
            prompt.push_str(&context);
        }
        prompt.push_str(&format!("\n\nUser: {}", request.query));
        Ok(HandlerOutcome::Answer(self.agent.ask(prompt).await?))
    }
}
