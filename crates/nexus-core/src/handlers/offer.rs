use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use nexus_memory::RetrievalCoordinator;

use crate::agent::{AgentFactory, LlmAgent};
use crate::handler::{agents, Handler, HandlerOutcome, HandlerRequest};
use crate::prompts;

const PREVIEW_PASSAGES: usize = 3;

/// Gives a short first answer and offers a full deep analysis. The
/// dispatcher parks the query until the user replies.
pub struct OfferHandler {
    retrieval: Arc<RetrievalCoordinator>,
    agent: LlmAgent,
}

impl OfferHandler {
    pub fn new(factory: &AgentFactory, retrieval: Arc<RetrievalCoordinator>) -> Self {
        Self {
            retrieval,
            agent: factory.agent(agents::OFFER_HANDLER, prompts::OFFER),
        }
    }
}

#[async_trait]
impl Handler for OfferHandler {
    fn name(&self) -> &str {
        agents::OFFER_HANDLER
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerOutcome> {
        let settings = self.retrieval.settings();
        let preview = self
            .retrieval
            .search_books(&request.query, &[], settings.book_retrieval_k, PREVIEW_PASSAGES)
            .await;
        let passages = if preview.context.is_empty() {
            "(no passages found)".to_string()
        } else {
            preview.context
        };

        let prompt = format!("Passages:\n{passages}\n\nQuestion: {}", request.query);
        let content = self.agent.ask(prompt).await?;
        Ok(HandlerOutcome::Offer {
            content,
            original_query: request.query.clone(),
        })
    }
}
