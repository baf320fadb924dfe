use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use nexus_memory::RetrievalCoordinator;
use serde_json::json;

use crate::agent::{AgentFactory, LlmAgent};
use crate::handler::{agents, Handler, HandlerOutcome, HandlerRequest};
use crate::prompts;

pub const NO_NEWS: &str = "I couldn't find any news about that in today's collection.";

pub struct NewsHandler {
    retrieval: Arc<RetrievalCoordinator>,
    agent: LlmAgent,
}

impl NewsHandler {
    pub fn new(factory: &AgentFactory, retrieval: Arc<RetrievalCoordinator>) -> Self {
        Self {
            retrieval,
            agent: factory.agent(agents::NEWS, prompts::NEWS),
        }
    }
}

#[async_trait]
impl Handler for NewsHandler {
    fn name(&self) -> &str {
        agents::NEWS
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerOutcome> {
        let k = self.retrieval.settings().news_k;
        let found = self.retrieval.search_news(&request.query, k).await;
        let mut steps = vec![format!("searched news for '{}'", request.query)];

        if found.articles.is_empty() {
            steps.push("no articles found".to_string());
            return Ok(HandlerOutcome::ThoughtfulAnswer {
                answer: NO_NEWS.to_string(),
                trace: json!({ "steps": steps, "articles_found": 0 }),
            });
        }

        let titles: Vec<String> = found
            .articles
            .iter()
            .filter_map(|a| a.record.field("title"))
            .collect();
        steps.push(format!("found {} articles", found.articles.len()));

        let prompt = format!("Articles:\n{}\n\nRequest: {}", found.context, request.query);
        let answer = self.agent.ask(prompt).await?;
        steps.push("summarized articles".to_string());

        Ok(HandlerOutcome::ThoughtfulAnswer {
            answer,
            trace: json!({
                "steps": steps,
                "articles_found": found.articles.len(),
                "titles": titles,
            }),
        })
    }
}
