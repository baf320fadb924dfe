use anyhow::Result;
use async_trait::async_trait;
use nexus_schema::ConversationTurn;

use crate::agent::{render_history, AgentFactory, LlmAgent};
use crate::handler::agents;
use crate::prompts;

/// Final editing pass over a draft answer.
#[async_trait]
pub trait ResponseFormatter: Send + Sync {
    async fn format(
        &self,
        original_query: &str,
        history: &[ConversationTurn],
        draft: &str,
    ) -> Result<String>;
}

/// Turns an internal failure into something that can be shown to the user.
#[async_trait]
pub trait ApologyWriter: Send + Sync {
    async fn apologize(&self, last_query: &str, error_description: &str) -> Result<String>;
}

pub struct LlmFormatter {
    agent: LlmAgent,
}

impl LlmFormatter {
    pub fn new(factory: &AgentFactory) -> Self {
        Self {
            agent: factory.agent(agents::FORMATTER, prompts::FORMATTER),
        }
    }
}

#[async_trait]
impl ResponseFormatter for LlmFormatter {
    async fn format(
        &self,
        original_query: &str,
        history: &[ConversationTurn],
        draft: &str,
    ) -> Result<String> {
        let prompt = format!(
            "Recent conversation:\n{}\n\nUser question: {original_query}\n\nDraft to review:\n{draft}",
            render_history(history)
        );
        let formatted = self.agent.ask(prompt).await?;
        if formatted.is_empty() {
            tracing::warn!("formatter returned nothing, keeping the draft");
            return Ok(draft.to_string());
        }
        Ok(formatted)
    }
}

pub struct LlmApology {
    agent: LlmAgent,
}

impl LlmApology {
    pub fn new(factory: &AgentFactory) -> Self {
        Self {
            agent: factory.agent(agents::APOLOGY, prompts::APOLOGY),
        }
    }
}

#[async_trait]
impl ApologyWriter for LlmApology {
    async fn apologize(&self, last_query: &str, error_description: &str) -> Result<String> {
        let prompt = format!("The user asked: {last_query}\nWhat happened: {error_description}");
        self.agent.ask(prompt).await
    }
}
