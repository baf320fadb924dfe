use anyhow::Result;
use async_trait::async_trait;
use nexus_schema::{ClassifierVerdict, ConversationTurn, DispatchOrder, Intent};
use serde_json::Value;

use crate::agent::{render_history, AgentFactory, LlmAgent};
use crate::extract_json_block;
use crate::handler::agents;
use crate::prompts;

/// First-stage routing: answer trivially or name an intent.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, query: &str, history: &[ConversationTurn]) -> Result<ClassifierVerdict>;
}

pub struct LlmClassifier {
    agent: LlmAgent,
}

impl LlmClassifier {
    pub fn new(factory: &AgentFactory) -> Self {
        let intents = Intent::ALL
            .iter()
            .map(|i| format!("- {}", i.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
        let role = prompts::CLASSIFIER.replace("{intents}", &intents);
        Self {
            agent: factory.internal(agents::CLASSIFIER, &role),
        }
    }
}

#[async_trait]
impl IntentClassifier for LlmClassifier {
    async fn classify(&self, query: &str, history: &[ConversationTurn]) -> Result<ClassifierVerdict> {
        let prompt = format!(
            "Recent conversation:\n{}\n\nNew message: {query}",
            render_history(history)
        );
        let raw = self.agent.ask(prompt).await?;
        Ok(parse_verdict(&raw, query))
    }
}

/// Reads the classifier's JSON. Anything unreadable becomes an unrouted order
/// on the original query, which the dispatcher hands to deep analysis.
pub fn parse_verdict(raw: &str, query: &str) -> ClassifierVerdict {
    let fallback = || ClassifierVerdict::Dispatch(DispatchOrder::unrouted(query));

    let Some(value) = extract_json_block(raw) else {
        tracing::warn!("classifier reply was not json, leaving it unrouted");
        return fallback();
    };

    if value.get("type").and_then(Value::as_str) == Some("final_answer") {
        if let Some(content) = value
            .get("content")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
        {
            return ClassifierVerdict::FinalAnswer {
                content: content.to_string(),
            };
        }
    }

    match serde_json::from_value::<DispatchOrder>(value) {
        Ok(order) if !order.intent.trim().is_empty() => ClassifierVerdict::Dispatch(order),
        _ => {
            tracing::warn!("classifier reply had no intent, leaving it unrouted");
            fallback()
        }
    }
}
