use anyhow::Result;
use async_trait::async_trait;
use nexus_memory::ConversationStore;

use crate::agent::{render_history, AgentFactory, LlmAgent};
use crate::handler::{agents, Handler, HandlerOutcome, HandlerRequest};
use crate::prompts;

const TRIAGE_AGENT: &str = "MEMORY_TRIAGE";
const RECENT_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryQuestion {
    FirstMemory,
    Stats,
    RecentSummary,
}

impl MemoryQuestion {
    /// First label found in the triage reply; `NONE` or anything else is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.to_uppercase();
        [
            ("RECALL_FIRST_MEMORY", Self::FirstMemory),
            ("CALCULATE_STATS", Self::Stats),
            ("SUMMARIZE_RECENT", Self::RecentSummary),
        ]
        .into_iter()
        .filter_map(|(label, q)| upper.find(label).map(|pos| (pos, q)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, q)| q)
    }
}

/// Questions about the conversation itself: what was said first, how much,
/// what was discussed lately.
pub struct MemoryQueryHandler {
    store: ConversationStore,
    triage: LlmAgent,
    writer: LlmAgent,
}

impl MemoryQueryHandler {
    pub fn new(factory: &AgentFactory, store: ConversationStore) -> Self {
        Self {
            store,
            triage: factory.internal(TRIAGE_AGENT, prompts::MEMORY_TRIAGE),
            writer: factory.agent(agents::MEMORY_QUERY, prompts::MEMORY_ANSWER),
        }
    }

    async fn gather(&self, question: MemoryQuestion, session_id: &str) -> Result<Option<String>> {
        let data = match question {
            MemoryQuestion::FirstMemory => match self.store.first_user_turn(session_id).await? {
                Some(turn) => Some(format!(
                    "First user message, sent {}: \"{}\"",
                    turn.timestamp.format("%Y-%m-%d %H:%M UTC"),
                    turn.content
                )),
                None => None,
            },
            MemoryQuestion::Stats => {
                let stats = self.store.conversation_stats(session_id).await?;
                let since = stats
                    .first_message_at
                    .map(|t| t.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Some(format!(
                    "Total messages: {}\nFrom the user: {}\nFrom the assistant: {}\nFirst message on: {since}",
                    stats.total_messages, stats.user_messages, stats.model_messages
                ))
            }
            MemoryQuestion::RecentSummary => {
                let turns = self.store.turns_since(session_id, RECENT_HOURS).await?;
                (!turns.is_empty()).then(|| {
                    format!(
                        "Conversation in the last {RECENT_HOURS} hours:\n{}",
                        render_history(&turns)
                    )
                })
            }
        };
        Ok(data)
    }
}

#[async_trait]
impl Handler for MemoryQueryHandler {
    fn name(&self) -> &str {
        agents::MEMORY_QUERY
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerOutcome> {
        let label = self.triage.ask(request.query.clone()).await?;
        let Some(question) = MemoryQuestion::parse(&label) else {
            tracing::debug!("memory triage found no match: {label}");
            return Ok(HandlerOutcome::Declined);
        };

        let data = self
            .gather(question, &request.session_id)
            .await?
            .unwrap_or_else(|| "No matching conversation history was found.".to_string());
        let prompt = format!("Data:\n{data}\n\nQuestion: {}", request.query);
        Ok(HandlerOutcome::Answer(self.writer.ask(prompt).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triage_label_parsing() {
        assert_eq!(
            MemoryQuestion::parse("calculate_stats"),
            Some(MemoryQuestion::Stats)
        );
        assert_eq!(
            MemoryQuestion::parse("Label: SUMMARIZE_RECENT (then maybe CALCULATE_STATS)"),
            Some(MemoryQuestion::RecentSummary)
        );
        assert_eq!(MemoryQuestion::parse("NONE"), None);
    }
}
