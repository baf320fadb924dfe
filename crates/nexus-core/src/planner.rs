use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use nexus_memory::{Domain, RetrievalCoordinator, CONTEXT_SEPARATOR};
use nexus_schema::ConversationTurn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::{render_history, AgentFactory, LlmAgent};
use crate::extract_json_block;
use crate::handler::agents;
use crate::prompts;

pub const NOTHING_FOUND: &str =
    "I searched the library and our past conversations but found nothing relevant to this question.";

const SYNTHESIZER_AGENT: &str = "SYNTHESIZER";

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub answer: String,
    pub trace: Value,
}

/// Plan, retrieve, synthesize.
#[async_trait]
pub trait DeepAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        query: &str,
        history: &[ConversationTurn],
        categories: &[String],
    ) -> Result<AnalysisOutcome>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchPlan {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub sub_queries: Vec<String>,
    #[serde(default)]
    pub search_in: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl ResearchPlan {
    pub fn fallback(query: &str) -> Self {
        Self {
            thought: String::new(),
            sub_queries: vec![query.to_string()],
            search_in: vec![Domain::Book.as_str().into(), Domain::Memory.as_str().into()],
            categories: Vec::new(),
        }
    }

    /// Parse the planner's reply, falling back to a plain search of books
    /// and memory for the query itself.
    pub fn parse(raw: &str, query: &str) -> Self {
        let plan = extract_json_block(raw).and_then(|v| serde_json::from_value::<Self>(v).ok());
        match plan {
            Some(plan) => plan.normalized(query),
            None => {
                tracing::warn!("planner reply was not a usable plan, using fallback");
                Self::fallback(query)
            }
        }
    }

    /// Deduplicates sub-queries in order and keeps only known domains.
    fn normalized(mut self, query: &str) -> Self {
        let mut seen = std::collections::HashSet::new();
        self.sub_queries = self
            .sub_queries
            .iter()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty() && seen.insert(q.to_lowercase()))
            .map(String::from)
            .collect();
        if self.sub_queries.is_empty() {
            self.sub_queries.push(query.to_string());
        }

        let mut domains = Vec::new();
        for raw in &self.search_in {
            if let Some(domain) = Domain::parse(raw) {
                if !domains.contains(&domain) {
                    domains.push(domain);
                }
            }
        }
        if domains.is_empty() {
            domains = vec![Domain::Book, Domain::Memory];
        }
        self.search_in = domains.iter().map(|d| d.as_str().to_string()).collect();
        self
    }

    pub fn domains(&self) -> Vec<Domain> {
        self.search_in.iter().filter_map(|d| Domain::parse(d)).collect()
    }
}

pub struct Planner {
    planner: LlmAgent,
    synthesizer: LlmAgent,
    retrieval: Arc<RetrievalCoordinator>,
}

impl Planner {
    pub fn new(factory: &AgentFactory, retrieval: Arc<RetrievalCoordinator>) -> Self {
        Self {
            planner: factory.internal(agents::PLANNER, prompts::PLANNER),
            synthesizer: factory.agent(SYNTHESIZER_AGENT, prompts::SYNTHESIZER),
            retrieval,
        }
    }

    /// Never fails: a model error yields the fallback plan with the failure
    /// noted in its thought.
    async fn plan(
        &self,
        query: &str,
        history: &[ConversationTurn],
        categories: &[String],
    ) -> ResearchPlan {
        let listed = if categories.is_empty() {
            "(none)".to_string()
        } else {
            categories.join(", ")
        };
        let system = self.planner.system_prompt().replace("{categories}", &listed);
        let prompt = format!(
            "Recent conversation:\n{}\n\nQuestion: {query}",
            render_history(history)
        );
        match self.planner.ask_with_system(system, prompt).await {
            Ok(raw) => ResearchPlan::parse(&raw, query),
            Err(e) => {
                tracing::warn!("plan generation failed, using fallback plan: {e:#}");
                ResearchPlan {
                    thought: format!("plan generation failed: {e}"),
                    ..ResearchPlan::fallback(query)
                }
            }
        }
    }
}

#[async_trait]
impl DeepAnalyzer for Planner {
    async fn analyze(
        &self,
        query: &str,
        history: &[ConversationTurn],
        categories: &[String],
    ) -> Result<AnalysisOutcome> {
        let plan = self.plan(query, history, categories).await;
        tracing::info!(
            "deep analysis plan: {} sub-queries over {:?}",
            plan.sub_queries.len(),
            plan.search_in
        );

        let found = self
            .retrieval
            .fan_out(&plan.sub_queries, &plan.domains(), &plan.categories)
            .await;

        if found.chunks.is_empty() {
            tracing::info!("deep analysis found nothing for: {query}");
            return Ok(AnalysisOutcome {
                answer: NOTHING_FOUND.to_string(),
                trace: json!({
                    "plan_thought": plan.thought,
                    "plan": plan,
                    "search_logs": found.logs,
                    "retrieved_chunks_count": 0,
                    "final_context_chunks": Vec::<String>::new(),
                }),
            });
        }

        let texts: Vec<String> = found.chunks.iter().map(|c| c.text().to_string()).collect();
        let context = texts.join(CONTEXT_SEPARATOR);
        let prompt = format!(
            "Recent conversation:\n{}\n\nQuestion: {query}\n\nRetrieved passages:\n{context}",
            render_history(history)
        );
        let answer = self.synthesizer.ask(prompt).await?;

        Ok(AnalysisOutcome {
            answer,
            trace: json!({
                "plan_thought": plan.thought,
                "plan": plan,
                "search_logs": found.logs,
                "retrieved_chunks_count": found.candidates,
                "final_context_chunks": texts,
            }),
        })
    }
}
