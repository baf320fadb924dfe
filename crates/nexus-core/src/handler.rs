use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use nexus_schema::{ConversationTurn, ImageInfo, Intent};

/// Agent names as they appear in `FinalResponse::agent_used`.
pub mod agents {
    pub const CLASSIFIER: &str = "FENG";
    pub const QUICK_RESPONSE: &str = "FENG_QUICK_RESPONSE";
    pub const PLANNER: &str = "PLANNER";
    pub const GENERAL: &str = "GENERAL_HANDLER";
    pub const OFFER_HANDLER: &str = "PROACTIVE_OFFER_HANDLER";
    pub const OFFER: &str = "PROACTIVE_OFFER";
    pub const COUNSELOR: &str = "COUNSELOR";
    pub const NEWS: &str = "NEWS";
    pub const CODER: &str = "CODER";
    pub const IMAGE: &str = "IMAGE";
    pub const LIBRARIAN: &str = "LIBRARIAN";
    pub const SYSTEM: &str = "SYSTEM";
    pub const LISTENER: &str = "LISTENER";
    pub const REPORTER: &str = "REPORTER";
    pub const MEMORY_QUERY: &str = "MEMORY_QUERY";
    pub const FORMATTER: &str = "FORMATTER";
    pub const APOLOGY: &str = "APOLOGY_HANDLER";
    pub const DISPATCHER_ERROR: &str = "DISPATCHER_ERROR";
}

/// What a handler produced. `Declined` sends the query on to deep analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Answer(String),
    ThoughtfulAnswer {
        answer: String,
        trace: serde_json::Value,
    },
    Image(ImageInfo),
    Offer {
        content: String,
        original_query: String,
    },
    Declined,
}

/// Which inputs a handler is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// Query plus the recent conversation window.
    Contextual,
    /// Query only.
    Utility,
}

#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub query: String,
    pub session_id: String,
    /// Empty for utility handlers.
    pub history: Vec<ConversationTurn>,
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Name used for routing and reported as `agent_used`.
    fn name(&self) -> &str;

    fn convention(&self) -> CallingConvention {
        CallingConvention::Utility
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerOutcome>;
}

/// Intent to handler-name routing.
#[derive(Debug, Clone)]
pub struct IntentTable {
    routes: HashMap<Intent, String>,
}

impl Default for IntentTable {
    fn default() -> Self {
        let routes = [
            (Intent::PlannerRequest, agents::PLANNER),
            (Intent::GeneralConversation, agents::GENERAL),
            (Intent::DeepAnalysisRequest, agents::OFFER_HANDLER),
            (Intent::CounselingRequest, agents::COUNSELOR),
            (Intent::NewsRequest, agents::NEWS),
            (Intent::CodeRequest, agents::CODER),
            (Intent::ImageRequest, agents::IMAGE),
            (Intent::LibrarianRequest, agents::LIBRARIAN),
            (Intent::SystemCommand, agents::SYSTEM),
            (Intent::UserStorytelling, agents::LISTENER),
            (Intent::TimeRequest, agents::REPORTER),
            (Intent::DateRequest, agents::REPORTER),
            (Intent::MemoryQuery, agents::MEMORY_QUERY),
        ]
        .into_iter()
        .map(|(intent, agent)| (intent, agent.to_string()))
        .collect();
        Self { routes }
    }
}

impl IntentTable {
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn with_route(mut self, intent: Intent, agent: impl Into<String>) -> Self {
        self.routes.insert(intent, agent.into());
        self
    }

    pub fn agent_for(&self, intent: Intent) -> Option<&str> {
        self.routes.get(&intent).map(String::as_str)
    }
}
