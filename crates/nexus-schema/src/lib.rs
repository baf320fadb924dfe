use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SESSION_ID: &str = "default_user";

/// Request intent as labelled by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    PlannerRequest,
    GeneralConversation,
    DeepAnalysisRequest,
    CounselingRequest,
    NewsRequest,
    CodeRequest,
    ImageRequest,
    LibrarianRequest,
    SystemCommand,
    UserStorytelling,
    TimeRequest,
    DateRequest,
    MemoryQuery,
}

impl Intent {
    pub const ALL: [Intent; 13] = [
        Intent::PlannerRequest,
        Intent::GeneralConversation,
        Intent::DeepAnalysisRequest,
        Intent::CounselingRequest,
        Intent::NewsRequest,
        Intent::CodeRequest,
        Intent::ImageRequest,
        Intent::LibrarianRequest,
        Intent::SystemCommand,
        Intent::UserStorytelling,
        Intent::TimeRequest,
        Intent::DateRequest,
        Intent::MemoryQuery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlannerRequest => "PLANNER_REQUEST",
            Self::GeneralConversation => "GENERAL_CONVERSATION",
            Self::DeepAnalysisRequest => "DEEP_ANALYSIS_REQUEST",
            Self::CounselingRequest => "COUNSELING_REQUEST",
            Self::NewsRequest => "NEWS_REQUEST",
            Self::CodeRequest => "CODE_REQUEST",
            Self::ImageRequest => "IMAGE_REQUEST",
            Self::LibrarianRequest => "LIBRARIAN_REQUEST",
            Self::SystemCommand => "SYSTEM_COMMAND",
            Self::UserStorytelling => "USER_STORYTELLING",
            Self::TimeRequest => "TIME_REQUEST",
            Self::DateRequest => "DATE_REQUEST",
            Self::MemoryQuery => "MEMORY_QUERY",
        }
    }

    /// Case-insensitive lookup; unknown labels yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let wanted = raw.trim();
        Self::ALL
            .into_iter()
            .find(|intent| intent.as_str().eq_ignore_ascii_case(wanted))
    }
}

/// Routing decision produced by the first-stage classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOrder {
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub corrected_query: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl DispatchOrder {
    pub fn new(intent: Intent, corrected_query: impl Into<String>) -> Self {
        Self {
            intent: intent.as_str().to_string(),
            corrected_query: Some(corrected_query.into()),
            content: None,
        }
    }

    /// An order with no intent. The dispatcher sends it to deep analysis.
    pub fn unrouted(query: impl Into<String>) -> Self {
        Self {
            intent: String::new(),
            corrected_query: Some(query.into()),
            content: None,
        }
    }

    pub fn parsed_intent(&self) -> Option<Intent> {
        Intent::parse(&self.intent)
    }

    /// The query handlers should work on, falling back to what the user typed.
    pub fn query_or<'a>(&'a self, original: &'a str) -> &'a str {
        match self.corrected_query.as_deref() {
            Some(q) if !q.trim().is_empty() => q,
            _ => original,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClassifierVerdict {
    /// The classifier answered the query itself.
    FinalAnswer { content: String },
    Dispatch(DispatchOrder),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "user" => Self::User,
            _ => Self::Model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub agent_used: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// History row as rendered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub parts: String,
}

impl From<&ConversationTurn> for HistoryEntry {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            role: turn.role.as_str().to_string(),
            parts: turn.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// Terminal output for every query, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResponse {
    pub agent_used: String,
    pub answer: String,
    pub image: Option<ImageInfo>,
    pub history: Option<Vec<HistoryEntry>>,
    pub error: bool,
    pub thought_process: Option<serde_json::Value>,
    pub voice_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub query: String,
    #[serde(alias = "user_id", alias = "session_id", default = "default_session_id")]
    pub session_id: String,
}

fn default_session_id() -> String {
    DEFAULT_SESSION_ID.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    Received,
    Routing,
    Processing,
    DeepAnalysis,
    Formatting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub status: ProgressStatus,
    #[serde(default)]
    pub agent: Option<String>,
    pub detail: String,
}

/// Frames pushed to streaming clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Progress(ProgressUpdate),
    FinalResponse(FinalResponse),
    Error { detail: String },
}
