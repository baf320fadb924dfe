use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use nexus_memory::{ConversationStore, RetrievalCoordinator, NO_PREVIOUS_QUERY};
use nexus_provider::ProviderError;
use nexus_schema::{
    ClassifierVerdict, FinalResponse, HistoryEntry, ImageInfo, ProgressStatus, ProgressUpdate,
    Role,
};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::classifier::IntentClassifier;
use crate::formatter::{ApologyWriter, ResponseFormatter};
use crate::handler::{agents, CallingConvention, Handler, HandlerOutcome, HandlerRequest, IntentTable};
use crate::pending::PendingTaskStore;
use crate::planner::DeepAnalyzer;

pub type ProgressSender = mpsc::UnboundedSender<ProgressUpdate>;

/// Agents whose drafts get a formatting pass.
pub const FORMATTED_AGENTS: &[&str] = &[
    agents::PLANNER,
    agents::NEWS,
    agents::OFFER,
    agents::GENERAL,
    agents::LISTENER,
    agents::MEMORY_QUERY,
];

pub const IMAGE_FOUND: &str = "Here's the image I found for you.";
pub const SYSTEM_ERROR: &str =
    "Sorry, something went wrong on my side and I couldn't answer. Please try again in a moment.";

const DEFAULT_HISTORY_WINDOW: usize = 15;
const DEFAULT_CONTEXT_TURNS: usize = 4;

/// An answer on its way to `finalize`.
#[derive(Debug, Clone)]
struct Draft {
    agent: String,
    answer: String,
    image: Option<ImageInfo>,
    thought_process: Option<Value>,
}

impl Draft {
    fn answer(agent: &str, answer: String) -> Self {
        Self {
            agent: agent.to_string(),
            answer,
            image: None,
            thought_process: None,
        }
    }

    fn with_trace(mut self, trace: Value) -> Self {
        self.thought_process = Some(trace);
        self
    }
}

pub struct DispatcherBuilder {
    store: ConversationStore,
    classifier: Arc<dyn IntentClassifier>,
    analyzer: Arc<dyn DeepAnalyzer>,
    pending: Arc<PendingTaskStore>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    intents: IntentTable,
    formatter: Option<Arc<dyn ResponseFormatter>>,
    apology: Option<Arc<dyn ApologyWriter>>,
    retrieval: Option<Arc<RetrievalCoordinator>>,
    history_window: usize,
    context_turns: usize,
}

impl DispatcherBuilder {
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    pub fn intents(mut self, intents: IntentTable) -> Self {
        self.intents = intents;
        self
    }

    pub fn pending(mut self, pending: Arc<PendingTaskStore>) -> Self {
        self.pending = pending;
        self
    }

    pub fn formatter(mut self, formatter: Arc<dyn ResponseFormatter>) -> Self {
        self.formatter = Some(formatter);
        self
    }

    pub fn apology(mut self, apology: Arc<dyn ApologyWriter>) -> Self {
        self.apology = Some(apology);
        self
    }

    pub fn retrieval(mut self, retrieval: Arc<RetrievalCoordinator>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn history_window(mut self, turns: usize) -> Self {
        self.history_window = turns;
        self
    }

    pub fn context_turns(mut self, turns: usize) -> Self {
        self.context_turns = turns;
        self
    }

    pub fn build(self) -> Dispatcher {
        tracing::info!(
            "dispatcher ready with {} handlers: {:?}",
            self.handlers.len(),
            self.handlers.keys().collect::<Vec<_>>()
        );
        Dispatcher {
            store: self.store,
            classifier: self.classifier,
            analyzer: self.analyzer,
            pending: self.pending,
            handlers: self.handlers,
            intents: self.intents,
            formatter: self.formatter,
            apology: self.apology,
            retrieval: self.retrieval,
            history_window: self.history_window,
            context_turns: self.context_turns,
        }
    }
}

/// Routes each query to one handler and always produces a `FinalResponse`.
pub struct Dispatcher {
    store: ConversationStore,
    classifier: Arc<dyn IntentClassifier>,
    analyzer: Arc<dyn DeepAnalyzer>,
    pending: Arc<PendingTaskStore>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    intents: IntentTable,
    formatter: Option<Arc<dyn ResponseFormatter>>,
    apology: Option<Arc<dyn ApologyWriter>>,
    retrieval: Option<Arc<RetrievalCoordinator>>,
    history_window: usize,
    context_turns: usize,
}

fn emit(progress: Option<&ProgressSender>, status: ProgressStatus, agent: Option<&str>, detail: String) {
    if let Some(tx) = progress {
        let _ = tx.send(ProgressUpdate {
            status,
            agent: agent.map(String::from),
            detail,
        });
    }
}

/// A user-safe description of what failed; raw error text stays in the logs.
fn describe_failure(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<ProviderError>() {
        Some(e) if e.is_exhausted() => "every model credential is temporarily unavailable",
        Some(_) => "the language model service did not respond properly",
        None => "an internal processing step failed",
    }
}

impl Dispatcher {
    pub fn builder(
        store: ConversationStore,
        classifier: Arc<dyn IntentClassifier>,
        analyzer: Arc<dyn DeepAnalyzer>,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            store,
            classifier,
            analyzer,
            pending: Arc::new(PendingTaskStore::default()),
            handlers: HashMap::new(),
            intents: IntentTable::default(),
            formatter: None,
            apology: None,
            retrieval: None,
            history_window: DEFAULT_HISTORY_WINDOW,
            context_turns: DEFAULT_CONTEXT_TURNS,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn pending(&self) -> &Arc<PendingTaskStore> {
        &self.pending
    }

    pub async fn handle_query(&self, query: &str, session_id: &str) -> FinalResponse {
        self.handle_query_with_progress(query, session_id, None).await
    }

    pub async fn handle_query_with_progress(
        &self,
        query: &str,
        session_id: &str,
        progress: Option<&ProgressSender>,
    ) -> FinalResponse {
        emit(progress, ProgressStatus::Received, None, "query received".to_string());

        let outcome = match self
            .store
            .add_turn(session_id, Role::User, query, Some("USER"))
            .await
        {
            Ok(_) => self.route(query, session_id, progress).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(draft) => self.finalize(draft, session_id, false, progress).await,
            Err(err) => {
                let draft = self.recover(&err, session_id).await;
                self.finalize(draft, session_id, true, progress).await
            }
        }
    }

    async fn route(
        &self,
        query: &str,
        session_id: &str,
        progress: Option<&ProgressSender>,
    ) -> Result<Draft> {
        if let Some(original) = self.pending.check_and_clear(session_id, query).await {
            tracing::info!("session {session_id} accepted deep analysis for: {original}");
            return self.deep_analysis(&original, session_id, progress).await;
        }

        let context = self.store.last_n_turns(session_id, self.context_turns).await?;
        let order = match self.classifier.classify(query, &context).await {
            Ok(ClassifierVerdict::FinalAnswer { content }) => {
                tracing::info!("classifier answered directly");
                return Ok(Draft::answer(agents::QUICK_RESPONSE, content));
            }
            Ok(ClassifierVerdict::Dispatch(order)) => order,
            Err(e) => {
                tracing::warn!("classifier failed, falling back to deep analysis: {e:#}");
                return self.deep_analysis(query, session_id, progress).await;
            }
        };

        emit(
            progress,
            ProgressStatus::Routing,
            Some(agents::CLASSIFIER),
            format!("intent classified as '{}'", order.intent),
        );
        let corrected = order.query_or(query).to_string();

        let Some(agent_name) = order.parsed_intent().and_then(|i| self.intents.agent_for(i)) else {
            tracing::info!("unrouted intent '{}', falling back to deep analysis", order.intent);
            return self.deep_analysis(&corrected, session_id, progress).await;
        };
        if agent_name == agents::PLANNER {
            return self.deep_analysis(&corrected, session_id, progress).await;
        }
        let Some(handler) = self.handlers.get(agent_name) else {
            tracing::warn!("no handler registered for {agent_name}, falling back to deep analysis");
            return self.deep_analysis(&corrected, session_id, progress).await;
        };

        tracing::info!("routing intent '{}' to {agent_name}", order.intent);
        emit(
            progress,
            ProgressStatus::Processing,
            Some(agent_name),
            format!("handing the request to {agent_name}"),
        );

        let history = match handler.convention() {
            CallingConvention::Contextual => context,
            CallingConvention::Utility => Vec::new(),
        };
        let request = HandlerRequest {
            query: corrected.clone(),
            session_id: session_id.to_string(),
            history,
        };

        match handler.handle(&request).await? {
            HandlerOutcome::Answer(answer) => Ok(Draft::answer(handler.name(), answer)),
            HandlerOutcome::ThoughtfulAnswer { answer, trace } => {
                Ok(Draft::answer(handler.name(), answer).with_trace(trace))
            }
            HandlerOutcome::Image(image) => Ok(Draft {
                agent: handler.name().to_string(),
                answer: IMAGE_FOUND.to_string(),
                image: Some(image),
                thought_process: None,
            }),
            HandlerOutcome::Offer {
                content,
                original_query,
            } => {
                self.pending.set_pending(session_id, &original_query).await;
                Ok(Draft::answer(agents::OFFER, content))
            }
            HandlerOutcome::Declined => {
                tracing::info!("{agent_name} declined, falling back to deep analysis");
                self.deep_analysis(&corrected, session_id, progress).await
            }
        }
    }

    async fn deep_analysis(
        &self,
        query: &str,
        session_id: &str,
        progress: Option<&ProgressSender>,
    ) -> Result<Draft> {
        emit(
            progress,
            ProgressStatus::DeepAnalysis,
            Some(agents::PLANNER),
            "starting deep analysis".to_string(),
        );
        let history = self.store.last_n_turns(session_id, self.history_window).await?;
        let categories = self
            .retrieval
            .as_ref()
            .map(|r| r.list_available_categories())
            .unwrap_or_default();

        let outcome = self.analyzer.analyze(query, &history, &categories).await?;
        Ok(Draft::answer(agents::PLANNER, outcome.answer).with_trace(outcome.trace))
    }

    async fn recover(&self, err: &anyhow::Error, session_id: &str) -> Draft {
        tracing::error!("dispatcher failed for session {session_id}: {err:#}");

        if let Some(apology) = &self.apology {
            let last_query = self
                .store
                .last_user_query(session_id)
                .await
                .unwrap_or_else(|_| NO_PREVIOUS_QUERY.to_string());
            match apology.apologize(&last_query, describe_failure(err)).await {
                Ok(text) if !text.trim().is_empty() => {
                    return Draft::answer(agents::APOLOGY, text);
                }
                Ok(_) => tracing::warn!("apology writer returned nothing"),
                Err(e) => tracing::error!("apology writer failed: {e:#}"),
            }
        }

        Draft::answer(agents::DISPATCHER_ERROR, SYSTEM_ERROR.to_string())
    }

    /// Formats when eligible, persists the model turn and attaches the
    /// display history. Never fails.
    async fn finalize(
        &self,
        draft: Draft,
        session_id: &str,
        is_error: bool,
        progress: Option<&ProgressSender>,
    ) -> FinalResponse {
        let mut answer = draft.answer;

        let eligible = !is_error
            && !answer.trim().is_empty()
            && FORMATTED_AGENTS.contains(&draft.agent.as_str());
        if let (true, Some(formatter)) = (eligible, &self.formatter) {
            emit(
                progress,
                ProgressStatus::Formatting,
                Some(agents::FORMATTER),
                "formatting the final answer".to_string(),
            );
            let original = self
                .store
                .last_user_query(session_id)
                .await
                .unwrap_or_else(|_| NO_PREVIOUS_QUERY.to_string());
            let history = self
                .store
                .last_n_turns(session_id, self.context_turns)
                .await
                .unwrap_or_default();
            match formatter.format(&original, &history, &answer).await {
                Ok(formatted) if !formatted.trim().is_empty() => answer = formatted,
                Ok(_) => tracing::warn!("formatter returned nothing, keeping draft from {}", draft.agent),
                Err(e) => tracing::warn!("formatter failed, keeping draft from {}: {e:#}", draft.agent),
            }
        }

        if let Err(e) = self
            .store
            .add_turn(session_id, Role::Model, &answer, Some(draft.agent.as_str()))
            .await
        {
            tracing::error!("failed to persist answer for session {session_id}: {e:#}");
        }

        let history = match self.store.last_n_turns(session_id, self.history_window).await {
            Ok(turns) => Some(turns.iter().map(HistoryEntry::from).collect()),
            Err(e) => {
                tracing::warn!("failed to load history for session {session_id}: {e:#}");
                None
            }
        };

        FinalResponse {
            agent_used: draft.agent,
            answer,
            image: draft.image,
            history,
            error: is_error,
            thought_process: draft.thought_process,
            voice_url: None,
        }
    }
}
