use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use nexus_core::handlers::ReporterHandler;
use nexus_core::{
    agents, AgentFactory, AgentsConfig, AnalysisOutcome, ApologyWriter, CallingConvention,
    DeepAnalyzer, Dispatcher, Handler, HandlerOutcome, HandlerRequest, IntentClassifier,
    LlmRouter, ModelTarget, Planner, ResponseFormatter, IMAGE_FOUND, NOTHING_FOUND, SYSTEM_ERROR,
};
use nexus_memory::{ConversationStore, LexicalReranker, RetrievalCoordinator, RetrievalSettings, StubEmbeddingProvider};
use nexus_provider::{
    Credential, CredentialPool, LlmProvider, LlmRequest, LlmResponse, PoolOptions, ProviderError,
};
use nexus_schema::{
    ClassifierVerdict, ConversationTurn, DispatchOrder, ImageInfo, Intent, ProgressStatus, Role,
};
use serde_json::json;

struct ScriptedClassifier {
    verdicts: Mutex<VecDeque<ClassifierVerdict>>,
    calls: AtomicUsize,
    seen_history: Mutex<Vec<usize>>,
}

impl ScriptedClassifier {
    fn new(verdicts: Vec<ClassifierVerdict>) -> Arc<Self> {
        Arc::new(Self {
            verdicts: Mutex::new(verdicts.into()),
            calls: AtomicUsize::new(0),
            seen_history: Mutex::new(Vec::new()),
        })
    }

    fn intent(intent: Intent, query: &str) -> ClassifierVerdict {
        ClassifierVerdict::Dispatch(DispatchOrder::new(intent, query))
    }
}

#[async_trait]
impl IntentClassifier for ScriptedClassifier {
    async fn classify(&self, _query: &str, history: &[ConversationTurn]) -> Result<ClassifierVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_history.lock().unwrap().push(history.len());
        self.verdicts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("classifier script exhausted"))
    }
}

struct RecordingAnalyzer {
    queries: Mutex<Vec<String>>,
}

impl RecordingAnalyzer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queries: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DeepAnalyzer for RecordingAnalyzer {
    async fn analyze(
        &self,
        query: &str,
        _history: &[ConversationTurn],
        _categories: &[String],
    ) -> Result<AnalysisOutcome> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(AnalysisOutcome {
            answer: format!("analysis of {query}"),
            trace: json!({ "retrieved_chunks_count": 1 }),
        })
    }
}

type Behaviour = Box<dyn Fn(&HandlerRequest) -> Result<HandlerOutcome> + Send + Sync>;

struct FakeHandler {
    name: &'static str,
    convention: CallingConvention,
    behaviour: Behaviour,
    seen: Mutex<Vec<HandlerRequest>>,
}

impl FakeHandler {
    fn new(
        name: &'static str,
        convention: CallingConvention,
        behaviour: impl Fn(&HandlerRequest) -> Result<HandlerOutcome> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            convention,
            behaviour: Box::new(behaviour),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Handler for FakeHandler {
    fn name(&self) -> &str {
        self.name
    }

    fn convention(&self) -> CallingConvention {
        self.convention
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerOutcome> {
        self.seen.lock().unwrap().push(request.clone());
        (self.behaviour)(request)
    }
}

struct ScriptedApology {
    reply: Option<&'static str>,
    seen: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ApologyWriter for ScriptedApology {
    async fn apologize(&self, last_query: &str, error_description: &str) -> Result<String> {
        self.seen
            .lock()
            .unwrap()
            .push((last_query.to_string(), error_description.to_string()));
        self.reply
            .map(String::from)
            .ok_or_else(|| anyhow!("apology model down"))
    }
}

struct BracketFormatter {
    fail: bool,
}

#[async_trait]
impl ResponseFormatter for BracketFormatter {
    async fn format(&self, _query: &str, _history: &[ConversationTurn], draft: &str) -> Result<String> {
        if self.fail {
            Err(anyhow!("formatter unavailable"))
        } else {
            Ok(format!("[{draft}]"))
        }
    }
}

fn store() -> ConversationStore {
    ConversationStore::open_in_memory().unwrap()
}

async fn user_turns(store: &ConversationStore, session: &str) -> Vec<String> {
    store
        .last_n_turns(session, 50)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.role == Role::User)
        .map(|t| t.content)
        .collect()
}

#[tokio::test]
async fn scenario_a_time_query_is_answered_by_reporter() {
    let store = store();
    let classifier = ScriptedClassifier::new(vec![ScriptedClassifier::intent(
        Intent::TimeRequest,
        "what time is it",
    )]);
    let now = NaiveDate::from_ymd_opt(2025, 3, 1)
        .unwrap()
        .and_hms_opt(14, 30, 0)
        .unwrap();
    let dispatcher = Dispatcher::builder(store.clone(), classifier, RecordingAnalyzer::new())
        .formatter(Arc::new(BracketFormatter { fail: false }))
        .handler(Arc::new(ReporterHandler::new(vec![]).with_now(now)))
        .build();

    let resp = dispatcher.handle_query("wat time is it", "s1").await;

    assert_eq!(resp.agent_used, agents::REPORTER);
    // reporter is not in the formatting allowlist
    assert_eq!(resp.answer, "It's 14:30 right now.");
    assert!(!resp.error);
    assert!(resp.thought_process.is_none());
    assert!(resp.voice_url.is_none());

    let history = resp.history.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, "user");
    assert_eq!(history[0].parts, "wat time is it");
    assert_eq!(history[1].role, "model");
}

#[tokio::test]
async fn scenario_b_deep_analysis_with_no_candidates() {
    struct PlanProvider;

    #[async_trait]
    impl LlmProvider for PlanProvider {
        fn name(&self) -> &str {
            "plan"
        }

        async fn chat(
            &self,
            _credential: &Credential,
            _request: LlmRequest,
        ) -> std::result::Result<LlmResponse, ProviderError> {
            Ok(LlmResponse::text(
                r#"```json
{"thought": "look in books", "sub_queries": ["fall of rome", "fall of rome"], "search_in": ["book", "memory"], "categories": []}
```"#,
            ))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let retrieval = Arc::new(RetrievalCoordinator::load(
        dir.path(),
        Arc::new(StubEmbeddingProvider::new(8)),
        Arc::new(LexicalReranker),
        RetrievalSettings::default(),
    ));
    let mut router = LlmRouter::new();
    router.register_pool(
        "primary",
        Arc::new(PlanProvider),
        Arc::new(CredentialPool::from_keys("primary", ["k1"], PoolOptions::default())),
    );
    let factory = AgentFactory::new(
        Arc::new(router),
        AgentsConfig {
            default: ModelTarget::new("primary", "m"),
            overrides: Default::default(),
        },
        None,
    );
    let planner = Arc::new(Planner::new(&factory, Arc::clone(&retrieval)));

    let store = store();
    let classifier = ScriptedClassifier::new(vec![ScriptedClassifier::intent(
        Intent::PlannerRequest,
        "why did rome fall",
    )]);
    let dispatcher = Dispatcher::builder(store.clone(), classifier, planner)
        .retrieval(retrieval)
        .build();

    let resp = dispatcher.handle_query("why did rome fall", "s1").await;

    assert_eq!(resp.agent_used, agents::PLANNER);
    assert_eq!(resp.answer, NOTHING_FOUND);
    assert!(!resp.error);
    let trace = resp.thought_process.unwrap();
    assert_eq!(trace["retrieved_chunks_count"], 0);
    assert_eq!(trace["plan_thought"], "look in books");
    assert_eq!(trace["plan"]["sub_queries"], json!(["fall of rome"]));
    assert_eq!(trace["final_context_chunks"], json!([]));
}

#[tokio::test]
async fn scenario_c_handler_error_becomes_apology() {
    let store = store();
    let classifier = ScriptedClassifier::new(vec![ScriptedClassifier::intent(
        Intent::CodeRequest,
        "fix my loop",
    )]);
    let apology = Arc::new(ScriptedApology {
        reply: Some("Sorry, I couldn't help with your loop just now."),
        seen: Mutex::new(Vec::new()),
    });
    let dispatcher = Dispatcher::builder(store.clone(), classifier, RecordingAnalyzer::new())
        .formatter(Arc::new(BracketFormatter { fail: false }))
        .apology(apology.clone())
        .handler(FakeHandler::new(agents::CODER, CallingConvention::Contextual, |_| {
            Err(anyhow!("secret stack trace: connection reset by peer"))
        }))
        .build();

    let resp = dispatcher.handle_query("fix my loop", "s1").await;

    assert_eq!(resp.agent_used, agents::APOLOGY);
    assert!(resp.error);
    assert_eq!(resp.answer, "Sorry, I couldn't help with your loop just now.");
    assert!(!resp.answer.contains("secret"));

    let seen = apology.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "fix my loop");
    assert!(!seen[0].1.contains("secret"));

    assert_eq!(user_turns(&store, "s1").await, vec!["fix my loop"]);
    let last = store.last_n_turns("s1", 1).await.unwrap();
    assert_eq!(last[0].agent_used.as_deref(), Some(agents::APOLOGY));
}

#[tokio::test]
async fn failing_or_missing_apology_gives_dispatcher_error() {
    for apology in [
        Some(Arc::new(ScriptedApology {
            reply: None,
            seen: Mutex::new(Vec::new()),
        })),
        None,
    ] {
        let store = store();
        let classifier =
            ScriptedClassifier::new(vec![ScriptedClassifier::intent(Intent::CodeRequest, "hello?")]);
        let mut builder = Dispatcher::builder(store.clone(), classifier, RecordingAnalyzer::new())
            .handler(FakeHandler::new(agents::CODER, CallingConvention::Contextual, |_| {
                Err(anyhow!("coder crashed"))
            }));
        if let Some(apology) = apology {
            builder = builder.apology(apology);
        }
        let dispatcher = builder.build();

        let resp = dispatcher.handle_query("hello?", "s1").await;
        assert_eq!(resp.agent_used, agents::DISPATCHER_ERROR);
        assert_eq!(resp.answer, SYSTEM_ERROR);
        assert!(resp.error);
        assert_eq!(user_turns(&store, "s1").await, vec!["hello?"]);
    }
}

#[tokio::test]
async fn classifier_failure_falls_back_to_deep_analysis() {
    struct DownClassifier;

    #[async_trait]
    impl IntentClassifier for DownClassifier {
        async fn classify(&self, _query: &str, _history: &[ConversationTurn]) -> Result<ClassifierVerdict> {
            Err(ProviderError::Timeout {
                provider: "gemini".into(),
            }
            .into())
        }
    }

    let store = store();
    let analyzer = RecordingAnalyzer::new();
    let apology = Arc::new(ScriptedApology {
        reply: Some("sorry"),
        seen: Mutex::new(Vec::new()),
    });
    let dispatcher = Dispatcher::builder(store.clone(), Arc::new(DownClassifier), analyzer.clone())
        .apology(apology.clone())
        .build();

    let resp = dispatcher.handle_query("why did rome fall", "s1").await;

    assert_eq!(resp.agent_used, agents::PLANNER);
    assert!(!resp.error);
    assert_eq!(resp.answer, "analysis of why did rome fall");
    assert_eq!(
        analyzer.queries.lock().unwrap().clone(),
        vec!["why did rome fall"]
    );
    assert!(apology.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn scenario_d_offer_then_confirmation_runs_deep_analysis() {
    let store = store();
    let classifier = ScriptedClassifier::new(vec![ScriptedClassifier::intent(
        Intent::DeepAnalysisRequest,
        "compare stoicism and buddhism",
    )]);
    let analyzer = RecordingAnalyzer::new();
    let dispatcher = Dispatcher::builder(store.clone(), classifier.clone(), analyzer.clone())
        .handler(FakeHandler::new(
            agents::OFFER_HANDLER,
            CallingConvention::Utility,
            |req| {
                Ok(HandlerOutcome::Offer {
                    content: "Short answer. Want a deep analysis?".into(),
                    original_query: req.query.clone(),
                })
            },
        ))
        .build();

    let offer = dispatcher
        .handle_query("compare stoicism and budhism", "s1")
        .await;
    assert_eq!(offer.agent_used, agents::OFFER);
    assert_eq!(offer.answer, "Short answer. Want a deep analysis?");
    assert!(dispatcher.pending().has_pending("s1").await);

    let deep = dispatcher.handle_query("yes please", "s1").await;
    assert_eq!(deep.agent_used, agents::PLANNER);
    assert_eq!(deep.answer, "analysis of compare stoicism and buddhism");
    assert!(deep.thought_process.is_some());
    assert_eq!(
        analyzer.queries.lock().unwrap().clone(),
        vec!["compare stoicism and buddhism"]
    );
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    assert!(!dispatcher.pending().has_pending("s1").await);
}

#[tokio::test]
async fn denied_offer_goes_through_normal_routing() {
    let store = store();
    let classifier = ScriptedClassifier::new(vec![
        ScriptedClassifier::intent(Intent::DeepAnalysisRequest, "q"),
        ClassifierVerdict::FinalAnswer {
            content: "Alright, no problem.".into(),
        },
    ]);
    let analyzer = RecordingAnalyzer::new();
    let dispatcher = Dispatcher::builder(store.clone(), classifier.clone(), analyzer.clone())
        .handler(FakeHandler::new(agents::OFFER_HANDLER, CallingConvention::Utility, |req| {
            Ok(HandlerOutcome::Offer {
                content: "Deep dive?".into(),
                original_query: req.query.clone(),
            })
        }))
        .build();

    dispatcher.handle_query("q", "s1").await;
    let resp = dispatcher.handle_query("no thanks", "s1").await;

    assert_eq!(resp.agent_used, agents::QUICK_RESPONSE);
    assert_eq!(resp.answer, "Alright, no problem.");
    assert!(analyzer.queries.lock().unwrap().is_empty());
    assert!(!dispatcher.pending().has_pending("s1").await);
}

#[tokio::test]
async fn declined_and_unrouted_requests_fall_back_to_deep_analysis() {
    let store = store();
    let classifier = ScriptedClassifier::new(vec![
        ScriptedClassifier::intent(Intent::LibrarianRequest, "who wrote hamlet"),
        ClassifierVerdict::Dispatch(DispatchOrder {
            intent: "WEATHER_REQUEST".into(),
            corrected_query: Some("weather in bangkok".into()),
            content: None,
        }),
        ScriptedClassifier::intent(Intent::ImageRequest, "a cat"),
    ]);
    let analyzer = RecordingAnalyzer::new();
    let dispatcher = Dispatcher::builder(store.clone(), classifier, analyzer.clone())
        .handler(FakeHandler::new(agents::LIBRARIAN, CallingConvention::Utility, |_| {
            Ok(HandlerOutcome::Declined)
        }))
        .build();

    let declined = dispatcher.handle_query("who wrote hamlet", "s1").await;
    let unknown = dispatcher.handle_query("weather in bkk", "s1").await;
    // no image handler registered
    let missing = dispatcher.handle_query("a cat pic", "s1").await;

    for resp in [&declined, &unknown, &missing] {
        assert_eq!(resp.agent_used, agents::PLANNER);
        assert!(!resp.error);
    }
    assert_eq!(
        analyzer.queries.lock().unwrap().clone(),
        vec!["who wrote hamlet", "weather in bangkok", "a cat"]
    );
}

#[tokio::test]
async fn formatter_runs_only_for_allowlisted_agents_and_fails_open() {
    let store = store();
    let classifier = ScriptedClassifier::new(vec![
        ScriptedClassifier::intent(Intent::UserStorytelling, "my day"),
        ScriptedClassifier::intent(Intent::CounselingRequest, "i'm sad"),
    ]);
    let dispatcher = Dispatcher::builder(store.clone(), classifier, RecordingAnalyzer::new())
        .formatter(Arc::new(BracketFormatter { fail: false }))
        .handler(FakeHandler::new(agents::LISTENER, CallingConvention::Contextual, |_| {
            Ok(HandlerOutcome::Answer("sounds fun".into()))
        }))
        .handler(FakeHandler::new(agents::COUNSELOR, CallingConvention::Contextual, |_| {
            Ok(HandlerOutcome::Answer("I hear you".into()))
        }))
        .build();

    let listener = dispatcher.handle_query("my day", "s1").await;
    assert_eq!(listener.answer, "[sounds fun]");
    let counselor = dispatcher.handle_query("i'm sad", "s1").await;
    assert_eq!(counselor.answer, "I hear you");

    let classifier = ScriptedClassifier::new(vec![ScriptedClassifier::intent(
        Intent::UserStorytelling,
        "my day",
    )]);
    let failing = Dispatcher::builder(store.clone(), classifier, RecordingAnalyzer::new())
        .formatter(Arc::new(BracketFormatter { fail: true }))
        .handler(FakeHandler::new(agents::LISTENER, CallingConvention::Contextual, |_| {
            Ok(HandlerOutcome::Answer("sounds fun".into()))
        }))
        .build();
    let resp = failing.handle_query("my day", "s2").await;
    assert_eq!(resp.answer, "sounds fun");
    assert!(!resp.error);
    let stored = store.last_n_turns("s2", 1).await.unwrap();
    assert_eq!(stored[0].content, "sounds fun");
}

#[tokio::test]
async fn calling_conventions_control_history() {
    let store = store();
    for i in 0..6 {
        store
            .add_turn("s1", Role::User, &format!("old {i}"), None)
            .await
            .unwrap();
    }
    let classifier = ScriptedClassifier::new(vec![
        ScriptedClassifier::intent(Intent::CodeRequest, "code"),
        ScriptedClassifier::intent(Intent::NewsRequest, "news"),
    ]);
    let coder = FakeHandler::new(agents::CODER, CallingConvention::Contextual, |_| {
        Ok(HandlerOutcome::Answer("fn main() {}".into()))
    });
    let news = FakeHandler::new(agents::NEWS, CallingConvention::Utility, |_| {
        Ok(HandlerOutcome::ThoughtfulAnswer {
            answer: "headlines".into(),
            trace: json!({"articles_found": 2}),
        })
    });
    let dispatcher = Dispatcher::builder(store.clone(), classifier.clone(), RecordingAnalyzer::new())
        .handler(coder.clone())
        .handler(news.clone())
        .build();

    dispatcher.handle_query("code", "s1").await;
    let resp = dispatcher.handle_query("news", "s1").await;

    assert_eq!(coder.seen.lock().unwrap()[0].history.len(), 4);
    assert!(news.seen.lock().unwrap()[0].history.is_empty());
    assert_eq!(classifier.seen_history.lock().unwrap().clone(), vec![4, 4]);
    assert_eq!(resp.agent_used, agents::NEWS);
    assert_eq!(resp.thought_process.unwrap()["articles_found"], 2);
}

#[tokio::test]
async fn image_outcome_and_quick_response() {
    let store = store();
    let classifier = ScriptedClassifier::new(vec![
        ScriptedClassifier::intent(Intent::ImageRequest, "a cat"),
        ClassifierVerdict::FinalAnswer {
            content: "Hi there!".into(),
        },
    ]);
    let dispatcher = Dispatcher::builder(store.clone(), classifier, RecordingAnalyzer::new())
        .formatter(Arc::new(BracketFormatter { fail: false }))
        .handler(FakeHandler::new(agents::IMAGE, CallingConvention::Utility, |_| {
            Ok(HandlerOutcome::Image(ImageInfo {
                url: "https://img.example/cat.jpg".into(),
                description: Some("a cat".into()),
                author: None,
                source_url: None,
            }))
        }))
        .build();

    let image = dispatcher.handle_query("show me a cat", "s1").await;
    assert_eq!(image.agent_used, agents::IMAGE);
    assert_eq!(image.answer, IMAGE_FOUND);
    assert_eq!(image.image.unwrap().url, "https://img.example/cat.jpg");

    let quick = dispatcher.handle_query("hello", "s1").await;
    assert_eq!(quick.agent_used, agents::QUICK_RESPONSE);
    assert_eq!(quick.answer, "Hi there!");
}

#[tokio::test]
async fn history_window_caps_display_history() {
    let store = store();
    for i in 0..20 {
        store
            .add_turn("s1", Role::User, &format!("turn {i}"), None)
            .await
            .unwrap();
    }
    let classifier = ScriptedClassifier::new(vec![ClassifierVerdict::FinalAnswer {
        content: "ok".into(),
    }]);
    let dispatcher = Dispatcher::builder(store, classifier, RecordingAnalyzer::new()).build();

    let resp = dispatcher.handle_query("latest", "s1").await;
    let history = resp.history.unwrap();
    assert_eq!(history.len(), 15);
    assert_eq!(history.last().unwrap().parts, "ok");
}

#[tokio::test]
async fn progress_updates_are_emitted_in_order() {
    let store = store();
    let classifier = ScriptedClassifier::new(vec![ScriptedClassifier::intent(
        Intent::GeneralConversation,
        "tell me something",
    )]);
    let dispatcher = Dispatcher::builder(store, classifier, RecordingAnalyzer::new())
        .formatter(Arc::new(BracketFormatter { fail: false }))
        .handler(FakeHandler::new(agents::GENERAL, CallingConvention::Contextual, |_| {
            Ok(HandlerOutcome::Answer("something".into()))
        }))
        .build();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let resp = dispatcher
        .handle_query_with_progress("tell me something", "s1", Some(&tx))
        .await;
    drop(tx);

    let mut statuses = Vec::new();
    while let Some(update) = rx.recv().await {
        statuses.push(update.status);
    }
    assert_eq!(
        statuses,
        vec![
            ProgressStatus::Received,
            ProgressStatus::Routing,
            ProgressStatus::Processing,
            ProgressStatus::Formatting,
        ]
    );
    assert_eq!(resp.answer, "[something]");
}
