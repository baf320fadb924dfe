use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::PendingConfig;

pub const DEFAULT_PENDING_TIMEOUT_SECS: u64 = 300;

pub fn default_confirm_markers() -> Vec<String> {
    [
        "yes", "yeah", "yep", "sure", "ok", "okay", "please do", "go ahead", "do it",
        "of course", "ใช่", "ใช่ครับ", "ใช่ค่ะ", "เอา", "เอาเลย", "ได้เลย", "ตกลง", "จัดไป",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

pub fn default_deny_markers() -> Vec<String> {
    [
        "no", "nope", "not now", "no thanks", "don't", "do not", "cancel", "never mind",
        "skip", "ไม่", "ไม่ครับ", "ไม่ค่ะ", "ไม่เอา", "ไม่ต้อง", "ไว้ก่อน",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Confirm,
    Deny,
    Unclear,
}

/// Splits on whitespace and punctuation only, so combining marks in
/// scripts like Thai stay attached to their word.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| {
        c.is_whitespace()
            || c.is_ascii_punctuation()
            || matches!(c, '…' | '“' | '”' | '‘' | '’' | '。' | '、' | '！' | '？' | '，')
    })
    .filter(|t| !t.is_empty())
    .map(str::to_lowercase)
    .collect()
}

fn contains_phrase(tokens: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty()
        && tokens.len() >= phrase.len()
        && tokens.windows(phrase.len()).any(|w| w == phrase)
}

/// Confirmation and refusal phrases, matched as whole tokens.
#[derive(Debug, Clone)]
pub struct ReplyMarkers {
    confirm: Vec<Vec<String>>,
    deny: Vec<Vec<String>>,
}

impl Default for ReplyMarkers {
    fn default() -> Self {
        Self::new(&default_confirm_markers(), &default_deny_markers())
    }
}

impl ReplyMarkers {
    pub fn new(confirm: &[String], deny: &[String]) -> Self {
        let compile = |list: &[String]| {
            list.iter()
                .map(|p| tokenize(p))
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        };
        Self {
            confirm: compile(confirm),
            deny: compile(deny),
        }
    }

    /// A refusal anywhere in the reply wins over a confirmation.
    pub fn classify(&self, reply: &str) -> ReplyKind {
        let tokens = tokenize(reply);
        if self.deny.iter().any(|p| contains_phrase(&tokens, p)) {
            ReplyKind::Deny
        } else if self.confirm.iter().any(|p| contains_phrase(&tokens, p)) {
            ReplyKind::Confirm
        } else {
            ReplyKind::Unclear
        }
    }
}

#[derive(Debug, Clone)]
struct PendingTask {
    original_query: String,
    created_at: Instant,
}

/// One outstanding deep-analysis offer per session.
#[derive(Debug)]
pub struct PendingTaskStore {
    tasks: Mutex<HashMap<String, PendingTask>>,
    timeout: Duration,
    markers: ReplyMarkers,
}

impl Default for PendingTaskStore {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_PENDING_TIMEOUT_SECS),
            ReplyMarkers::default(),
        )
    }
}

impl PendingTaskStore {
    pub fn new(timeout: Duration, markers: ReplyMarkers) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            timeout,
            markers,
        }
    }

    pub fn from_config(config: &PendingConfig) -> Self {
        Self::new(
            Duration::from_secs(config.timeout_secs),
            ReplyMarkers::new(&config.confirm, &config.deny),
        )
    }

    /// Replaces any earlier offer for the session.
    pub async fn set_pending(&self, session_id: &str, original_query: &str) {
        let task = PendingTask {
            original_query: original_query.to_string(),
            created_at: Instant::now(),
        };
        self.tasks.lock().await.insert(session_id.to_string(), task);
        tracing::info!("pending deep analysis stored for session {session_id}");
    }

    pub async fn has_pending(&self, session_id: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        match tasks.get(session_id) {
            Some(task) if task.created_at.elapsed() > self.timeout => {
                tasks.remove(session_id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Resolves the session's offer against the user's reply. Any outcome
    /// clears the slot; only a confirmation returns the stored query.
    pub async fn check_and_clear(&self, session_id: &str, reply: &str) -> Option<String> {
        let task = self.tasks.lock().await.remove(session_id)?;

        if task.created_at.elapsed() > self.timeout {
            tracing::info!("pending deep analysis for session {session_id} expired");
            return None;
        }

        match self.markers.classify(reply) {
            ReplyKind::Confirm => {
                tracing::info!("session {session_id} confirmed pending deep analysis");
                Some(task.original_query)
            }
            ReplyKind::Deny => {
                tracing::info!("session {session_id} declined pending deep analysis");
                None
            }
            ReplyKind::Unclear => {
                tracing::debug!("unclear reply to pending offer in session {session_id}, dropping it");
                None
            }
        }
    }
}
