use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDateTime};

use crate::config::ImportantDay;
use crate::handler::{agents, Handler, HandlerOutcome, HandlerRequest};

const TIME_WORDS: &[&str] = &["time", "clock", "hour", "กี่โมง", "เวลา"];
const DATE_WORDS: &[&str] = &["date", "day", "today", "weekday", "วันที่", "วันอะไร", "วันนี้"];

/// Rule-based clock and calendar answers. Declines anything else.
pub struct ReporterHandler {
    important_days: Vec<ImportantDay>,
    fixed_now: Option<NaiveDateTime>,
}

impl ReporterHandler {
    pub fn new(important_days: Vec<ImportantDay>) -> Self {
        Self {
            important_days,
            fixed_now: None,
        }
    }

    /// Pin the clock, for tests.
    pub fn with_now(mut self, now: NaiveDateTime) -> Self {
        self.fixed_now = Some(now);
        self
    }

    fn now(&self) -> NaiveDateTime {
        self.fixed_now.unwrap_or_else(|| Local::now().naive_local())
    }

    fn important_day(&self, now: &NaiveDateTime) -> Option<&str> {
        self.important_days
            .iter()
            .find(|d| d.month == now.month() && d.day == now.day())
            .map(|d| d.name.as_str())
    }
}

/// ASCII keywords match whole words; others (Thai has no spaces) match as substrings.
fn mentions(query: &str, words: &[&str]) -> bool {
    let lower = query.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .collect();
    words.iter().any(|w| {
        if w.is_ascii() {
            tokens.iter().any(|t| t == w)
        } else {
            lower.contains(w)
        }
    })
}

#[async_trait]
impl Handler for ReporterHandler {
    fn name(&self) -> &str {
        agents::REPORTER
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerOutcome> {
        let now = self.now();

        if mentions(&request.query, TIME_WORDS) {
            return Ok(HandlerOutcome::Answer(format!(
                "It's {} right now.",
                now.format("%H:%M")
            )));
        }

        if mentions(&request.query, DATE_WORDS) {
            let date = now.format("%A, %-d %B %Y");
            let answer = match self.important_day(&now) {
                Some(name) => format!("Today is {date}. It's also {name}."),
                None => format!("Today is {date}."),
            };
            return Ok(HandlerOutcome::Answer(answer));
        }

        Ok(HandlerOutcome::Declined)
    }
}
