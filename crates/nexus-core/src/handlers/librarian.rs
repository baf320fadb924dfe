use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use nexus_memory::RetrievalCoordinator;

use crate::agent::{AgentFactory, LlmAgent};
use crate::handler::{agents, Handler, HandlerOutcome, HandlerRequest};
use crate::prompts;

const RECOMMEND_WORDS: &[&str] = &["recommend", "suggest", "what should i read", "แนะนำ"];
const CATEGORY_WORDS: &[&str] = &["categor", "genre", "section", "หมวด"];
const CATALOGUE_WORDS: &[&str] = &[
    "list", "which books", "what books", "all books", "books do you have", "catalog",
    "รายชื่อ", "มีหนังสือ",
];

pub const EMPTY_LIBRARY: &str = "The library has no books loaded yet.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LibrarianTask {
    Recommend,
    Categories,
    Catalogue,
}

fn detect(query: &str) -> Option<LibrarianTask> {
    let lower = query.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if any(RECOMMEND_WORDS) {
        Some(LibrarianTask::Recommend)
    } else if any(CATEGORY_WORDS) {
        Some(LibrarianTask::Categories)
    } else if any(CATALOGUE_WORDS) {
        Some(LibrarianTask::Catalogue)
    } else {
        None
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Answers questions about the library itself.
pub struct LibrarianHandler {
    retrieval: Arc<RetrievalCoordinator>,
    agent: LlmAgent,
}

impl LibrarianHandler {
    pub fn new(factory: &AgentFactory, retrieval: Arc<RetrievalCoordinator>) -> Self {
        Self {
            retrieval,
            agent: factory.agent(agents::LIBRARIAN, prompts::LIBRARIAN),
        }
    }
}

#[async_trait]
impl Handler for LibrarianHandler {
    fn name(&self) -> &str {
        agents::LIBRARIAN
    }

    async fn handle(&self, request: &HandlerRequest) -> Result<HandlerOutcome> {
        let Some(task) = detect(&request.query) else {
            return Ok(HandlerOutcome::Declined);
        };
        tracing::debug!("librarian task {task:?}");

        let answer = match task {
            LibrarianTask::Categories => {
                let categories = self.retrieval.list_available_categories();
                if categories.is_empty() {
                    EMPTY_LIBRARY.to_string()
                } else {
                    format!("The library is organised into these categories:\n{}", bullet_list(&categories))
                }
            }
            LibrarianTask::Catalogue => {
                let titles = self.retrieval.list_all_book_titles();
                if titles.is_empty() {
                    EMPTY_LIBRARY.to_string()
                } else {
                    format!("Here are the {} books in the library:\n{}", titles.len(), bullet_list(&titles))
                }
            }
            LibrarianTask::Recommend => {
                let titles = self.retrieval.list_all_book_titles();
                if titles.is_empty() {
                    EMPTY_LIBRARY.to_string()
                } else {
                    let prompt = format!(
                        "Catalogue:\n{}\n\nRequest: {}",
                        bullet_list(&titles),
                        request.query
                    );
                    self.agent.ask(prompt).await?
                }
            }
        };
        Ok(HandlerOutcome::Answer(answer))
    }
}
