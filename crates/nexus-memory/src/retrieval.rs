use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::task;

use crate::embedding::EmbeddingProvider;
use crate::index::{RetrievalIndex, RetrievalRecord, ScoredRecord};
use crate::rerank::Reranker;

pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Book,
    Memory,
    Graph,
    News,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::Memory => "memory",
            Self::Graph => "graph",
            Self::News => "news",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "book" | "books" => Some(Self::Book),
            "memory" | "memories" => Some(Self::Memory),
            "graph" | "knowledge_graph" => Some(Self::Graph),
            "news" => Some(Self::News),
            _ => None,
        }
    }
}

/// A search hit tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub source: Domain,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Native index score: similarity for cosine indexes, distance for L2.
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
    /// Higher-is-better score used to order hits across domains.
    pub relevance: f64,
    #[serde(flatten)]
    pub record: RetrievalRecord,
}

impl RetrievedChunk {
    pub fn text(&self) -> &str {
        &self.record.embedding_text
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BookSearch {
    pub context: String,
    pub sources: Vec<String>,
    pub chunks: Vec<RetrievedChunk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewsSearch {
    pub context: String,
    pub articles: Vec<RetrievedChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchLog {
    pub sub_query: String,
    pub domain: Domain,
    pub hits: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FanOutResult {
    /// Merged, deduplicated and truncated hits, best first.
    pub chunks: Vec<RetrievedChunk>,
    pub logs: Vec<SearchLog>,
    /// Distinct hits after dedup, before truncation.
    pub candidates: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_book_retrieval_k")]
    pub book_retrieval_k: usize,
    #[serde(default = "default_book_rerank_k")]
    pub book_rerank_k: usize,
    #[serde(default = "default_memory_k")]
    pub memory_k: usize,
    #[serde(default = "default_graph_k")]
    pub graph_k: usize,
    #[serde(default = "default_news_k")]
    pub news_k: usize,
    #[serde(default = "default_final_context_chunks")]
    pub final_context_chunks: usize,
    #[serde(default = "default_query_prefix")]
    pub query_prefix: String,
}

fn default_book_retrieval_k() -> usize {
    10
}

fn default_book_rerank_k() -> usize {
    5
}

fn default_memory_k() -> usize {
    3
}

fn default_graph_k() -> usize {
    3
}

fn default_news_k() -> usize {
    7
}

fn default_final_context_chunks() -> usize {
    5
}

fn default_query_prefix() -> String {
    "query: ".to_string()
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            book_retrieval_k: default_book_retrieval_k(),
            book_rerank_k: default_book_rerank_k(),
            memory_k: default_memory_k(),
            graph_k: default_graph_k(),
            news_k: default_news_k(),
            final_context_chunks: default_final_context_chunks(),
            query_prefix: default_query_prefix(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexSummary {
    pub categories: BTreeMap<String, usize>,
    pub memory: Option<usize>,
    pub graph: Option<usize>,
    pub news: Option<usize>,
}

/// Every index loaded from one root directory:
/// `books/<category>/`, `memory/`, `graph/`, `news/`.
pub struct IndexSet {
    books: BTreeMap<String, RetrievalIndex>,
    memory: RetrievalIndex,
    graph: RetrievalIndex,
    news: RetrievalIndex,
}

impl IndexSet {
    pub fn load(root: &Path, embedder: Arc<dyn EmbeddingProvider>, query_prefix: &str) -> Self {
        let mut books = BTreeMap::new();
        let books_dir = root.join("books");
        match std::fs::read_dir(&books_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !path.is_dir() {
                        continue;
                    }
                    let category = entry.file_name().to_string_lossy().to_string();
                    let index = RetrievalIndex::open(
                        format!("books/{category}"),
                        &path,
                        Arc::clone(&embedder),
                        query_prefix,
                    );
                    if index.is_enabled() {
                        books.insert(category, index);
                    }
                }
            }
            Err(e) => tracing::warn!("no book categories under {}: {e}", books_dir.display()),
        }

        let open = |name: &str| {
            RetrievalIndex::open(name, &root.join(name), Arc::clone(&embedder), query_prefix)
        };
        let set = Self {
            books,
            memory: open("memory"),
            graph: open("graph"),
            news: open("news"),
        };
        tracing::info!(
            "retrieval indexes loaded from {}: {} book categories",
            root.display(),
            set.books.len()
        );
        set
    }

    pub fn summary(&self) -> IndexSummary {
        let size = |index: &RetrievalIndex| index.is_enabled().then(|| index.len());
        IndexSummary {
            categories: self
                .books
                .iter()
                .map(|(name, index)| (name.clone(), index.len()))
                .collect(),
            memory: size(&self.memory),
            graph: size(&self.graph),
            news: size(&self.news),
        }
    }
}

/// Single query surface over all retrieval indexes. The loaded set is an
/// immutable snapshot; `reload` swaps in a fresh one.
pub struct RetrievalCoordinator {
    root: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Arc<dyn Reranker>,
    settings: RetrievalSettings,
    indexes: ArcSwap<IndexSet>,
}

impl RetrievalCoordinator {
    pub fn load(
        root: impl Into<PathBuf>,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Arc<dyn Reranker>,
        settings: RetrievalSettings,
    ) -> Self {
        let root = root.into();
        let set = IndexSet::load(&root, Arc::clone(&embedder), &settings.query_prefix);
        Self {
            root,
            embedder,
            reranker,
            settings,
            indexes: ArcSwap::from_pointee(set),
        }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    pub fn summary(&self) -> IndexSummary {
        self.indexes.load().summary()
    }

    /// Rebuild every index from disk and publish the new set. Searches already
    /// running keep the set they started with.
    pub async fn reload(&self) -> Result<IndexSummary> {
        let root = self.root.clone();
        let embedder = Arc::clone(&self.embedder);
        let prefix = self.settings.query_prefix.clone();
        let set = task::spawn_blocking(move || IndexSet::load(&root, embedder, &prefix)).await?;
        let summary = set.summary();
        self.indexes.store(Arc::new(set));
        tracing::info!("retrieval indexes reloaded: {:?}", summary);
        Ok(summary)
    }

    pub fn has_memory_index(&self) -> bool {
        self.indexes.load().memory.is_enabled()
    }

    pub fn list_available_categories(&self) -> Vec<String> {
        self.indexes.load().books.keys().cloned().collect()
    }

    pub fn list_all_book_titles(&self) -> Vec<String> {
        let set = self.indexes.load();
        let titles: BTreeSet<String> = set
            .books
            .values()
            .flat_map(|index| index.records().iter())
            .filter_map(|r| r.field("book_title"))
            .filter(|t| !t.trim().is_empty())
            .collect();
        titles.into_iter().collect()
    }

    /// Category-scoped book search with a rerank pass. An empty filter, or one
    /// that names no known category, searches every category.
    pub async fn search_books(
        &self,
        query: &str,
        categories: &[String],
        retrieval_k: usize,
        rerank_k: usize,
    ) -> BookSearch {
        let set = self.indexes.load_full();
        let wanted: HashSet<String> = categories
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        let mut scoped: Vec<(&String, &RetrievalIndex)> = set
            .books
            .iter()
            .filter(|(name, _)| wanted.contains(&name.to_lowercase()))
            .collect();
        if scoped.is_empty() {
            if !wanted.is_empty() {
                tracing::info!("no book category matches {categories:?}, searching all");
            }
            scoped = set.books.iter().collect();
        }

        if query.trim().is_empty() || retrieval_k == 0 {
            return BookSearch::default();
        }
        // categories share one embedder and prefix
        let Some((_, first)) = scoped.first() else {
            return BookSearch::default();
        };
        let embedding = match first.embed_query(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!("book query embedding failed, treating as empty: {e:#}");
                return BookSearch::default();
            }
        };

        let embedding = &embedding;
        let searches = scoped.into_iter().map(|(category, index)| async move {
            let hits = index.search_vector(embedding, retrieval_k).await;
            into_chunks(index, hits, Domain::Book, Some(category.clone()))
        });
        let mut seen = HashSet::new();
        let candidates: Vec<RetrievedChunk> = join_all(searches)
            .await
            .into_iter()
            .flatten()
            .filter(|chunk| seen.insert(chunk.record.embedding_text.clone()))
            .collect();
        if candidates.is_empty() {
            return BookSearch::default();
        }

        let passages: Vec<String> = candidates.iter().map(|c| c.text().to_string()).collect();
        let scores = match self.reranker.score(query, &passages).await {
            Ok(scores) if scores.len() == candidates.len() => scores,
            Ok(scores) => {
                tracing::warn!(
                    "reranker {} returned {} scores for {} passages, keeping index order",
                    self.reranker.name(),
                    scores.len(),
                    candidates.len()
                );
                candidates.iter().map(|c| c.relevance).collect()
            }
            Err(e) => {
                tracing::warn!("reranker {} failed, keeping index order: {e:#}", self.reranker.name());
                candidates.iter().map(|c| c.relevance).collect()
            }
        };

        let mut chunks: Vec<RetrievedChunk> = candidates
            .into_iter()
            .zip(scores)
            .map(|(mut chunk, score)| {
                chunk.rerank_score = Some(score);
                chunk.relevance = score;
                chunk
            })
            .collect();
        chunks.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        chunks.truncate(rerank_k);

        let context = chunks
            .iter()
            .map(|c| c.text())
            .collect::<Vec<_>>()
            .join(CONTEXT_SEPARATOR);
        let sources: BTreeSet<String> = chunks
            .iter()
            .filter_map(|c| c.record.field("book_title"))
            .collect();

        BookSearch {
            context,
            sources: sources.into_iter().collect(),
            chunks,
        }
    }

    pub async fn search_memory(&self, query: &str, k: usize) -> Vec<RetrievedChunk> {
        let set = self.indexes.load_full();
        search_index(&set.memory, query, k, Domain::Memory, None).await
    }

    /// Graph hits with repeated node ids removed, first occurrence kept.
    pub async fn search_graph(&self, query: &str, k: usize) -> Vec<RetrievedChunk> {
        let set = self.indexes.load_full();
        let hits = search_index(&set.graph, query, k, Domain::Graph, None).await;
        let mut seen = HashSet::new();
        hits.into_iter()
            .filter(|chunk| match chunk.record.field("id") {
                Some(id) => seen.insert(id),
                None => true,
            })
            .collect()
    }

    pub async fn search_news(&self, query: &str, k: usize) -> NewsSearch {
        let set = self.indexes.load_full();
        let articles = search_index(&set.news, query, k, Domain::News, None).await;
        let context = articles
            .iter()
            .map(|a| {
                format!(
                    "From source '{}':\nTitle: {}\nSummary: {}\n---\n",
                    a.record.field("source_name").unwrap_or_default(),
                    a.record.field("title").unwrap_or_default(),
                    a.record.field("description").unwrap_or_default(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        NewsSearch { context, articles }
    }

    /// One retrieval per (sub-query, domain), awaited together. Hits are
    /// ordered by relevance, deduplicated by text and cut to the context size.
    pub async fn fan_out(
        &self,
        sub_queries: &[String],
        domains: &[Domain],
        categories: &[String],
    ) -> FanOutResult {
        let domains: BTreeSet<Domain> = domains.iter().copied().collect();
        let memory_enabled = self.has_memory_index();
        let mut searches: Vec<BoxFuture<'_, (SearchLog, Vec<RetrievedChunk>)>> = Vec::new();

        for sub_query in sub_queries {
            for &domain in &domains {
                let q = sub_query.clone();
                let fut = match domain {
                    Domain::Book => async move {
                        let found = self
                            .search_books(
                                &q,
                                categories,
                                self.settings.book_retrieval_k,
                                self.settings.book_rerank_k,
                            )
                            .await;
                        (q, found.chunks)
                    }
                    .boxed(),
                    Domain::Memory if memory_enabled => async move {
                        let found = self.search_memory(&q, self.settings.memory_k).await;
                        (q, found)
                    }
                    .boxed(),
                    Domain::Memory => continue,
                    Domain::Graph => async move {
                        let found = self.search_graph(&q, self.settings.graph_k).await;
                        (q, found)
                    }
                    .boxed(),
                    Domain::News => async move {
                        let found = self.search_news(&q, self.settings.news_k).await;
                        (q, found.articles)
                    }
                    .boxed(),
                };
                searches.push(
                    fut.map(move |(sub_query, chunks)| {
                        let log = SearchLog {
                            sub_query,
                            domain,
                            hits: chunks.len(),
                        };
                        (log, chunks)
                    })
                    .boxed(),
                );
            }
        }

        let mut logs = Vec::new();
        let mut merged = Vec::new();
        for (log, chunks) in join_all(searches).await {
            logs.push(log);
            merged.extend(chunks);
        }
        let (chunks, candidates) = merge_chunks(merged, self.settings.final_context_chunks);
        FanOutResult {
            chunks,
            logs,
            candidates,
        }
    }
}

/// Sort by relevance (stable), keep the first hit per text, truncate. Also
/// returns how many distinct hits there were before truncation.
pub fn merge_chunks(mut chunks: Vec<RetrievedChunk>, limit: usize) -> (Vec<RetrievedChunk>, usize) {
    chunks.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
    let mut seen = HashSet::new();
    chunks.retain(|c| seen.insert(c.record.embedding_text.clone()));
    let distinct = chunks.len();
    chunks.truncate(limit);
    (chunks, distinct)
}

async fn search_index(
    index: &RetrievalIndex,
    query: &str,
    k: usize,
    source: Domain,
    category: Option<String>,
) -> Vec<RetrievedChunk> {
    into_chunks(index, index.search(query, k).await, source, category)
}

fn into_chunks(
    index: &RetrievalIndex,
    hits: Result<Vec<ScoredRecord>>,
    source: Domain,
    category: Option<String>,
) -> Vec<RetrievedChunk> {
    match hits {
        Ok(hits) => hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                source,
                category: category.clone(),
                score: hit.score,
                rerank_score: None,
                relevance: index.metric().relevance(hit.score),
                record: hit.record,
            })
            .collect(),
        Err(e) => {
            tracing::warn!("search on {} failed, treating as empty: {e:#}", index.name());
            Vec::new()
        }
    }
}
