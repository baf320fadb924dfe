use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task;

use crate::embedding::EmbeddingProvider;
use crate::init_sqlite_vec;

pub const VECTOR_FILE: &str = "vectors.db";
pub const MAPPING_JSONL: &str = "mapping.jsonl";
pub const MAPPING_JSON: &str = "mapping.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::L2 => "l2",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cosine" => Some(Self::Cosine),
            "l2" => Some(Self::L2),
            _ => None,
        }
    }

    /// Map a native score onto "higher is better" so results from different
    /// metrics can be merged.
    pub fn relevance(&self, score: f64) -> f64 {
        match self {
            Self::Cosine => score,
            Self::L2 => 1.0 / (1.0 + score.max(0.0)),
        }
    }
}

/// One mapping entry. Everything besides `embedding_text` is domain specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRecord {
    #[serde(default)]
    pub embedding_text: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RetrievalRecord {
    pub fn new(embedding_text: impl Into<String>) -> Self {
        Self {
            embedding_text: embedding_text.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// A string field, or the string form of a scalar field.
    pub fn field(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: RetrievalRecord,
    /// Similarity for cosine indexes, distance for L2 indexes.
    pub score: f64,
}

/// A read-only k-NN index over one domain, backed by a sqlite-vec table and a
/// mapping file whose positions line up with the vector rowids.
pub struct RetrievalIndex {
    name: String,
    metric: DistanceMetric,
    dimensions: usize,
    records: Arc<Vec<RetrievalRecord>>,
    db: Option<Arc<Mutex<Connection>>>,
    embedder: Arc<dyn EmbeddingProvider>,
    query_prefix: String,
}

impl RetrievalIndex {
    pub fn disabled(name: impl Into<String>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            name: name.into(),
            metric: DistanceMetric::default(),
            dimensions: embedder.dimensions(),
            records: Arc::new(Vec::new()),
            db: None,
            embedder,
            query_prefix: String::new(),
        }
    }

    /// Open the index stored in `dir`. Missing or unreadable files leave the
    /// index disabled rather than failing.
    pub fn open(
        name: impl Into<String>,
        dir: &Path,
        embedder: Arc<dyn EmbeddingProvider>,
        query_prefix: &str,
    ) -> Self {
        let name = name.into();
        match Self::try_open(&name, dir, Arc::clone(&embedder), query_prefix) {
            Ok(Some(index)) => index,
            Ok(None) => {
                tracing::warn!(
                    "index {name}: no {VECTOR_FILE} or mapping under {}, searches will return nothing",
                    dir.display()
                );
                Self::disabled(name, embedder)
            }
            Err(e) => {
                tracing::warn!("index {name}: failed to load from {}: {e:#}", dir.display());
                Self::disabled(name, embedder)
            }
        }
    }

    fn try_open(
        name: &str,
        dir: &Path,
        embedder: Arc<dyn EmbeddingProvider>,
        query_prefix: &str,
    ) -> Result<Option<Self>> {
        let vectors_path = dir.join(VECTOR_FILE);
        let Some(mapping_path) = find_mapping(dir) else {
            return Ok(None);
        };
        if !vectors_path.exists() {
            return Ok(None);
        }

        let records = load_mapping(&mapping_path)?;

        init_sqlite_vec();
        let conn = Connection::open_with_flags(
            &vectors_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open {}", vectors_path.display()))?;

        let metric = read_meta(&conn, "metric")?
            .as_deref()
            .and_then(DistanceMetric::parse)
            .unwrap_or_default();
        let dimensions = read_meta(&conn, "dimensions")?
            .and_then(|d| d.parse::<usize>().ok())
            .unwrap_or_else(|| embedder.dimensions());
        let vector_count: i64 = conn.query_row("SELECT COUNT(*) FROM vectors", [], |r| r.get(0))?;

        if vector_count as usize != records.len() {
            tracing::warn!(
                "index {name}: {vector_count} vectors but {} mapping entries, results past the mapping are dropped",
                records.len()
            );
        }
        if dimensions != embedder.dimensions() {
            tracing::warn!(
                "index {name}: stored dimension {dimensions} differs from embedding model {} ({})",
                embedder.model_id(),
                embedder.dimensions()
            );
        }
        tracing::info!(
            "index {name}: loaded {} records ({}, {dimensions} dims)",
            records.len(),
            metric.as_str()
        );

        Ok(Some(Self {
            name: name.to_string(),
            metric,
            dimensions,
            records: Arc::new(records),
            db: Some(Arc::new(Mutex::new(conn))),
            embedder,
            query_prefix: query_prefix.to_string(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn is_enabled(&self) -> bool {
        self.db.is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[RetrievalRecord] {
        &self.records
    }

    /// Embed `query` with the prefix this index's records were built against.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embedder
            .embed_query(&format!("{}{}", self.query_prefix, query))
            .await
    }

    /// Top-`k` records for `query` in the index's native order.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredRecord>> {
        if !self.is_enabled() || query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embed_query(query).await?;
        self.search_vector(&embedding, k).await
    }

    /// Top-`k` records nearest to an already embedded query.
    pub async fn search_vector(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredRecord>> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        if embedding.len() != self.dimensions {
            bail!(
                "index {}: query embedding has {} dims, index expects {}",
                self.name,
                embedding.len(),
                self.dimensions
            );
        }
        let embedding_json = serde_json::to_string(embedding)?;

        let db = Arc::clone(db);
        let records = Arc::clone(&self.records);
        let metric = self.metric;
        let name = self.name.clone();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                r#"
                SELECT rowid, distance
                FROM vectors
                WHERE embedding MATCH ?1 AND k = ?2
                ORDER BY distance
                "#,
            )?;
            let rows = stmt.query_map(params![embedding_json, k as i64], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (rowid, distance) = row?;
                let Some(record) = usize::try_from(rowid - 1).ok().and_then(|i| records.get(i)) else {
                    tracing::debug!("index {name}: rowid {rowid} has no mapping entry");
                    continue;
                };
                let score = match metric {
                    DistanceMetric::Cosine => 1.0 - distance,
                    DistanceMetric::L2 => distance,
                };
                out.push(ScoredRecord {
                    record: record.clone(),
                    score,
                });
            }
            Ok::<Vec<ScoredRecord>, anyhow::Error>(out)
        })
        .await?
    }
}

fn find_mapping(dir: &Path) -> Option<PathBuf> {
    [MAPPING_JSONL, MAPPING_JSON]
        .iter()
        .map(|f| dir.join(f))
        .find(|p| p.exists())
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let has_meta: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='meta'",
        [],
        |r| r.get(0),
    )?;
    if !has_meta {
        return Ok(None);
    }
    let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
    let mut rows = stmt.query(params![key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Read a mapping file. `.jsonl` holds one record per line; `.json` holds
/// either an array or an object keyed by position.
pub fn load_mapping(path: &Path) -> Result<Vec<RetrievalRecord>> {
    let is_jsonl = path.extension().is_some_and(|e| e == "jsonl");
    if is_jsonl {
        let file =
            fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .with_context(|| format!("{}:{}: invalid record", path.display(), line_no + 1))?;
            records.push(record);
        }
        return Ok(records);
    }

    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect(),
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| match (a.parse::<u64>(), b.parse::<u64>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => a.cmp(b),
            });
            entries
                .into_iter()
                .map(|(_, v)| serde_json::from_value(v).map_err(Into::into))
                .collect()
        }
        _ => bail!("{}: mapping must be an array or an object", path.display()),
    }
}

/// Write an index directory: a sqlite-vec table plus `mapping.jsonl`.
/// Used by fixtures and offline tooling; the runtime only reads.
pub fn write_index(
    dir: &Path,
    metric: DistanceMetric,
    dimensions: usize,
    entries: &[(RetrievalRecord, Vec<f32>)],
) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let vectors_path = dir.join(VECTOR_FILE);
    if vectors_path.exists() {
        fs::remove_file(&vectors_path)?;
    }

    init_sqlite_vec();
    let conn = Connection::open(&vectors_path)?;
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
        CREATE VIRTUAL TABLE vectors USING vec0(embedding float[{dimensions}] distance_metric={});
        "#,
        metric.as_str()
    ))?;
    conn.execute(
        "INSERT INTO meta(key, value) VALUES ('metric', ?1), ('dimensions', ?2)",
        params![metric.as_str(), dimensions.to_string()],
    )?;

    let tx = conn.unchecked_transaction()?;
    for (i, (_, vector)) in entries.iter().enumerate() {
        if vector.len() != dimensions {
            bail!("entry {i} has {} dims, expected {dimensions}", vector.len());
        }
        tx.execute(
            "INSERT INTO vectors(rowid, embedding) VALUES (?1, ?2)",
            params![(i + 1) as i64, serde_json::to_string(vector)?],
        )?;
    }
    tx.commit()?;

    let mut mapping = fs::File::create(dir.join(MAPPING_JSONL))?;
    for (record, _) in entries {
        writeln!(mapping, "{}", serde_json::to_string(record)?)?;
    }
    Ok(())
}
