use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use nexus_schema::{ConversationTurn, Role};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::task;

use crate::migrations::run_migrations;

pub const NO_PREVIOUS_QUERY: &str = "(no previous question)";

const TURN_COLUMNS: &str = "id, timestamp, session_id, role, content, agent_used";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub total_messages: i64,
    pub user_messages: i64,
    pub model_messages: i64,
    pub first_message_at: Option<DateTime<Utc>>,
}

/// Append-only per-session conversation log.
#[derive(Clone)]
pub struct ConversationStore {
    db: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open conversation db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        run_migrations(&conn)?;
        tracing::info!("conversation store opened at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn add_turn(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        agent_used: Option<&str>,
    ) -> Result<i64> {
        let db = Arc::clone(&self.db);
        let session_id = session_id.to_owned();
        let content = content.to_owned();
        let agent_used = agent_used.map(str::to_owned);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                r#"
                INSERT INTO conversation_history (timestamp, session_id, role, content, agent_used)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    Utc::now().to_rfc3339(),
                    session_id,
                    role.as_str(),
                    content,
                    agent_used,
                ],
            )?;
            Ok::<i64, anyhow::Error>(conn.last_insert_rowid())
        })
        .await?
    }

    /// The last `limit` turns of a session, oldest first.
    pub async fn last_n_turns(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let db = Arc::clone(&self.db);
        let session_id = session_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {TURN_COLUMNS} FROM conversation_history
                 WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![session_id, limit as i64], row_to_turn)?;
            let mut turns = Vec::new();
            for row in rows {
                turns.push(row?);
            }
            turns.reverse();
            Ok::<Vec<ConversationTurn>, anyhow::Error>(turns)
        })
        .await?
    }

    pub async fn last_user_query(&self, session_id: &str) -> Result<String> {
        let db = Arc::clone(&self.db);
        let session_id = session_id.to_owned();
        let found = task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let content: Option<String> = conn
                .query_row(
                    "SELECT content FROM conversation_history
                     WHERE session_id = ?1 AND role = 'user' ORDER BY id DESC LIMIT 1",
                    params![session_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok::<Option<String>, anyhow::Error>(content)
        })
        .await??;
        Ok(found.unwrap_or_else(|| NO_PREVIOUS_QUERY.to_string()))
    }

    pub async fn first_user_turn(&self, session_id: &str) -> Result<Option<ConversationTurn>> {
        let db = Arc::clone(&self.db);
        let session_id = session_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let turn = conn
                .query_row(
                    &format!(
                        "SELECT {TURN_COLUMNS} FROM conversation_history
                         WHERE session_id = ?1 AND role = 'user' ORDER BY id ASC LIMIT 1"
                    ),
                    params![session_id],
                    row_to_turn,
                )
                .optional()?;
            Ok::<Option<ConversationTurn>, anyhow::Error>(turn)
        })
        .await?
    }

    pub async fn conversation_stats(&self, session_id: &str) -> Result<ConversationStats> {
        let db = Arc::clone(&self.db);
        let session_id = session_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let (total, user, model, first): (i64, i64, i64, Option<String>) = conn.query_row(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(CASE WHEN role = 'user' THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN role = 'model' THEN 1 ELSE 0 END), 0),
                       MIN(timestamp)
                FROM conversation_history
                WHERE session_id = ?1
                "#,
                params![session_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )?;
            let first_message_at = first.as_deref().map(parse_datetime_sql).transpose()?;
            Ok::<ConversationStats, anyhow::Error>(ConversationStats {
                total_messages: total,
                user_messages: user,
                model_messages: model,
                first_message_at,
            })
        })
        .await?
    }

    /// Turns recorded within the last `hours`, oldest first.
    pub async fn turns_since(&self, session_id: &str, hours: i64) -> Result<Vec<ConversationTurn>> {
        let delta =
            TimeDelta::try_hours(hours).ok_or_else(|| anyhow!("invalid hours value: {hours}"))?;
        let cutoff = (Utc::now() - delta).to_rfc3339();
        let db = Arc::clone(&self.db);
        let session_id = session_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {TURN_COLUMNS} FROM conversation_history
                 WHERE session_id = ?1 AND timestamp >= ?2 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![session_id, cutoff], row_to_turn)?;
            let mut turns = Vec::new();
            for row in rows {
                turns.push(row?);
            }
            Ok::<Vec<ConversationTurn>, anyhow::Error>(turns)
        })
        .await?
    }
}

fn parse_datetime_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_turn(row: &Row<'_>) -> rusqlite::Result<ConversationTurn> {
    let ts_raw: String = row.get(1)?;
    let role_raw: String = row.get(3)?;
    Ok(ConversationTurn {
        id: row.get(0)?,
        timestamp: parse_datetime_sql(&ts_raw)?,
        session_id: row.get(2)?,
        role: Role::parse(&role_raw),
        content: row.get(4)?,
        agent_used: row.get(5)?,
    })
}
