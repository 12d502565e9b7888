//! Durable, append-only conversation history.
//!
//! Turns live in the `conversation_turns` table keyed by
//! `(conversation_id, turn_index)`. Indices are assigned inside the insert
//! while holding a lock scoped to one conversation, so concurrent appends to
//! the same conversation are serialized and other conversations never wait.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex as AsyncMutex;

use crate::pipeline::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub conversation_id: String,
    pub turn_index: i64,
    pub role: Role,
    pub text: String,
    /// Stored with microsecond precision.
    pub timestamp: DateTime<Utc>,
}

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

pub struct ConversationStore {
    pool: SqlitePool,
    locks: LockMap,
}

/// Holds one conversation's lock entry and prunes it from the map when the
/// last user lets go.
struct LockLease<'a> {
    locks: &'a LockMap,
    conversation_id: &'a str,
    lock: Arc<AsyncMutex<()>>,
}

impl<'a> LockLease<'a> {
    fn acquire(locks: &'a LockMap, conversation_id: &'a str) -> Self {
        let lock = locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.to_string())
            .or_default()
            .clone();
        Self {
            locks,
            conversation_id,
            lock,
        }
    }
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(self.conversation_id);
        }
    }
}

impl ConversationStore {
    pub async fn open(db_path: &Path) -> Result<Self, PipelineError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| PipelineError::storage(format!("Failed to open history db: {}", e)))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_turns (
                conversation_id TEXT NOT NULL,
                turn_index INTEGER NOT NULL,
                role TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (conversation_id, turn_index)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| PipelineError::storage(format!("Failed to init history table: {}", e)))?;

        Ok(Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
    ) -> Result<ConversationTurn, PipelineError> {
        let mut turns = self
            .append_turns(conversation_id, &[(role, text)])
            .await?;
        turns
            .pop()
            .ok_or_else(|| PipelineError::storage("append returned no turn"))
    }

    /// Appends a user turn and the assistant reply atomically, with
    /// consecutive indices.
    pub async fn append_exchange(
        &self,
        conversation_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<(ConversationTurn, ConversationTurn), PipelineError> {
        let mut turns = self
            .append_turns(
                conversation_id,
                &[(Role::User, user_text), (Role::Assistant, assistant_text)],
            )
            .await?
            .into_iter();

        match (turns.next(), turns.next()) {
            (Some(user), Some(assistant)) => Ok((user, assistant)),
            _ => Err(PipelineError::storage("append returned too few turns")),
        }
    }

    async fn append_turns(
        &self,
        conversation_id: &str,
        turns: &[(Role, &str)],
    ) -> Result<Vec<ConversationTurn>, PipelineError> {
        validate_conversation_id(conversation_id)?;
        for (_, text) in turns {
            if text.trim().is_empty() {
                return Err(PipelineError::InvalidArgument(
                    "turn text must not be empty".to_string(),
                ));
            }
        }

        let lease = LockLease::acquire(&self.locks, conversation_id);
        let _guard = lease.lock.lock().await;

        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;
        let mut written = Vec::with_capacity(turns.len());
        for (role, text) in turns {
            written.push(insert_turn(&mut tx, conversation_id, *role, text).await?);
        }
        tx.commit().await.map_err(PipelineError::storage)?;

        tracing::debug!(
            conversation_id,
            turns = written.len(),
            next_index = written.last().map(|t| t.turn_index + 1).unwrap_or_default(),
            "Appended conversation turns"
        );
        Ok(written)
    }

    /// The last `limit` turns, oldest first.
    pub async fn recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, PipelineError> {
        validate_conversation_id(conversation_id)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT conversation_id, turn_index, role, text, created_at
             FROM conversation_turns
             WHERE conversation_id = ?
             ORDER BY turn_index DESC
             LIMIT ?",
        )
        .bind(conversation_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        let mut turns = rows
            .iter()
            .map(|row| decode_turn(conversation_id, row))
            .collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        check_sequence(conversation_id, &turns, None)?;
        Ok(turns)
    }

    /// The whole conversation, oldest first.
    pub async fn all(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>, PipelineError> {
        validate_conversation_id(conversation_id)?;

        let rows = sqlx::query(
            "SELECT conversation_id, turn_index, role, text, created_at
             FROM conversation_turns
             WHERE conversation_id = ?
             ORDER BY turn_index ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        let turns = rows
            .iter()
            .map(|row| decode_turn(conversation_id, row))
            .collect::<Result<Vec<_>, _>>()?;
        check_sequence(conversation_id, &turns, Some(0))?;
        Ok(turns)
    }

    pub async fn turn_count(&self, conversation_id: &str) -> Result<i64, PipelineError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM conversation_turns WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await
            .map_err(PipelineError::storage)
    }

    /// Number of conversations currently holding a lock entry.
    pub fn active_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_turn(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: &str,
    role: Role,
    text: &str,
) -> Result<ConversationTurn, PipelineError> {
    let timestamp = Utc::now().trunc_subsecs(6);

    // The write lock is taken by this first statement, so the index read and
    // the insert see the same snapshot.
    let turn_index: i64 = sqlx::query_scalar(
        "INSERT INTO conversation_turns (conversation_id, turn_index, role, text, created_at)
         SELECT ?1, COALESCE(MAX(turn_index) + 1, 0), ?2, ?3, ?4
         FROM conversation_turns WHERE conversation_id = ?1
         RETURNING turn_index",
    )
    .bind(conversation_id)
    .bind(role.as_str())
    .bind(text)
    .bind(timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
    .fetch_one(&mut **tx)
    .await
    .map_err(PipelineError::storage)?;

    Ok(ConversationTurn {
        conversation_id: conversation_id.to_string(),
        turn_index,
        role,
        text: text.to_string(),
        timestamp,
    })
}

fn validate_conversation_id(conversation_id: &str) -> Result<(), PipelineError> {
    if conversation_id.trim().is_empty() {
        return Err(PipelineError::InvalidArgument(
            "conversation_id must not be empty".to_string(),
        ));
    }
    if conversation_id.len() > 256 {
        return Err(PipelineError::InvalidArgument(
            "conversation_id must be at most 256 bytes".to_string(),
        ));
    }
    Ok(())
}

fn decode_turn(
    conversation_id: &str,
    row: &sqlx::sqlite::SqliteRow,
) -> Result<ConversationTurn, PipelineError> {
    let corrupt = |reason: String| PipelineError::corrupt_history(conversation_id, reason);

    let stored_id: String = row
        .try_get("conversation_id")
        .map_err(|e| corrupt(format!("unreadable conversation_id: {}", e)))?;
    let turn_index: i64 = row
        .try_get("turn_index")
        .map_err(|e| corrupt(format!("unreadable turn_index: {}", e)))?;
    let role: String = row
        .try_get("role")
        .map_err(|e| corrupt(format!("turn {}: unreadable role: {}", turn_index, e)))?;
    let text: String = row
        .try_get("text")
        .map_err(|e| corrupt(format!("turn {}: unreadable text: {}", turn_index, e)))?;
    let created_at: String = row
        .try_get("created_at")
        .map_err(|e| corrupt(format!("turn {}: unreadable timestamp: {}", turn_index, e)))?;

    if stored_id != conversation_id {
        return Err(corrupt(format!("turn {} belongs to '{}'", turn_index, stored_id)));
    }
    if turn_index < 0 {
        return Err(corrupt(format!("negative turn_index {}", turn_index)));
    }
    let role = role
        .parse::<Role>()
        .map_err(|e| corrupt(format!("turn {}: {}", turn_index, e)))?;
    if text.trim().is_empty() {
        return Err(corrupt(format!("turn {}: empty text", turn_index)));
    }
    let timestamp = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| corrupt(format!("turn {}: bad timestamp '{}': {}", turn_index, created_at, e)))?
        .with_timezone(&Utc);

    Ok(ConversationTurn {
        conversation_id: stored_id,
        turn_index,
        role,
        text,
        timestamp,
    })
}

/// Indices must be consecutive; `first` pins where the run starts.
fn check_sequence(
    conversation_id: &str,
    turns: &[ConversationTurn],
    first: Option<i64>,
) -> Result<(), PipelineError> {
    if let (Some(expected), Some(turn)) = (first, turns.first()) {
        if turn.turn_index != expected {
            return Err(PipelineError::corrupt_history(
                conversation_id,
                format!("history starts at turn {}, expected {}", turn.turn_index, expected),
            ));
        }
    }
    for pair in turns.windows(2) {
        if pair[1].turn_index != pair[0].turn_index + 1 {
            return Err(PipelineError::corrupt_history(
                conversation_id,
                format!(
                    "gap between turns {} and {}",
                    pair[0].turn_index, pair[1].turn_index
                ),
            ));
        }
    }
    Ok(())
}
