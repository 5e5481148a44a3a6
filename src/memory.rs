//! Session memory: conversation turns and the TTL-bound query cache.
//!
//! Cached answers live in the `contexts` table under the reserved
//! `GLOBAL_SCOPE` session, keyed by a normalized hash of the question and
//! dataset. An expired entry behaves as a miss and is deleted
//! opportunistically on read.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::{ContextEntry, ContextType, Interaction, RecentContext, Session};

/// Session scope for entries not tied to any conversation, such as the
/// query cache.
pub const GLOBAL_SCOPE: &str = "global";

/// Cache key for a (question, dataset) pair: case- and whitespace-normalized
/// so trivially restated questions hit the same entry.
pub fn cache_key(question: &str, source_id: &str) -> String {
    let normalized = format!("{}|{}", question.trim().to_lowercase(), source_id);
    let digest = Sha256::digest(normalized.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("query:{}", &hex[..32])
}

/// Abstract conversation and cache store.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn create_session(&self, metadata: serde_json::Value) -> Result<Session>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Append a turn; the turn index is assigned monotonically per session.
    async fn save_interaction(
        &self,
        session_id: &str,
        question: &str,
        answer: &str,
        processing_time_ms: i64,
        metadata: serde_json::Value,
    ) -> Result<Interaction>;

    /// Fetch a context entry of the given type; expired entries are treated
    /// as absent, and an entry of a different type under the same key is
    /// never returned.
    async fn get_context(
        &self,
        session_id: &str,
        context_type: ContextType,
        key: &str,
    ) -> Result<Option<ContextEntry>>;

    async fn save_context(
        &self,
        session_id: &str,
        key: &str,
        context_type: ContextType,
        data: &serde_json::Value,
        ttl_hours: Option<i64>,
    ) -> Result<()>;

    /// Interactions within the session from the last `hours`, oldest first,
    /// plus the session's unexpired data-context entries.
    async fn recall_recent(&self, session_id: &str, hours: i64) -> Result<RecentContext>;
}

// ============ SQLite backend ============

pub struct SqliteMemoryStore {
    pool: SqlitePool,
}

impl SqliteMemoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn create_session(&self, metadata: serde_json::Value) -> Result<Session> {
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            metadata,
        };
        sqlx::query("INSERT INTO sessions (session_id, created_at, metadata) VALUES (?, ?, ?)")
            .bind(&session.session_id)
            .bind(session.created_at.timestamp())
            .bind(serde_json::to_string(&session.metadata)?)
            .execute(&self.pool)
            .await?;
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row =
            sqlx::query("SELECT session_id, created_at, metadata FROM sessions WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(row) = row else { return Ok(None) };
        let metadata: String = row.get("metadata");
        Ok(Some(Session {
            session_id: row.get("session_id"),
            created_at: timestamp_to_utc(row.get("created_at")),
            metadata: serde_json::from_str(&metadata)?,
        }))
    }

    async fn save_interaction(
        &self,
        session_id: &str,
        question: &str,
        answer: &str,
        processing_time_ms: i64,
        metadata: serde_json::Value,
    ) -> Result<Interaction> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(turn_index), -1) + 1 AS next FROM interactions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        let turn_index: i64 = row.get("next");

        let interaction = Interaction {
            session_id: session_id.to_string(),
            turn_index,
            question: question.to_string(),
            answer: answer.to_string(),
            processing_time_ms,
            metadata,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO interactions
                (session_id, turn_index, question, answer, processing_time_ms, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&interaction.session_id)
        .bind(interaction.turn_index)
        .bind(&interaction.question)
        .bind(&interaction.answer)
        .bind(interaction.processing_time_ms)
        .bind(serde_json::to_string(&interaction.metadata)?)
        .bind(interaction.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(interaction)
    }

    async fn get_context(
        &self,
        session_id: &str,
        context_type: ContextType,
        key: &str,
    ) -> Result<Option<ContextEntry>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, context_type, context_key, context_data, expires_at
            FROM contexts WHERE session_id = ? AND context_key = ? AND context_type = ?
            "#,
        )
        .bind(session_id)
        .bind(key)
        .bind(context_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };

        let expires_at: Option<i64> = row.get("expires_at");
        if let Some(expiry) = expires_at {
            if expiry <= Utc::now().timestamp() {
                debug!("context {} expired, deleting", key);
                sqlx::query("DELETE FROM contexts WHERE session_id = ? AND context_key = ?")
                    .bind(session_id)
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
                return Ok(None);
            }
        }

        let context_type: String = row.get("context_type");
        let data: String = row.get("context_data");
        Ok(Some(ContextEntry {
            session_id: row.get("session_id"),
            context_type: parse_context_type(&context_type)?,
            context_key: row.get("context_key"),
            context_data: serde_json::from_str(&data)?,
            expires_at: expires_at.map(timestamp_to_utc),
        }))
    }

    async fn save_context(
        &self,
        session_id: &str,
        key: &str,
        context_type: ContextType,
        data: &serde_json::Value,
        ttl_hours: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now();
        let expires = ttl_hours.map(|h| (now + Duration::hours(h.max(0))).timestamp());
        sqlx::query(
            r#"
            INSERT INTO contexts (session_id, context_key, context_type, context_data, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, context_key) DO UPDATE SET
                context_type = excluded.context_type,
                context_data = excluded.context_data,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(session_id)
        .bind(key)
        .bind(context_type.as_str())
        .bind(serde_json::to_string(data)?)
        .bind(now.timestamp())
        .bind(expires)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recall_recent(&self, session_id: &str, hours: i64) -> Result<RecentContext> {
        let since = (Utc::now() - Duration::hours(hours.max(0))).timestamp();
        let rows = sqlx::query(
            r#"
            SELECT session_id, turn_index, question, answer, processing_time_ms, metadata, created_at
            FROM interactions
            WHERE session_id = ? AND created_at >= ?
            ORDER BY turn_index ASC
            "#,
        )
        .bind(session_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut recent_messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let metadata: String = row.get("metadata");
            recent_messages.push(Interaction {
                session_id: row.get("session_id"),
                turn_index: row.get("turn_index"),
                question: row.get("question"),
                answer: row.get("answer"),
                processing_time_ms: row.get("processing_time_ms"),
                metadata: serde_json::from_str(&metadata)?,
                created_at: timestamp_to_utc(row.get("created_at")),
            });
        }

        let data_rows = sqlx::query(
            r#"
            SELECT context_key, context_data FROM contexts
            WHERE session_id = ? AND context_type = 'DATA'
              AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(session_id)
        .bind(Utc::now().timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut data_context = HashMap::new();
        for row in &data_rows {
            let key: String = row.get("context_key");
            let data: String = row.get("context_data");
            data_context.insert(key, serde_json::from_str(&data)?);
        }

        Ok(RecentContext {
            recent_messages,
            data_context,
        })
    }
}

fn timestamp_to_utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

fn parse_context_type(s: &str) -> Result<ContextType> {
    match s {
        "CACHE" => Ok(ContextType::Cache),
        "DATA" => Ok(ContextType::Data),
        "RELEVANCE" => Ok(ContextType::Relevance),
        other => Err(CoreError::Storage(format!("unknown context type: {}", other))),
    }
}

// ============ In-memory backend ============

/// In-memory memory store for tests.
pub struct InMemoryMemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, Session>,
    interactions: Vec<Interaction>,
    contexts: HashMap<(String, String), (ContextEntry, DateTime<Utc>)>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
        }
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(entry: &ContextEntry) -> bool {
    entry.expires_at.is_some_and(|e| e <= Utc::now())
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn create_session(&self, metadata: serde_json::Value) -> Result<Session> {
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            metadata,
        };
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.inner.lock().unwrap().sessions.get(session_id).cloned())
    }

    async fn save_interaction(
        &self,
        session_id: &str,
        question: &str,
        answer: &str,
        processing_time_ms: i64,
        metadata: serde_json::Value,
    ) -> Result<Interaction> {
        let mut inner = self.inner.lock().unwrap();
        let turn_index = inner
            .interactions
            .iter()
            .filter(|i| i.session_id == session_id)
            .map(|i| i.turn_index)
            .max()
            .map_or(0, |n| n + 1);
        let interaction = Interaction {
            session_id: session_id.to_string(),
            turn_index,
            question: question.to_string(),
            answer: answer.to_string(),
            processing_time_ms,
            metadata,
            created_at: Utc::now(),
        };
        inner.interactions.push(interaction.clone());
        Ok(interaction)
    }

    async fn get_context(
        &self,
        session_id: &str,
        context_type: ContextType,
        key: &str,
    ) -> Result<Option<ContextEntry>> {
        let mut inner = self.inner.lock().unwrap();
        let map_key = (session_id.to_string(), key.to_string());
        match inner.contexts.get(&map_key) {
            Some((entry, _)) if is_expired(entry) => {
                inner.contexts.remove(&map_key);
                Ok(None)
            }
            Some((entry, _)) if entry.context_type == context_type => Ok(Some(entry.clone())),
            _ => Ok(None),
        }
    }

    async fn save_context(
        &self,
        session_id: &str,
        key: &str,
        context_type: ContextType,
        data: &serde_json::Value,
        ttl_hours: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now();
        let entry = ContextEntry {
            session_id: session_id.to_string(),
            context_type,
            context_key: key.to_string(),
            context_data: data.clone(),
            expires_at: ttl_hours.map(|h| now + Duration::hours(h.max(0))),
        };
        self.inner
            .lock()
            .unwrap()
            .contexts
            .insert((session_id.to_string(), key.to_string()), (entry, now));
        Ok(())
    }

    async fn recall_recent(&self, session_id: &str, hours: i64) -> Result<RecentContext> {
        let inner = self.inner.lock().unwrap();
        let since = Utc::now() - Duration::hours(hours.max(0));
        let mut turns: Vec<Interaction> = inner
            .interactions
            .iter()
            .filter(|i| i.session_id == session_id && i.created_at >= since)
            .cloned()
            .collect();
        turns.sort_by_key(|i| i.turn_index);

        let mut data_context = HashMap::new();
        for ((sid, key), (entry, _)) in &inner.contexts {
            if sid == session_id && entry.context_type == ContextType::Data && !is_expired(entry) {
                data_context.insert(key.clone(), entry.context_data.clone());
            }
        }

        Ok(RecentContext {
            recent_messages: turns,
            data_context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_normalizes_case_and_whitespace() {
        let a = cache_key("  What is the MEAN age? ", "census");
        let b = cache_key("what is the mean age?", "census");
        assert_eq!(a, b);
        assert!(a.starts_with("query:"));
    }

    #[test]
    fn test_cache_key_distinguishes_sources() {
        assert_ne!(cache_key("mean age?", "census"), cache_key("mean age?", "sales"));
    }

    #[tokio::test]
    async fn test_turn_index_is_monotonic_per_session() {
        let store = InMemoryMemoryStore::new();
        let s1 = store.create_session(serde_json::json!({})).await.unwrap();
        let s2 = store.create_session(serde_json::json!({})).await.unwrap();

        let a = store
            .save_interaction(&s1.session_id, "q1", "a1", 5, serde_json::json!({}))
            .await
            .unwrap();
        let b = store
            .save_interaction(&s1.session_id, "q2", "a2", 5, serde_json::json!({}))
            .await
            .unwrap();
        let c = store
            .save_interaction(&s2.session_id, "q1", "a1", 5, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(a.turn_index, 0);
        assert_eq!(b.turn_index, 1);
        assert_eq!(c.turn_index, 0);
    }

    #[tokio::test]
    async fn test_expired_context_is_a_miss() {
        let store = InMemoryMemoryStore::new();
        store
            .save_context(GLOBAL_SCOPE, "k", ContextType::Cache, &serde_json::json!({"x": 1}), Some(0))
            .await
            .unwrap();
        assert!(store
            .get_context(GLOBAL_SCOPE, ContextType::Cache, "k")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_live_context_roundtrip() {
        let store = InMemoryMemoryStore::new();
        let value = serde_json::json!({"answer": "42"});
        store
            .save_context(GLOBAL_SCOPE, "k", ContextType::Cache, &value, Some(24))
            .await
            .unwrap();
        let entry = store
            .get_context(GLOBAL_SCOPE, ContextType::Cache, "k")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.context_data, value);
        assert_eq!(entry.context_type, ContextType::Cache);
    }

    #[tokio::test]
    async fn test_lookup_is_scoped_to_the_context_type() {
        let store = InMemoryMemoryStore::new();
        store
            .save_context("s1", "k", ContextType::Data, &serde_json::json!({"rows": 7}), None)
            .await
            .unwrap();

        assert!(store
            .get_context("s1", ContextType::Cache, "k")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_context("s1", ContextType::Data, "k")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_context_without_ttl_never_expires() {
        let store = InMemoryMemoryStore::new();
        store
            .save_context("s1", "profile", ContextType::Data, &serde_json::json!({"cols": 31}), None)
            .await
            .unwrap();
        assert!(store
            .get_context("s1", ContextType::Data, "profile")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_recall_recent_orders_oldest_first() {
        let store = InMemoryMemoryStore::new();
        let s = store.create_session(serde_json::json!({})).await.unwrap();
        store
            .save_interaction(&s.session_id, "first", "a", 5, serde_json::json!({}))
            .await
            .unwrap();
        store
            .save_interaction(&s.session_id, "second", "b", 5, serde_json::json!({}))
            .await
            .unwrap();

        let ctx = store.recall_recent(&s.session_id, 24).await.unwrap();
        assert_eq!(ctx.recent_messages.len(), 2);
        assert_eq!(ctx.recent_messages[0].question, "first");
        assert_eq!(ctx.recent_messages[1].question, "second");
    }

    #[tokio::test]
    async fn test_recall_recent_includes_session_data_context() {
        let store = InMemoryMemoryStore::new();
        let s = store.create_session(serde_json::json!({})).await.unwrap();
        store
            .save_context(&s.session_id, "dataset_profile", ContextType::Data, &serde_json::json!({"rows": 400}), Some(24))
            .await
            .unwrap();
        store
            .save_context(&s.session_id, "scratch", ContextType::Relevance, &serde_json::json!(0.9), Some(24))
            .await
            .unwrap();

        let ctx = store.recall_recent(&s.session_id, 24).await.unwrap();
        assert_eq!(ctx.data_context.len(), 1);
        assert_eq!(ctx.data_context["dataset_profile"]["rows"], 400);
    }
}
