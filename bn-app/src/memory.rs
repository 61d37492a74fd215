//! Durable per-user memory.
//!
//! Facts live in one SQLite table keyed by `(user_id, type, key)`. A [`MemoryContext`] is a
//! read-only snapshot taken at the start of planning and rendered into two prompt blocks.

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const PROFILE_TYPE: &str = "profile";
pub const FACT_TYPE: &str = "fact";

/// Relevant memories fetched for each plan.
pub const CONTEXT_MEMORY_LIMIT: usize = 8;
/// Memories listed by the recall command.
pub const RECALL_LIMIT: usize = 20;

const ROUTER_VALUE_MAX_CHARS: usize = 80;
const ROUTER_TURN_MAX_CHARS: usize = 300;
const WORKER_PROFILE_MAX_CHARS: usize = 200;
const WORKER_VALUE_MAX_CHARS: usize = 60;
const WORKER_TURN_MAX_CHARS: usize = 160;
const WORKER_MEMORY_BULLETS: usize = 6;
const WORKER_MAX_BULLETS: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("memory store lock poisoned")]
    Poisoned,
    #[error("memory task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    pub value: String,
    pub updated_at_ms: i64,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Key/value map of the user's `profile` memories.
    async fn get_profile(&self, user_id: &str) -> Result<BTreeMap<String, String>>;

    /// Keyword match over key and value, newest first. An empty query lists recent memories.
    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryRecord>>;

    async fn list_recent(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryRecord>>;

    /// Last write wins per `(user_id, kind, key)`.
    async fn upsert(&self, user_id: &str, kind: &str, key: &str, value: &str) -> Result<()>;

    /// Removes every memory with this key, whatever its type. Returns the number removed.
    async fn delete_by_key(&self, user_id: &str, key: &str) -> Result<usize>;
}

pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMemoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        ensure_schema(&conn)?;
        tracing::info!(path = %path.display(), "memory store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| MemoryError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| MemoryError::Join(e.to_string()))?
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            type TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_identity
            ON memories(user_id, type, key);
        CREATE INDEX IF NOT EXISTS idx_memories_recent
            ON memories(user_id, updated_at_ms DESC);
        ",
    )?;
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn escape_like(word: &str) -> String {
    let mut out = String::with_capacity(word.len() + 2);
    out.push('%');
    for c in word.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn query_records(conn: &Connection, sql: &str, args: Vec<SqlValue>) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
        Ok(MemoryRecord {
            id: row.get(0)?,
            kind: row.get(1)?,
            key: row.get(2)?,
            value: row.get(3)?,
            updated_at_ms: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn get_profile(&self, user_id: &str) -> Result<BTreeMap<String, String>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT key, value FROM memories WHERE user_id = ?1 AND type = ?2 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![user_id, PROFILE_TYPE], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = BTreeMap::new();
            for row in rows {
                let (k, v) = row?;
                out.insert(k, v);
            }
            Ok(out)
        })
        .await
    }

    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let words: Vec<String> = query
            .split_whitespace()
            .filter(|w| w.chars().count() > 1)
            .map(escape_like)
            .collect();
        if words.is_empty() {
            return self.list_recent(user_id, limit).await;
        }

        let mut args = vec![SqlValue::Text(user_id.to_string())];
        let mut clauses = Vec::with_capacity(words.len());
        for pattern in words {
            let n = args.len();
            clauses.push(format!(
                "(key LIKE ?{} ESCAPE '\\' OR value LIKE ?{} ESCAPE '\\')",
                n + 1,
                n + 1
            ));
            args.push(SqlValue::Text(pattern));
        }
        args.push(SqlValue::Integer(limit as i64));
        let sql = format!(
            "SELECT id, type, key, value, updated_at_ms FROM memories \
             WHERE user_id = ?1 AND ({}) \
             ORDER BY updated_at_ms DESC, id DESC LIMIT ?{}",
            clauses.join(" OR "),
            args.len()
        );
        self.with_conn(move |conn| query_records(conn, &sql, args)).await
    }

    async fn list_recent(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let args = vec![
            SqlValue::Text(user_id.to_string()),
            SqlValue::Integer(limit as i64),
        ];
        self.with_conn(move |conn| {
            query_records(
                conn,
                "SELECT id, type, key, value, updated_at_ms FROM memories \
                 WHERE user_id = ?1 ORDER BY updated_at_ms DESC, id DESC LIMIT ?2",
                args,
            )
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, value))]
    async fn upsert(&self, user_id: &str, kind: &str, key: &str, value: &str) -> Result<()> {
        let (user_id, kind, key, value) = (
            user_id.to_string(),
            kind.to_string(),
            key.to_string(),
            value.to_string(),
        );
        self.with_conn(move |conn| {
            let now = now_ms();
            conn.execute(
                "INSERT INTO memories (user_id, type, key, value, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(user_id, type, key) DO UPDATE SET
                   value = excluded.value,
                   updated_at_ms = excluded.updated_at_ms",
                params![user_id, kind, key, value, now],
            )?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_by_key(&self, user_id: &str, key: &str) -> Result<usize> {
        let (user_id, key) = (user_id.to_string(), key.to_string());
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM memories WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
            )?)
        })
        .await
    }
}

/// Snapshot of what Benjamin knows about a user, taken once per plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryContext {
    pub profile: BTreeMap<String, String>,
    pub relevant: Vec<MemoryRecord>,
    /// Rolling conversation window, oldest first.
    pub recent_turns: Vec<String>,
}

impl MemoryContext {
    /// Reads profile and relevant memories. Store failures degrade to an empty part.
    pub async fn load(
        store: &dyn MemoryStore,
        user_id: &str,
        message: &str,
        recent_turns: Vec<String>,
    ) -> Self {
        let profile = store.get_profile(user_id).await.unwrap_or_else(|e| {
            tracing::warn!(%e, user_id, "profile read failed");
            BTreeMap::new()
        });
        let relevant = store
            .search(user_id, message, CONTEXT_MEMORY_LIMIT)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(%e, user_id, "memory search failed");
                Vec::new()
            })
            .into_iter()
            .filter(|m| m.kind != PROFILE_TYPE)
            .collect();
        Self {
            profile,
            relevant,
            recent_turns,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.profile.is_empty() && self.relevant.is_empty() && self.recent_turns.is_empty()
    }

    fn profile_json(&self) -> String {
        serde_json::to_string(&self.profile).unwrap_or_default()
    }

    pub fn format_for_router(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut lines = vec!["Context about user:".to_string()];
        if !self.profile.is_empty() {
            lines.push(format!("[Profile] {}", self.profile_json()));
        }
        for m in self.relevant.iter().take(CONTEXT_MEMORY_LIMIT) {
            lines.push(format!(
                "[Memory] {}: {}",
                m.key,
                clip(&m.value, ROUTER_VALUE_MAX_CHARS)
            ));
        }
        for turn in &self.recent_turns {
            lines.push(format!("[Recent] {}", clip(turn, ROUTER_TURN_MAX_CHARS)));
        }
        lines.push(String::new());
        lines.join("\n")
    }

    /// Compact prefix for generation prompts, at most twelve bullets.
    pub fn format_for_worker(&self) -> String {
        let mut bullets = Vec::new();
        if !self.profile.is_empty() {
            bullets.push(format!(
                "Profile: {}",
                clip(&self.profile_json(), WORKER_PROFILE_MAX_CHARS)
            ));
        }
        for m in self.relevant.iter().take(WORKER_MEMORY_BULLETS) {
            bullets.push(format!("{}: {}", m.key, clip(&m.value, WORKER_VALUE_MAX_CHARS)));
        }
        for turn in &self.recent_turns {
            bullets.push(format!("Recent: {}", clip(turn, WORKER_TURN_MAX_CHARS)));
        }
        bullets.truncate(WORKER_MAX_BULLETS);
        if bullets.is_empty() {
            return String::new();
        }
        let body: Vec<String> = bullets.iter().map(|b| format!("- {}", b.trim())).collect();
        format!("User context:\n{}\n\n", body.join("\n"))
    }
}

fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
