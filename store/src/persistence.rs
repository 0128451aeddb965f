//! Async persistence tier: durable, indexed message storage in SQLite.
//!
//! One record table keyed by message id, with an index on the session and a
//! composite `(session_id, timestamp, id)` index that serves ordered scans in
//! both directions. The full message is stored as JSON in `body`; the indexed
//! columns are denormalized copies.
//!
//! `rusqlite` is synchronous, so every operation runs on the blocking pool
//! against a single connection guarded by a mutex.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tokio::sync::OnceCell;

use quill_config::PersistenceConfig;
use quill_types::{Message, MessageId, SessionId, Timestamp};

use crate::buffer::{FlushFut, FlushSink};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::sqlite_util::open_connection;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        role TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_session
    ON messages(session_id);

    CREATE INDEX IF NOT EXISTS idx_messages_session_time
    ON messages(session_id, timestamp, id);
";

#[derive(Debug, Default)]
struct PersistState {
    last_flush: Option<Timestamp>,
    last_error: Option<String>,
}

pub struct AsyncPersistence {
    path: Option<PathBuf>,
    batch_size: usize,
    retry: RetryPolicy,
    conn: OnceCell<Arc<Mutex<Connection>>>,
    state: Mutex<PersistState>,
}

impl std::fmt::Debug for AsyncPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPersistence")
            .field("path", &self.path)
            .field("batch_size", &self.batch_size)
            .field("initialized", &self.conn.initialized())
            .finish_non_exhaustive()
    }
}

impl AsyncPersistence {
    #[must_use]
    pub fn new(config: &PersistenceConfig) -> Self {
        Self {
            path: config.database_path.clone(),
            batch_size: config.batch_size.max(1),
            retry: RetryPolicy::from_config(config),
            conn: OnceCell::new(),
            state: Mutex::new(PersistState::default()),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Open or create the database and its schema. Idempotent: concurrent and
    /// repeated calls share a single open.
    pub async fn init(&self) -> Result<()> {
        self.conn
            .get_or_try_init(|| async {
                let path = self.path.clone();
                let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
                    let conn = open_connection(path.as_deref())?;
                    initialize_schema(&conn)?;
                    Ok(conn)
                })
                .await
                .context("persistence init task panicked")??;
                tracing::info!(path = ?self.path, "Message database ready");
                Ok::<_, anyhow::Error>(Arc::new(Mutex::new(conn)))
            })
            .await?;
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.conn.initialized()
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self
            .conn
            .get()
            .cloned()
            .ok_or_else(|| anyhow!("persistence used before init()"))?;
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            op(&mut guard)
        })
        .await
        .context("persistence task panicked")?
    }

    /// Persist a batch in one transaction: all messages become durable or none do.
    pub async fn write(&self, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .context("Failed to start message write transaction")?;
            insert_messages(&tx, &messages)?;
            tx.commit().context("Failed to commit message batch")
        })
        .await
    }

    /// `write` in fixed-size chunks, each retried with exponential backoff.
    /// Chunks already committed stay committed if a later chunk fails; writes
    /// are upserts, so replaying the whole batch later is harmless.
    pub async fn write_with_retry(&self, messages: &[Message]) -> Result<()> {
        for chunk in messages.chunks(self.batch_size) {
            let result = retry_with_backoff(&self.retry, "persist messages", || {
                self.write(chunk.to_vec())
            })
            .await;
            if let Err(err) = result {
                self.state.lock().last_error = Some(format!("{err:#}"));
                return Err(err);
            }
        }
        let mut state = self.state.lock();
        state.last_flush = Some(Timestamp::now());
        state.last_error = None;
        Ok(())
    }

    /// Up to `limit` newest messages of a session, returned oldest first.
    pub async fn read(&self, session_id: &SessionId, limit: Option<usize>) -> Result<Vec<Message>> {
        let session = session_id.as_str().to_owned();
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT body FROM messages
                     WHERE session_id = ?1
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?2",
                )
                .context("Failed to prepare session read")?;
            let rows = stmt
                .query_map(params![session, limit], |row| row.get::<_, String>(0))
                .context("Failed to query session messages")?;
            let mut messages = decode_rows(rows)?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    /// All messages of a session strictly inside the optional time bounds,
    /// oldest first.
    pub async fn read_range(
        &self,
        session_id: &SessionId,
        after: Option<Timestamp>,
        before: Option<Timestamp>,
    ) -> Result<Vec<Message>> {
        let session = session_id.as_str().to_owned();
        let after = after.map_or(i64::MIN, Timestamp::as_micros);
        let before = before.map_or(i64::MAX, Timestamp::as_micros);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT body FROM messages
                     WHERE session_id = ?1 AND timestamp > ?2 AND timestamp < ?3
                     ORDER BY timestamp ASC, id ASC",
                )
                .context("Failed to prepare range read")?;
            let rows = stmt
                .query_map(params![session, after, before], |row| {
                    row.get::<_, String>(0)
                })
                .context("Failed to query message range")?;
            decode_rows(rows)
        })
        .await
    }

    pub async fn get(&self, message_id: &MessageId) -> Result<Option<Message>> {
        let id = message_id.as_str().to_owned();
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row("SELECT body FROM messages WHERE id = ?1", [&id], |row| {
                    row.get(0)
                })
                .optional()
                .context("Failed to query message")?;
            body.map(|b| decode_body(&b)).transpose()
        })
        .await
    }

    /// Returns whether the id existed.
    pub async fn delete(&self, message_id: &MessageId) -> Result<bool> {
        let id = message_id.as_str().to_owned();
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM messages WHERE id = ?1", [&id])
                .context("Failed to delete message")?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn delete_many(&self, message_ids: &[MessageId]) -> Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = message_ids.iter().map(|id| id.as_str().to_owned()).collect();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .context("Failed to start delete transaction")?;
            let removed = delete_ids(&tx, &ids)?;
            tx.commit().context("Failed to commit delete")?;
            Ok(removed)
        })
        .await
    }

    /// Delete every message of a session, one `batch_size` chunk per
    /// transaction, until the session index yields nothing.
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<usize> {
        let session = session_id.as_str().to_owned();
        let chunk = i64::try_from(self.batch_size).unwrap_or(i64::MAX);
        let removed = self
            .with_conn(move |conn| {
                let mut total = 0;
                loop {
                    let tx = conn
                        .transaction()
                        .context("Failed to start session delete transaction")?;
                    let ids: Vec<String> = {
                        let mut stmt = tx
                            .prepare_cached(
                                "SELECT id FROM messages WHERE session_id = ?1 LIMIT ?2",
                            )
                            .context("Failed to prepare session id scan")?;
                        stmt.query_map(params![session, chunk], |row| row.get(0))
                            .context("Failed to scan session ids")?
                            .collect::<rusqlite::Result<_>>()
                            .context("Failed to read session id row")?
                    };
                    if ids.is_empty() {
                        break;
                    }
                    total += delete_ids(&tx, &ids)?;
                    tx.commit().context("Failed to commit session delete chunk")?;
                }
                Ok(total)
            })
            .await?;
        tracing::debug!(session_id = %session_id, removed, "Deleted persisted session");
        Ok(removed)
    }

    pub async fn count(&self, session_id: Option<&SessionId>) -> Result<usize> {
        let session = session_id.map(|s| s.as_str().to_owned());
        self.with_conn(move |conn| {
            let count: i64 = match session {
                Some(session) => conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                    [&session],
                    |row| row.get(0),
                ),
                None => conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0)),
            }
            .context("Failed to count messages")?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    pub async fn session_ids(&self) -> Result<Vec<SessionId>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT session_id FROM messages ORDER BY session_id")
                .context("Failed to prepare session listing")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("Failed to list sessions")?;
            let mut sessions = Vec::new();
            for row in rows {
                let raw = row.context("Failed to read session row")?;
                match SessionId::new(raw) {
                    Ok(id) => sessions.push(id),
                    Err(_) => tracing::warn!("Skipping blank session id in message database"),
                }
            }
            Ok(sessions)
        })
        .await
    }

    #[must_use]
    pub fn last_flush(&self) -> Option<Timestamp> {
        self.state.lock().last_flush
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }
}

impl FlushSink for AsyncPersistence {
    fn persist<'a>(&'a self, batch: &'a [Message]) -> FlushFut<'a> {
        Box::pin(self.write_with_retry(batch))
    }

    fn purge<'a>(&'a self, ids: &'a [MessageId]) -> FlushFut<'a> {
        Box::pin(async move { self.delete_many(ids).await.map(|_| ()) })
    }
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
        .context("Failed to set message database pragmas")?;
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("Failed to read schema version")?;
    if version > SCHEMA_VERSION {
        return Err(anyhow!(
            "message database schema version {version} is newer than supported {SCHEMA_VERSION}"
        ));
    }
    conn.execute_batch(SCHEMA)
        .context("Failed to create message schema")?;
    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .context("Failed to record schema version")?;
        tracing::debug!(from = version, to = SCHEMA_VERSION, "Message schema initialized");
    }
    Ok(())
}

fn insert_messages(tx: &Transaction<'_>, messages: &[Message]) -> Result<()> {
    let mut stmt = tx
        .prepare_cached(
            "INSERT OR REPLACE INTO messages (id, session_id, timestamp, role, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .context("Failed to prepare message insert")?;
    for message in messages {
        let body = serde_json::to_string(message)
            .with_context(|| format!("Failed to encode message {}", message.id))?;
        stmt.execute(params![
            message.id.as_str(),
            message.session_id.as_str(),
            message.timestamp.as_micros(),
            message.role.as_str(),
            body
        ])
        .with_context(|| format!("Failed to insert message {}", message.id))?;
    }
    Ok(())
}

fn delete_ids(tx: &Transaction<'_>, ids: &[String]) -> Result<usize> {
    let mut stmt = tx
        .prepare_cached("DELETE FROM messages WHERE id = ?1")
        .context("Failed to prepare message delete")?;
    let mut removed = 0;
    for id in ids {
        removed += stmt
            .execute([id])
            .with_context(|| format!("Failed to delete message {id}"))?;
    }
    Ok(removed)
}

fn decode_body(body: &str) -> Result<Message> {
    serde_json::from_str(body).context("Failed to decode stored message")
}

fn decode_rows<I>(rows: I) -> Result<Vec<Message>>
where
    I: Iterator<Item = rusqlite::Result<String>>,
{
    rows.map(|row| {
        let body = row.context("Failed to read message row")?;
        decode_body(&body)
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_types::{MediaItem, NewMessage, Role};

    fn session(name: &str) -> SessionId {
        SessionId::new(name).unwrap()
    }

    fn message(session_id: &SessionId, id: &str, ts: i64) -> Message {
        Message::from_input(
            NewMessage::user(session_id.clone(), format!("content {id}")),
            MessageId::from_raw(id),
            Timestamp::from_micros(ts),
        )
    }

    async fn open() -> AsyncPersistence {
        let persistence = AsyncPersistence::new(&PersistenceConfig {
            batch_size: 3,
            ..PersistenceConfig::in_memory()
        })
        .with_retry_policy(RetryPolicy::immediate(1));
        persistence.init().await.expect("init");
        persistence
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let persistence = open().await;
        persistence.init().await.expect("second init");
        assert!(persistence.is_initialized());
        assert_eq!(persistence.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn operations_before_init_fail() {
        let persistence = AsyncPersistence::new(&PersistenceConfig::in_memory());
        let err = persistence.count(None).await.expect_err("not initialized");
        assert!(err.to_string().contains("before init"));
    }

    #[tokio::test]
    async fn read_returns_newest_in_forward_order() {
        let persistence = open().await;
        let s = session("s1");
        // Insert out of order on purpose.
        persistence
            .write(vec![message(&s, "c", 30), message(&s, "a", 10), message(&s, "b", 20)])
            .await
            .unwrap();

        let all = persistence.read(&s, None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);

        let newest = persistence.read(&s, Some(2)).await.unwrap();
        let ids: Vec<_> = newest.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);
    }

    #[tokio::test]
    async fn write_is_upsert_and_roundtrips_full_message() {
        let persistence = open().await;
        let s = session("s1");
        let mut original = Message::from_input(
            NewMessage::new(s.clone(), Role::Assistant, "v1")
                .with_media(vec![MediaItem::image("https://x/1.png").with_prompt("a cat")]),
            MessageId::from_raw("m"),
            Timestamp::from_micros(5),
        );
        persistence.write(vec![original.clone()]).await.unwrap();
        original.content = "v2".into();
        persistence.write(vec![original.clone()]).await.unwrap();

        assert_eq!(persistence.count(Some(&s)).await.unwrap(), 1);
        let stored = persistence.get(&original.id).await.unwrap().expect("stored");
        assert_eq!(stored, original);
    }

    #[tokio::test]
    async fn read_range_is_exclusive() {
        let persistence = open().await;
        let s = session("s1");
        persistence
            .write((1..=5).map(|i| message(&s, &format!("m{i}"), i)).collect())
            .await
            .unwrap();

        let range = persistence
            .read_range(&s, Some(Timestamp::from_micros(1)), Some(Timestamp::from_micros(4)))
            .await
            .unwrap();
        let ids: Vec<_> = range.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m2", "m3"]);
    }

    #[tokio::test]
    async fn delete_session_removes_every_chunk() {
        let persistence = open().await;
        let doomed = session("doomed");
        let kept = session("kept");
        persistence
            .write((0..10).map(|i| message(&doomed, &format!("d{i}"), i)).collect())
            .await
            .unwrap();
        persistence.write(vec![message(&kept, "k", 1)]).await.unwrap();

        let removed = persistence.delete_session(&doomed).await.unwrap();
        assert_eq!(removed, 10);
        assert_eq!(persistence.count(Some(&doomed)).await.unwrap(), 0);
        assert_eq!(persistence.count(None).await.unwrap(), 1);
        assert_eq!(persistence.session_ids().await.unwrap(), vec![kept]);
    }

    #[tokio::test]
    async fn point_delete_reports_existence() {
        let persistence = open().await;
        let s = session("s1");
        persistence.write(vec![message(&s, "a", 1)]).await.unwrap();

        assert!(persistence.delete(&MessageId::from_raw("a")).await.unwrap());
        assert!(!persistence.delete(&MessageId::from_raw("a")).await.unwrap());
    }

    #[tokio::test]
    async fn write_with_retry_records_flush_time() {
        let persistence = open().await;
        let s = session("s1");
        let batch: Vec<_> = (0..7).map(|i| message(&s, &format!("m{i}"), i)).collect();

        persistence.write_with_retry(&batch).await.unwrap();
        assert_eq!(persistence.count(Some(&s)).await.unwrap(), 7);
        assert!(persistence.last_flush().is_some());
        assert!(persistence.last_error().is_none());
    }

    #[tokio::test]
    async fn reopening_file_keeps_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PersistenceConfig {
            database_path: Some(dir.path().join("messages.db")),
            ..PersistenceConfig::in_memory()
        };
        let s = session("s1");
        {
            let persistence = AsyncPersistence::new(&config);
            persistence.init().await.unwrap();
            persistence.write(vec![message(&s, "a", 1)]).await.unwrap();
        }
        let persistence = AsyncPersistence::new(&config);
        persistence.init().await.unwrap();
        assert_eq!(persistence.read(&s, None).await.unwrap().len(), 1);
    }
}
