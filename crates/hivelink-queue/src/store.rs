use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Notify;

use hivelink_core::now_millis;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  message_id TEXT NOT NULL UNIQUE,
  channel TEXT NOT NULL,
  sender TEXT NOT NULL,
  sender_id TEXT,
  body TEXT NOT NULL,
  target_agent TEXT,
  files TEXT NOT NULL DEFAULT '[]',
  conversation_id TEXT,
  from_agent TEXT,
  status TEXT NOT NULL DEFAULT 'pending',
  retry_count INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  claimed_by TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
CREATE INDEX IF NOT EXISTS idx_messages_claim ON messages(status, target_agent, id);

CREATE TABLE IF NOT EXISTS responses (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  message_id TEXT NOT NULL,
  channel TEXT NOT NULL,
  sender TEXT NOT NULL,
  sender_id TEXT,
  body TEXT NOT NULL,
  original_body TEXT NOT NULL DEFAULT '',
  agent TEXT,
  files TEXT NOT NULL DEFAULT '[]',
  metadata TEXT,
  status TEXT NOT NULL DEFAULT 'pending',
  created_at INTEGER NOT NULL,
  acked_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_responses_channel ON responses(channel, status);
CREATE INDEX IF NOT EXISTS idx_responses_created ON responses(created_at);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "processing" => Some(MessageStatus::Processing),
            "completed" => Some(MessageStatus::Completed),
            "dead" => Some(MessageStatus::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Pending,
    Acked,
}

/// A durable inbound message row.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: i64,
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: Option<String>,
    pub body: String,
    pub target_agent: Option<String>,
    pub files: Vec<String>,
    pub conversation_id: Option<String>,
    pub from_agent: Option<String>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl QueuedMessage {
    /// Internal follow-up rows carry a conversation id.
    pub fn is_internal(&self) -> bool {
        self.conversation_id.is_some()
    }
}

/// A durable outbound response row.
#[derive(Debug, Clone)]
pub struct QueuedResponse {
    pub id: i64,
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: Option<String>,
    pub body: String,
    pub original_body: String,
    pub agent: Option<String>,
    pub files: Vec<String>,
    pub metadata: Option<serde_json::Value>,
    pub status: ResponseStatus,
    pub created_at: i64,
    pub acked_at: Option<i64>,
}

/// Input for enqueueing a message.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: Option<String>,
    pub body: String,
    pub target_agent: Option<String>,
    pub files: Vec<String>,
    pub conversation_id: Option<String>,
    pub from_agent: Option<String>,
}

/// Input for enqueueing a response.
#[derive(Debug, Clone, Default)]
pub struct NewResponse {
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: Option<String>,
    pub body: String,
    pub original_body: String,
    pub agent: Option<String>,
    pub files: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Counts for the observability snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueSnapshot {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead: i64,
    pub pending_responses: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate message id: {0}")]
    DuplicateId(String),
    #[error("no such row: {0}")]
    NotFound(i64),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// SQLite-backed queue store. One write connection behind a mutex, plus a
/// read-only connection so queries don't contend with writers (WAL).
pub struct QueueStore {
    conn: Mutex<Connection>,
    read_conn: Mutex<Connection>,
    notify: Arc<Notify>,
}

impl QueueStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;

        // WAL allows concurrent reads while the write connection holds a lock
        let read_conn = Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        read_conn.busy_timeout(Duration::from_secs(2))?;

        Ok(Self {
            conn: Mutex::new(conn),
            read_conn: Mutex::new(read_conn),
            notify: Arc::new(Notify::new()),
        })
    }

    /// Handle the dispatcher awaits for enqueue/retry wakeups.
    pub fn notify_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("QueueStore mutex poisoned")
    }

    fn read_conn(&self) -> MutexGuard<'_, Connection> {
        self.read_conn.lock().expect("QueueStore read_conn mutex poisoned")
    }

    // ============ Messages ============

    /// Append a pending message. Fails with DuplicateId when the client
    /// message id was seen before.
    pub fn enqueue_message(&self, msg: &NewMessage) -> StoreResult<i64> {
        let now = now_millis();
        let files = serde_json::to_string(&msg.files).unwrap_or_else(|_| "[]".to_string());
        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO messages (message_id, channel, sender, sender_id, body, target_agent,
                                   files, conversation_id, from_agent, status, retry_count,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', 0, ?10, ?10)",
            params![
                msg.message_id,
                msg.channel,
                msg.sender,
                msg.sender_id,
                msg.body,
                msg.target_agent,
                files,
                msg.conversation_id,
                msg.from_agent,
                now,
            ],
        );

        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                drop(conn);
                self.notify.notify_one();
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(e, Some(detail)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
                    && detail.contains("messages.message_id") =>
            {
                Err(StoreError::DuplicateId(msg.message_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claim the oldest pending message for an agent. `default`
    /// also claims rows with no target. Two concurrent claimers can never
    /// observe the same row: the whole read-check-write runs inside a
    /// BEGIN IMMEDIATE transaction.
    pub fn claim_next(&self, agent_id: &str) -> StoreResult<Option<QueuedMessage>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                "SELECT * FROM messages
                 WHERE status = 'pending'
                   AND (target_agent = ?1 OR (?1 = 'default' AND target_agent IS NULL))
                 ORDER BY id ASC LIMIT 1",
                params![agent_id],
                row_to_message,
            )
            .optional()?;

        let Some(mut message) = row else {
            tx.commit()?;
            return Ok(None);
        };

        let now = now_millis();
        tx.execute(
            "UPDATE messages SET status = 'processing', claimed_by = ?1, updated_at = ?2
             WHERE id = ?3",
            params![agent_id, now, message.id],
        )?;
        tx.commit()?;

        message.status = MessageStatus::Processing;
        message.claimed_by = Some(agent_id.to_string());
        message.updated_at = now;
        Ok(Some(message))
    }

    pub fn complete_message(&self, id: i64) -> StoreResult<()> {
        let n = self.conn().execute(
            "UPDATE messages SET status = 'completed', claimed_by = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now_millis(), id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Record a processing failure. Below the retry cap the row returns to
    /// pending (claimable immediately); at the cap it goes dead.
    pub fn fail_message(&self, id: i64, error: &str, max_retries: u32) -> StoreResult<MessageStatus> {
        let status;
        {
            let mut conn = self.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let retry_count: u32 = tx
                .query_row(
                    "SELECT retry_count FROM messages WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(StoreError::NotFound(id))?;

            let new_count = retry_count + 1;
            status = if new_count >= max_retries {
                MessageStatus::Dead
            } else {
                MessageStatus::Pending
            };

            tx.execute(
                "UPDATE messages
                 SET status = ?1, retry_count = ?2, last_error = ?3, claimed_by = NULL,
                     updated_at = ?4
                 WHERE id = ?5",
                params![status.as_str(), new_count, error, now_millis(), id],
            )?;
            tx.commit()?;
        }

        if status == MessageStatus::Pending {
            self.notify.notify_one();
        }
        Ok(status)
    }

    /// Distinct agents with pending work; untargeted rows count as `default`.
    pub fn pending_agents(&self) -> StoreResult<Vec<String>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT COALESCE(target_agent, 'default') FROM messages
             WHERE status = 'pending'",
        )?;
        let agents = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    pub fn get_message(&self, id: i64) -> StoreResult<Option<QueuedMessage>> {
        let conn = self.read_conn();
        Ok(conn
            .query_row(
                "SELECT * FROM messages WHERE id = ?1",
                params![id],
                row_to_message,
            )
            .optional()?)
    }

    /// Processing rows whose claim went stale are forced back to pending.
    /// Called at startup and periodically by the maintenance loop.
    pub fn recover_stale(&self, threshold: Duration) -> StoreResult<usize> {
        let cutoff = now_millis() - threshold.as_millis() as i64;
        let n = self.conn().execute(
            "UPDATE messages SET status = 'pending', claimed_by = NULL, updated_at = ?1
             WHERE status = 'processing' AND updated_at < ?2",
            params![now_millis(), cutoff],
        )?;
        if n > 0 {
            self.notify.notify_one();
        }
        Ok(n)
    }

    pub fn prune_completed(&self, retention: Duration) -> StoreResult<usize> {
        let cutoff = now_millis() - retention.as_millis() as i64;
        Ok(self.conn().execute(
            "DELETE FROM messages WHERE status = 'completed' AND updated_at < ?1",
            params![cutoff],
        )?)
    }

    // ============ Dead letter ============

    pub fn dead_messages(&self) -> StoreResult<Vec<QueuedMessage>> {
        let conn = self.read_conn();
        let mut stmt =
            conn.prepare("SELECT * FROM messages WHERE status = 'dead' ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Flip a dead row back to pending with a fresh retry budget.
    /// Returns false when the id does not name a dead row.
    pub fn retry_dead(&self, id: i64) -> StoreResult<bool> {
        let n = self.conn().execute(
            "UPDATE messages
             SET status = 'pending', retry_count = 0, last_error = NULL, claimed_by = NULL,
                 updated_at = ?1
             WHERE id = ?2 AND status = 'dead'",
            params![now_millis(), id],
        )?;
        if n > 0 {
            self.notify.notify_one();
        }
        Ok(n > 0)
    }

    pub fn delete_dead(&self, id: i64) -> StoreResult<bool> {
        let n = self.conn().execute(
            "DELETE FROM messages WHERE id = ?1 AND status = 'dead'",
            params![id],
        )?;
        Ok(n > 0)
    }

    // ============ Responses ============

    pub fn enqueue_response(&self, response: &NewResponse) -> StoreResult<i64> {
        let files = serde_json::to_string(&response.files).unwrap_or_else(|_| "[]".to_string());
        let metadata = response
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO responses (message_id, channel, sender, sender_id, body, original_body,
                                    agent, files, metadata, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10)",
            params![
                response.message_id,
                response.channel,
                response.sender,
                response.sender_id,
                response.body,
                response.original_body,
                response.agent,
                files,
                metadata,
                now_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Unacked responses for a channel, oldest first.
    pub fn pending_responses(&self, channel: &str) -> StoreResult<Vec<QueuedResponse>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM responses WHERE channel = ?1 AND status = 'pending' ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![channel], row_to_response)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Mark a response delivered. Idempotent: acking twice leaves the first
    /// acked_at untouched. NotFound when the id does not exist.
    pub fn ack_response(&self, id: i64) -> StoreResult<bool> {
        let n = self.conn().execute(
            "UPDATE responses SET status = 'acked', acked_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now_millis(), id],
        )?;
        if n > 0 {
            return Ok(true);
        }
        let exists: bool = self.read_conn().query_row(
            "SELECT COUNT(*) > 0 FROM responses WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    /// Most recent responses for observability, newest first.
    pub fn recent_responses(&self, limit: i64) -> StoreResult<Vec<QueuedResponse>> {
        let conn = self.read_conn();
        let mut stmt =
            conn.prepare("SELECT * FROM responses ORDER BY created_at DESC, id DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit], row_to_response)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_response(&self, id: i64) -> StoreResult<Option<QueuedResponse>> {
        let conn = self.read_conn();
        Ok(conn
            .query_row(
                "SELECT * FROM responses WHERE id = ?1",
                params![id],
                row_to_response,
            )
            .optional()?)
    }

    pub fn prune_acked(&self, retention: Duration) -> StoreResult<usize> {
        let cutoff = now_millis() - retention.as_millis() as i64;
        Ok(self.conn().execute(
            "DELETE FROM responses WHERE status = 'acked' AND acked_at < ?1",
            params![cutoff],
        )?)
    }

    // ============ Observability ============

    pub fn snapshot(&self) -> StoreResult<QueueSnapshot> {
        let conn = self.read_conn();
        let mut snapshot = QueueSnapshot::default();

        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM messages GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (status, count) in counts {
            match MessageStatus::parse(&status) {
                Some(MessageStatus::Pending) => snapshot.pending = count,
                Some(MessageStatus::Processing) => snapshot.processing = count,
                Some(MessageStatus::Completed) => snapshot.completed = count,
                Some(MessageStatus::Dead) => snapshot.dead = count,
                None => {}
            }
        }

        snapshot.pending_responses = conn.query_row(
            "SELECT COUNT(*) FROM responses WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;

        Ok(snapshot)
    }
}

/// Forward-compatible column additions for databases created by older builds.
fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let columns: Vec<String> = conn
        .prepare("PRAGMA table_info(responses)")?
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect();

    if !columns.iter().any(|c| c == "metadata") {
        conn.execute_batch("ALTER TABLE responses ADD COLUMN metadata TEXT;")?;
    }

    let msg_columns: Vec<String> = conn
        .prepare("PRAGMA table_info(messages)")?
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect();

    if !msg_columns.iter().any(|c| c == "last_error") {
        conn.execute_batch("ALTER TABLE messages ADD COLUMN last_error TEXT;")?;
    }

    Ok(())
}

fn parse_files(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<QueuedMessage> {
    let status: String = row.get("status")?;
    Ok(QueuedMessage {
        id: row.get("id")?,
        message_id: row.get("message_id")?,
        channel: row.get("channel")?,
        sender: row.get("sender")?,
        sender_id: row.get("sender_id")?,
        body: row.get("body")?,
        target_agent: row.get("target_agent")?,
        files: parse_files(row.get("files")?),
        conversation_id: row.get("conversation_id")?,
        from_agent: row.get("from_agent")?,
        status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Pending),
        retry_count: row.get("retry_count")?,
        last_error: row.get("last_error")?,
        claimed_by: row.get("claimed_by")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_response(row: &rusqlite::Row) -> rusqlite::Result<QueuedResponse> {
    let status: String = row.get("status")?;
    let metadata: Option<String> = row.get("metadata")?;
    Ok(QueuedResponse {
        id: row.get("id")?,
        message_id: row.get("message_id")?,
        channel: row.get("channel")?,
        sender: row.get("sender")?,
        sender_id: row.get("sender_id")?,
        body: row.get("body")?,
        original_body: row.get("original_body")?,
        agent: row.get("agent")?,
        files: parse_files(row.get("files")?),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        status: if status == "acked" {
            ResponseStatus::Acked
        } else {
            ResponseStatus::Pending
        },
        created_at: row.get("created_at")?,
        acked_at: row.get("acked_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, QueueStore) {
        let tmp = TempDir::new().unwrap();
        let store = QueueStore::open(tmp.path().join("queue.db")).unwrap();
        (tmp, store)
    }

    fn message(message_id: &str, target: Option<&str>) -> NewMessage {
        NewMessage {
            message_id: message_id.to_string(),
            channel: "telegram".to_string(),
            sender: "Alice".to_string(),
            sender_id: Some("alice-1".to_string()),
            body: "ping".to_string(),
            target_agent: target.map(|t| t.to_string()),
            ..Default::default()
        }
    }

    fn response(message_id: &str, channel: &str) -> NewResponse {
        NewResponse {
            message_id: message_id.to_string(),
            channel: channel.to_string(),
            sender: "Alice".to_string(),
            body: "pong".to_string(),
            original_body: "ping".to_string(),
            agent: Some("assistant".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_enqueue_and_claim_roundtrip() {
        let (_tmp, store) = open_store();
        store.enqueue_message(&message("m1", None)).unwrap();

        let claimed = store.claim_next("default").unwrap().unwrap();
        assert_eq!(claimed.message_id, "m1");
        assert_eq!(claimed.status, MessageStatus::Processing);
        assert_eq!(claimed.claimed_by.as_deref(), Some("default"));

        // Nothing left to claim
        assert!(store.claim_next("default").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_message_id_rejected() {
        let (_tmp, store) = open_store();
        store.enqueue_message(&message("m1", None)).unwrap();
        let err = store.enqueue_message(&message("m1", None)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "m1"));
    }

    #[test]
    fn test_claim_respects_target() {
        let (_tmp, store) = open_store();
        store.enqueue_message(&message("m1", Some("coder"))).unwrap();
        store.enqueue_message(&message("m2", None)).unwrap();

        // default must not see the targeted row
        let claimed = store.claim_next("default").unwrap().unwrap();
        assert_eq!(claimed.message_id, "m2");

        let claimed = store.claim_next("coder").unwrap().unwrap();
        assert_eq!(claimed.message_id, "m1");
    }

    #[test]
    fn test_claim_is_fifo_per_agent() {
        let (_tmp, store) = open_store();
        for i in 0..5 {
            store
                .enqueue_message(&message(&format!("m{}", i), Some("coder")))
                .unwrap();
        }
        for i in 0..5 {
            let claimed = store.claim_next("coder").unwrap().unwrap();
            assert_eq!(claimed.message_id, format!("m{}", i));
            store.complete_message(claimed.id).unwrap();
        }
    }

    #[test]
    fn test_concurrent_claims_observe_disjoint_rows() {
        let (_tmp, store) = open_store();
        let store = std::sync::Arc::new(store);
        store.enqueue_message(&message("m1", None)).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = std::sync::Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store.claim_next("default").unwrap()
            }));
        }
        let claimed: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| c.is_some())
            .collect();
        assert_eq!(claimed.len(), 1);
    }

    #[test]
    fn test_fail_message_retries_then_dead() {
        let (_tmp, store) = open_store();
        store.enqueue_message(&message("m1", None)).unwrap();

        for attempt in 1..=5u32 {
            let claimed = store.claim_next("default").unwrap().unwrap();
            let status = store.fail_message(claimed.id, "exit code 1", 5).unwrap();
            if attempt < 5 {
                assert_eq!(status, MessageStatus::Pending);
            } else {
                assert_eq!(status, MessageStatus::Dead);
            }
        }

        // Dead rows are not claimable
        assert!(store.claim_next("default").unwrap().is_none());
        let dead = store.dead_messages().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 5);
        assert_eq!(dead[0].last_error.as_deref(), Some("exit code 1"));
        assert!(dead[0].claimed_by.is_none());
    }

    #[test]
    fn test_retry_dead_resets_counters() {
        let (_tmp, store) = open_store();
        store.enqueue_message(&message("m1", None)).unwrap();
        let id = store.claim_next("default").unwrap().unwrap().id;
        for _ in 0..5 {
            let _ = store.fail_message(id, "boom", 5);
            let _ = store.claim_next("default");
        }

        assert!(store.retry_dead(id).unwrap());
        let row = store.get_message(id).unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Pending);
        assert_eq!(row.retry_count, 0);
        assert!(row.last_error.is_none());

        // A pending row is not retryable as dead
        assert!(!store.retry_dead(id).unwrap());
    }

    #[test]
    fn test_delete_dead_only_deletes_dead() {
        let (_tmp, store) = open_store();
        store.enqueue_message(&message("m1", None)).unwrap();
        let id = store.claim_next("default").unwrap().unwrap().id;
        assert!(!store.delete_dead(id).unwrap());

        for _ in 0..5 {
            let _ = store.fail_message(id, "boom", 5);
            let _ = store.claim_next("default");
        }
        assert!(store.delete_dead(id).unwrap());
        assert!(store.get_message(id).unwrap().is_none());
    }

    #[test]
    fn test_recover_stale_resets_old_claims_only() {
        let (_tmp, store) = open_store();
        store.enqueue_message(&message("m1", None)).unwrap();
        store.enqueue_message(&message("m2", None)).unwrap();
        let stale = store.claim_next("default").unwrap().unwrap();
        let fresh = store.claim_next("default").unwrap().unwrap();

        // Backdate the first claim by 15 minutes
        store
            .conn()
            .execute(
                "UPDATE messages SET updated_at = ?1 WHERE id = ?2",
                params![now_millis() - 15 * 60 * 1000, stale.id],
            )
            .unwrap();

        let recovered = store
            .recover_stale(Duration::from_secs(10 * 60))
            .unwrap();
        assert_eq!(recovered, 1);

        let stale_row = store.get_message(stale.id).unwrap().unwrap();
        assert_eq!(stale_row.status, MessageStatus::Pending);
        assert!(stale_row.claimed_by.is_none());

        let fresh_row = store.get_message(fresh.id).unwrap().unwrap();
        assert_eq!(fresh_row.status, MessageStatus::Processing);
    }

    #[test]
    fn test_pending_agents_coalesces_null_to_default() {
        let (_tmp, store) = open_store();
        store.enqueue_message(&message("m1", None)).unwrap();
        store.enqueue_message(&message("m2", Some("coder"))).unwrap();
        store.enqueue_message(&message("m3", Some("coder"))).unwrap();

        let mut agents = store.pending_agents().unwrap();
        agents.sort();
        assert_eq!(agents, vec!["coder".to_string(), "default".to_string()]);
    }

    #[test]
    fn test_ack_response_is_idempotent() {
        let (_tmp, store) = open_store();
        let id = store.enqueue_response(&response("m1", "telegram")).unwrap();

        assert!(store.ack_response(id).unwrap());
        let first = store.get_response(id).unwrap().unwrap();
        assert_eq!(first.status, ResponseStatus::Acked);
        let first_acked_at = first.acked_at.unwrap();

        // Second ack is a no-op and keeps the original timestamp
        assert!(!store.ack_response(id).unwrap());
        let second = store.get_response(id).unwrap().unwrap();
        assert_eq!(second.acked_at, Some(first_acked_at));

        assert!(matches!(
            store.ack_response(9999),
            Err(StoreError::NotFound(9999))
        ));
    }

    #[test]
    fn test_pending_responses_filters_by_channel() {
        let (_tmp, store) = open_store();
        store.enqueue_response(&response("m1", "telegram")).unwrap();
        store.enqueue_response(&response("m2", "discord")).unwrap();
        let acked = store.enqueue_response(&response("m3", "telegram")).unwrap();
        store.ack_response(acked).unwrap();

        let pending = store.pending_responses("telegram").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, "m1");
    }

    #[test]
    fn test_recent_responses_newest_first() {
        let (_tmp, store) = open_store();
        for i in 0..5 {
            store
                .enqueue_response(&response(&format!("m{}", i), "telegram"))
                .unwrap();
        }
        let recent = store.recent_responses(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message_id, "m4");
    }

    #[test]
    fn test_prune_retention() {
        let (_tmp, store) = open_store();
        store.enqueue_message(&message("m1", None)).unwrap();
        let id = store.claim_next("default").unwrap().unwrap().id;
        store.complete_message(id).unwrap();

        let resp_id = store.enqueue_response(&response("m1", "telegram")).unwrap();
        store.ack_response(resp_id).unwrap();

        // Nothing younger than the retention window is pruned
        assert_eq!(store.prune_completed(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(store.prune_acked(Duration::from_secs(3600)).unwrap(), 0);

        let old = now_millis() - 25 * 3600 * 1000;
        store
            .conn()
            .execute("UPDATE messages SET updated_at = ?1", params![old])
            .unwrap();
        store
            .conn()
            .execute("UPDATE responses SET acked_at = ?1", params![old])
            .unwrap();

        assert_eq!(store.prune_completed(Duration::from_secs(24 * 3600)).unwrap(), 1);
        assert_eq!(store.prune_acked(Duration::from_secs(24 * 3600)).unwrap(), 1);
    }

    #[test]
    fn test_dead_rows_survive_pruning() {
        let (_tmp, store) = open_store();
        store.enqueue_message(&message("m1", None)).unwrap();
        let id = store.claim_next("default").unwrap().unwrap().id;
        for _ in 0..5 {
            let _ = store.fail_message(id, "boom", 5);
            let _ = store.claim_next("default");
        }
        store
            .conn()
            .execute(
                "UPDATE messages SET updated_at = ?1",
                params![now_millis() - 48 * 3600 * 1000],
            )
            .unwrap();
        assert_eq!(store.prune_completed(Duration::from_secs(24 * 3600)).unwrap(), 0);
        assert_eq!(store.dead_messages().unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_counts() {
        let (_tmp, store) = open_store();
        store.enqueue_message(&message("m1", None)).unwrap();
        store.enqueue_message(&message("m2", None)).unwrap();
        let claimed = store.claim_next("default").unwrap().unwrap();
        store.complete_message(claimed.id).unwrap();
        store.enqueue_response(&response("m1", "telegram")).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.processing, 0);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.dead, 0);
        assert_eq!(snapshot.pending_responses, 1);
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("queue.db");
        {
            let store = QueueStore::open(&db).unwrap();
            store.enqueue_message(&message("m1", None)).unwrap();
        }
        let store = QueueStore::open(&db).unwrap();
        assert_eq!(store.snapshot().unwrap().pending, 1);
    }
}
