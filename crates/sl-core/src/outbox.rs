//! Durable per-node command queue owned by the hub.
//!
//! Every command addressed to a node is written here before any delivery is
//! attempted, so a node that is offline (or drops mid-delivery) still gets it
//! on its next connection. Entry lifecycle:
//!
//! ```text
//! Pending --claim--> Sent --ack ok--> Completed
//!    ^                 |  --ack err-> Failed
//!    +--revert_sent----+
//! ```

use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "Pending",
            OutboxStatus::Sent => "Sent",
            OutboxStatus::Completed => "Completed",
            OutboxStatus::Failed => "Failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Pending" => Some(OutboxStatus::Pending),
            "Sent" => Some(OutboxStatus::Sent),
            "Completed" => Some(OutboxStatus::Completed),
            "Failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Completed | OutboxStatus::Failed)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `command_outbox` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Same as the command envelope id.
    pub id: Uuid,
    pub node_id: Uuid,
    pub message_type: String,
    /// The full wire envelope, so redelivery re-sends the same id.
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: OutboxStatus,
    pub response_payload: Option<String>,
    pub error_message: Option<String>,
}

impl OutboxEntry {
    /// Decode the stored command envelope.
    pub fn envelope(&self) -> std::result::Result<Envelope, EnvelopeError> {
        Envelope::from_json(&self.payload)
    }
}

/// Result of [`OutboxStore::acknowledge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Completed,
    Failed,
    /// Unknown id, or the entry was not in `Sent`.
    Ignored,
}

impl AckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckOutcome::Completed => "completed",
            AckOutcome::Failed => "failed",
            AckOutcome::Ignored => "ignored",
        }
    }
}

/// Entry counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub sent: u64,
    pub completed: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("envelope {0} is not a command")]
    NotACommand(Uuid),
}

pub type Result<T> = std::result::Result<T, OutboxError>;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    // Fixed-width micros keep lexicographic order == chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_err(idx, format!("bad uuid '{raw}': {e}")))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, format!("bad timestamp '{raw}': {e}")))
}

const SELECT_COLUMNS: &str = "SELECT id, node_id, message_type, payload, created_at, sent_at,
        status, response_payload, error_message
     FROM command_outbox";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let id: String = row.get(0)?;
    let node_id: String = row.get(1)?;
    let created_at: String = row.get(4)?;
    let sent_at: Option<String> = row.get(5)?;
    let status: String = row.get(6)?;

    Ok(OutboxEntry {
        id: parse_uuid(0, &id)?,
        node_id: parse_uuid(1, &node_id)?,
        message_type: row.get(2)?,
        payload: row.get(3)?,
        created_at: parse_ts(4, &created_at)?,
        sent_at: sent_at.as_deref().map(|s| parse_ts(5, s)).transpose()?,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| conversion_err(6, format!("bad status '{status}'")))?,
        response_payload: row.get(7)?,
        error_message: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// OutboxStore
// ---------------------------------------------------------------------------

/// Async SQLite-backed command outbox.
pub struct OutboxStore {
    conn: Connection,
}

impl OutboxStore {
    /// Open (or create) the outbox database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory outbox (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS command_outbox (
                        id               TEXT PRIMARY KEY,
                        node_id          TEXT NOT NULL,
                        message_type     TEXT NOT NULL,
                        payload          TEXT NOT NULL,
                        created_at       TEXT NOT NULL,
                        sent_at          TEXT,
                        status           TEXT NOT NULL,
                        response_payload TEXT,
                        error_message    TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_outbox_node_status
                        ON command_outbox(node_id, status, created_at);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Persist `command` for `node_id` as a new `Pending` entry.
    ///
    /// Enqueueing an id that is already stored leaves the existing entry
    /// untouched and returns it.
    pub async fn enqueue(&self, command: &Envelope, node_id: Uuid) -> Result<OutboxEntry> {
        if !command.is_command() {
            return Err(OutboxError::NotACommand(command.id()));
        }
        let id = command.id();
        let id_str = id.to_string();
        let node_str = node_id.to_string();
        let message_type = command.message_type().to_string();
        let payload = command.to_json()?;
        let created_at = ts_to_sql(Utc::now());

        let entry = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO command_outbox
                        (id, node_id, message_type, payload, created_at, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'Pending')
                     ON CONFLICT(id) DO NOTHING",
                    rusqlite::params![id_str, node_str, message_type, payload, created_at],
                )?;
                let entry = conn.query_row(
                    &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                    rusqlite::params![id_str],
                    row_to_entry,
                )?;
                Ok(entry)
            })
            .await?;

        tracing::debug!(
            command_id = %id,
            node_id = %node_id,
            message_type = %entry.message_type,
            "command enqueued"
        );
        Ok(entry)
    }

    /// All `Pending` entries for `node_id`, oldest first.
    pub async fn pending_for(&self, node_id: Uuid) -> Result<Vec<OutboxEntry>> {
        let node_str = node_id.to_string();
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE node_id = ?1 AND status = 'Pending'
                     ORDER BY created_at ASC, rowid ASC"
                ))?;
                let rows = stmt.query_map(rusqlite::params![node_str], row_to_entry)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(entries)
    }

    /// Atomically move a `Pending` entry to `Sent`. Returns `false` when the
    /// entry is missing or already claimed.
    pub async fn claim(&self, id: Uuid) -> Result<bool> {
        let id_str = id.to_string();
        let sent_at = ts_to_sql(Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE command_outbox SET status = 'Sent', sent_at = ?2
                     WHERE id = ?1 AND status = 'Pending'",
                    rusqlite::params![id_str, sent_at],
                )?)
            })
            .await?;
        Ok(changed == 1)
    }

    /// Return a claimed entry to `Pending` after its write failed.
    pub async fn release_claim(&self, id: Uuid) -> Result<bool> {
        let id_str = id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE command_outbox SET status = 'Pending', sent_at = NULL
                     WHERE id = ?1 AND status = 'Sent'",
                    rusqlite::params![id_str],
                )?)
            })
            .await?;
        Ok(changed == 1)
    }

    /// Resolve a `Sent` entry from a node's acknowledgement.
    ///
    /// Unknown ids and entries in any other state are ignored: the ack may
    /// arrive after the entry was already resolved (e.g. expired).
    pub async fn acknowledge(
        &self,
        command_id: Uuid,
        success: bool,
        response_payload: Option<String>,
        error_message: Option<String>,
    ) -> Result<AckOutcome> {
        let id_str = command_id.to_string();
        let status = if success {
            OutboxStatus::Completed
        } else {
            OutboxStatus::Failed
        };
        let status_str = status.as_str();
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE command_outbox
                     SET status = ?2, response_payload = ?3, error_message = ?4
                     WHERE id = ?1 AND status = 'Sent'",
                    rusqlite::params![id_str, status_str, response_payload, error_message],
                )?)
            })
            .await?;

        let outcome = match (changed, success) {
            (0, _) => AckOutcome::Ignored,
            (_, true) => AckOutcome::Completed,
            (_, false) => AckOutcome::Failed,
        };
        tracing::debug!(command_id = %command_id, outcome = outcome.as_str(), "ack applied");
        Ok(outcome)
    }

    /// Return every `Sent` entry of `node_id` to `Pending` so the next drain
    /// redelivers it. Returns the number of reverted entries.
    pub async fn revert_sent(&self, node_id: Uuid) -> Result<usize> {
        let node_str = node_id.to_string();
        let reverted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE command_outbox SET status = 'Pending', sent_at = NULL
                     WHERE node_id = ?1 AND status = 'Sent'",
                    rusqlite::params![node_str],
                )?)
            })
            .await?;
        if reverted > 0 {
            tracing::info!(node_id = %node_id, reverted, "unacknowledged commands returned to pending");
        }
        Ok(reverted)
    }

    /// Return every `Sent` entry, of any node, to `Pending`. Run once when the
    /// hub starts: no connection from a previous process can still ack them.
    pub async fn revert_all_sent(&self) -> Result<usize> {
        let reverted = self
            .conn
            .call(|conn| {
                Ok(conn.execute(
                    "UPDATE command_outbox SET status = 'Pending', sent_at = NULL
                     WHERE status = 'Sent'",
                    [],
                )?)
            })
            .await?;
        if reverted > 0 {
            tracing::info!(reverted, "sent commands from a previous run returned to pending");
        }
        Ok(reverted)
    }

    /// Fail every non-terminal entry created more than `max_age` ago.
    pub async fn expire_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = ts_to_sql(Utc::now() - max_age);
        let expired = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE command_outbox SET status = 'Failed', error_message = 'expired'
                     WHERE status IN ('Pending', 'Sent') AND created_at < ?1",
                    rusqlite::params![cutoff],
                )?)
            })
            .await?;
        if expired > 0 {
            tracing::warn!(expired, "outbox entries expired without acknowledgement");
        }
        Ok(expired)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>> {
        let id_str = id.to_string();
        let entry = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_entry(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(entry)
    }

    /// Every entry for `node_id` regardless of status, oldest first.
    pub async fn list_for_node(&self, node_id: Uuid) -> Result<Vec<OutboxEntry>> {
        let node_str = node_id.to_string();
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE node_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ))?;
                let rows = stmt.query_map(rusqlite::params![node_str], row_to_entry)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(entries)
    }

    pub async fn count_by_status(&self) -> Result<OutboxCounts> {
        let counts = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM command_outbox GROUP BY status")?;
                let mut rows = stmt.query([])?;
                let mut counts = OutboxCounts::default();
                while let Some(row) = rows.next()? {
                    let status: String = row.get(0)?;
                    let n: i64 = row.get(1)?;
                    let n = n.max(0) as u64;
                    match OutboxStatus::parse(&status) {
                        Some(OutboxStatus::Pending) => counts.pending = n,
                        Some(OutboxStatus::Sent) => counts.sent = n,
                        Some(OutboxStatus::Completed) => counts.completed = n,
                        Some(OutboxStatus::Failed) => counts.failed = n,
                        None => {}
                    }
                }
                Ok(counts)
            })
            .await?;
        Ok(counts)
    }
}
