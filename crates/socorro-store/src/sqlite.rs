//! SQLite-backed `RecordStore` implementation with durable persistence.

use crate::{
    ensure_conditional_write, monotonic_timestamp, sort_newest_first, AppendedMessage,
    ConditionalUpdate, EmergencyRequest, Message, MessageDraft, RecordStore, RequestQuery,
    RequestStatus, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use socorro_types::{Category, Priority, SenderRole};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const REQUEST_COLUMNS: &str = r#"
    request_id, requester_id, responder_id, category, description, address, priority,
    status, follow_up_notes, created_at, assigned_at, resolved_at, cancelled_at, revision
"#;

const MESSAGE_COLUMNS: &str = r#"
    message_id, request_id, sequence, sender_role, sender_id, body, is_system_notice,
    created_at, client_message_id
"#;

/// Persistent SQLite store backend for requests and transcripts.
#[derive(Debug)]
pub struct SqliteRecordStore {
    db_path: PathBuf,
}

impl SqliteRecordStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS emergency_requests (
                request_id TEXT PRIMARY KEY,
                requester_id TEXT NOT NULL,
                responder_id TEXT NULL,
                category TEXT NOT NULL,
                description TEXT NOT NULL,
                address TEXT NULL,
                priority TEXT NOT NULL,
                status TEXT NOT NULL,
                follow_up_notes TEXT NULL,
                created_at TEXT NOT NULL,
                assigned_at TEXT NULL,
                resolved_at TEXT NULL,
                cancelled_at TEXT NULL,
                revision INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_requests_requester
                ON emergency_requests (requester_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_requests_responder
                ON emergency_requests (responder_id, status);

            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                sender_role TEXT NOT NULL,
                sender_id TEXT NULL,
                body TEXT NOT NULL,
                is_system_notice INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                client_message_id TEXT NULL,
                UNIQUE (request_id, sequence),
                FOREIGN KEY(request_id) REFERENCES emergency_requests(request_id)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_id
                ON messages (request_id, client_message_id)
                WHERE client_message_id IS NOT NULL;
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert_request(
        &self,
        mut request: EmergencyRequest,
    ) -> StoreResult<EmergencyRequest> {
        request.revision = 1;

        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;
        let exists = transaction
            .query_row(
                "SELECT 1 FROM emergency_requests WHERE request_id = ?1",
                params![request.id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::RequestAlreadyExists(request.id));
        }

        transaction.execute(
            &format!(
                "INSERT INTO emergency_requests ({REQUEST_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                request.id,
                request.requester_id,
                request.responder_id,
                request.category.as_str(),
                request.description,
                request.address,
                request.priority.as_str(),
                request.status.as_str(),
                request.follow_up_notes,
                timestamp_to_db(request.created_at),
                option_timestamp_to_db(request.assigned_at),
                option_timestamp_to_db(request.resolved_at),
                option_timestamp_to_db(request.cancelled_at),
                u64_to_i64("revision", request.revision)?,
            ],
        )?;
        transaction.commit()?;
        Ok(request)
    }

    async fn get_request(&self, request_id: &str) -> StoreResult<Option<EmergencyRequest>> {
        let connection = self.open_connection()?;
        load_request(&connection, request_id)
    }

    async fn query_requests(&self, query: RequestQuery) -> StoreResult<Vec<EmergencyRequest>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM emergency_requests
            WHERE (?1 IS NULL OR requester_id = ?1)
              AND (?2 IS NULL OR responder_id = ?2)
            "#
        ))?;
        let mut rows = statement.query(params![query.requester_id, query.responder_id])?;

        let mut requests = Vec::new();
        while let Some(row) = rows.next()? {
            let request = request_from_row(row)?;
            if query.matches(&request) {
                requests.push(request);
            }
        }
        sort_newest_first(&mut requests);

        let start = query.offset.min(requests.len());
        let mut sliced = requests.split_off(start);
        if let Some(limit) = query.limit {
            sliced.truncate(limit);
        }
        Ok(sliced)
    }

    async fn update_request_if_status(
        &self,
        expected: RequestStatus,
        mut updated: EmergencyRequest,
        notice: Option<MessageDraft>,
    ) -> StoreResult<ConditionalUpdate> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(current) = load_request(&transaction, &updated.id)? else {
            return Ok(ConditionalUpdate::NotFound);
        };
        if current.status != expected {
            return Ok(ConditionalUpdate::StatusMismatch { current });
        }
        if current.revision != updated.revision {
            return Ok(ConditionalUpdate::RevisionMismatch { current });
        }
        ensure_conditional_write(expected, &updated)?;

        let read_revision = current.revision;
        updated.revision = read_revision + 1;
        let changed = transaction.execute(
            r#"
            UPDATE emergency_requests
            SET responder_id = ?1, priority = ?2, status = ?3, follow_up_notes = ?4,
                assigned_at = ?5, resolved_at = ?6, cancelled_at = ?7, revision = ?8
            WHERE request_id = ?9 AND status = ?10 AND revision = ?11
            "#,
            params![
                updated.responder_id,
                updated.priority.as_str(),
                updated.status.as_str(),
                updated.follow_up_notes,
                option_timestamp_to_db(updated.assigned_at),
                option_timestamp_to_db(updated.resolved_at),
                option_timestamp_to_db(updated.cancelled_at),
                u64_to_i64("revision", updated.revision)?,
                updated.id,
                expected.as_str(),
                u64_to_i64("revision", read_revision)?,
            ],
        )?;
        if changed == 0 {
            return Ok(ConditionalUpdate::StatusMismatch { current });
        }

        let notice = match notice {
            Some(draft) => Some(insert_message(&transaction, draft)?),
            None => None,
        };
        transaction.commit()?;

        Ok(ConditionalUpdate::Applied {
            request: updated,
            notice,
        })
    }

    async fn update_follow_up_notes(
        &self,
        request_id: &str,
        notes: Option<String>,
    ) -> StoreResult<Option<EmergencyRequest>> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = transaction.execute(
            r#"
            UPDATE emergency_requests
            SET follow_up_notes = ?1, revision = revision + 1
            WHERE request_id = ?2
            "#,
            params![notes, request_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let updated = load_request(&transaction, request_id)?;
        transaction.commit()?;
        Ok(updated)
    }

    async fn append_message(&self, draft: MessageDraft) -> StoreResult<AppendedMessage> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = transaction
            .query_row(
                "SELECT 1 FROM emergency_requests WHERE request_id = ?1",
                params![draft.request_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::RequestNotFound(draft.request_id));
        }

        if let Some(client_message_id) = draft.client_message_id.as_deref() {
            let existing = transaction
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages \
                         WHERE request_id = ?1 AND client_message_id = ?2"
                    ),
                    params![draft.request_id, client_message_id],
                    |row| Ok(message_from_row(row)),
                )
                .optional()?
                .transpose()?;
            if let Some(existing) = existing {
                transaction.commit()?;
                return Ok(AppendedMessage {
                    message: existing,
                    duplicate: true,
                });
            }
        }

        let message = insert_message(&transaction, draft)?;
        transaction.commit()?;
        Ok(AppendedMessage {
            message,
            duplicate: false,
        })
    }

    async fn list_messages(
        &self,
        request_id: &str,
        after_sequence: Option<u64>,
    ) -> StoreResult<Vec<Message>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE request_id = ?1 AND sequence > ?2
            ORDER BY sequence ASC
            "#
        ))?;
        let after = u64_to_i64("sequence", after_sequence.unwrap_or(0))?;
        let mut rows = statement.query(params![request_id, after])?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(message_from_row(row)?);
        }
        Ok(messages)
    }
}

fn load_request(
    connection: &Connection,
    request_id: &str,
) -> StoreResult<Option<EmergencyRequest>> {
    connection
        .query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM emergency_requests WHERE request_id = ?1"),
            params![request_id],
            |row| Ok(request_from_row(row)),
        )
        .optional()?
        .transpose()
}

/// Allocates the next sequence for the draft's request and stores it.
fn insert_message(transaction: &Transaction<'_>, draft: MessageDraft) -> StoreResult<Message> {
    let (max_sequence, last_created_at): (Option<i64>, Option<String>) = transaction.query_row(
        r#"
        SELECT MAX(sequence),
               (SELECT created_at FROM messages WHERE request_id = ?1
                ORDER BY sequence DESC LIMIT 1)
        FROM messages
        WHERE request_id = ?1
        "#,
        params![draft.request_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let sequence = i64_to_u64("sequence", max_sequence.unwrap_or(0) + 1)?;
    let created_at =
        monotonic_timestamp(option_timestamp_from_db(last_created_at)?, Utc::now());
    let message = draft.into_message(sequence, created_at);

    transaction.execute(
        &format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            message.id,
            message.request_id,
            u64_to_i64("sequence", message.sequence)?,
            message.sender_role.as_str(),
            message.sender_id,
            message.body,
            i64::from(message.is_system_notice),
            timestamp_to_db(message.created_at),
            message.client_message_id,
        ],
    )?;
    Ok(message)
}

fn request_from_row(row: &Row<'_>) -> StoreResult<EmergencyRequest> {
    Ok(EmergencyRequest {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        responder_id: row.get(2)?,
        category: tag_from_db::<Category>("category", &row.get::<_, String>(3)?)?,
        description: row.get(4)?,
        address: row.get(5)?,
        priority: tag_from_db::<Priority>("priority", &row.get::<_, String>(6)?)?,
        status: tag_from_db::<RequestStatus>("status", &row.get::<_, String>(7)?)?,
        follow_up_notes: row.get(8)?,
        created_at: timestamp_from_db(&row.get::<_, String>(9)?)?,
        assigned_at: option_timestamp_from_db(row.get(10)?)?,
        resolved_at: option_timestamp_from_db(row.get(11)?)?,
        cancelled_at: option_timestamp_from_db(row.get(12)?)?,
        revision: i64_to_u64("revision", row.get(13)?)?,
    })
}

fn message_from_row(row: &Row<'_>) -> StoreResult<Message> {
    Ok(Message {
        id: row.get(0)?,
        request_id: row.get(1)?,
        sequence: i64_to_u64("sequence", row.get(2)?)?,
        sender_role: tag_from_db::<SenderRole>("sender_role", &row.get::<_, String>(3)?)?,
        sender_id: row.get(4)?,
        body: row.get(5)?,
        is_system_notice: row.get::<_, i64>(6)? != 0,
        created_at: timestamp_from_db(&row.get::<_, String>(7)?)?,
        client_message_id: row.get(8)?,
    })
}

fn tag_from_db<T: FromStr>(field: &'static str, value: &str) -> StoreResult<T> {
    T::from_str(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn option_timestamp_to_db(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp_to_db)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn i64_to_u64(field: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn u64_to_i64(field: &'static str, value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}
