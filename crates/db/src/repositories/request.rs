use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use toolcrib_core::domain::approval::{ActorRole, ApprovalDecision, DecisionId, DecisionOutcome};
use toolcrib_core::domain::history::StatusHistoryEntry;
use toolcrib_core::domain::request::{
    Priority, Request, RequestFilter, RequestId, RequestState, RequesterId,
};
use toolcrib_core::flows::WorkflowAction;
use toolcrib_core::store::{RequestStorage, StorageError, TransitionCommit};

use super::{is_unique_violation, RepositoryError};
use crate::DbPool;

pub struct SqlRequestStorage {
    pool: DbPool,
}

impl SqlRequestStorage {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RequestStorage for SqlRequestStorage {
    async fn save(
        &self,
        request: Request,
        expected_version: Option<u64>,
    ) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        match expected_version {
            None => insert_request(&mut conn, &request).await,
            Some(expected) => update_versioned(&mut conn, &request, expected).await,
        }
    }

    async fn load(&self, id: &RequestId) -> Result<Option<Request>, StorageError> {
        let row = sqlx::query(
            "SELECT id, requester_id, item_description, quantity, reason, department,
                    priority, state, cycle, version, created_at, updated_at
             FROM tool_request
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(row.as_ref().map(request_from_row).transpose()?)
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>, StorageError> {
        let requester = filter.requester_id.as_ref().map(|id| id.0.as_str());
        let state = filter.state.map(|state| state.as_str());
        let department = filter.department.as_deref();

        let rows = sqlx::query(
            "SELECT id, requester_id, item_description, quantity, reason, department,
                    priority, state, cycle, version, created_at, updated_at
             FROM tool_request
             WHERE (? IS NULL OR requester_id = ?)
               AND (? IS NULL OR state = ?)
               AND (? IS NULL OR department = ?)
             ORDER BY created_at ASC, id ASC
             LIMIT ? OFFSET ?",
        )
        .bind(requester)
        .bind(requester)
        .bind(state)
        .bind(state)
        .bind(department)
        .bind(department)
        .bind(filter.limit.map_or(-1, i64::from))
        .bind(i64::from(filter.offset.unwrap_or(0)))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.iter().map(request_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn append_atomic(&self, commit: TransitionCommit) -> Result<(), StorageError> {
        let TransitionCommit { request, expected_version, entry, decision } = commit;
        let conflict = || StorageError::VersionConflict {
            request_id: request.id.clone(),
            expected_version,
        };

        let mut tx = self.pool.begin().await.map_err(backend)?;
        update_versioned(&mut tx, &request, expected_version).await?;

        let last_sequence = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(sequence_number), 0)
             FROM request_status_history
             WHERE request_id = ?",
        )
        .bind(&request.id.0)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;
        if to_i64("sequence_number", entry.sequence_number)? != last_sequence + 1 {
            return Err(conflict());
        }

        insert_history(&mut tx, &entry).await.map_err(|error| {
            if is_unique_violation(&error) {
                conflict()
            } else {
                backend(error)
            }
        })?;

        if let Some(decision) = &decision {
            insert_decision(&mut tx, decision).await.map_err(|error| {
                if is_unique_violation(&error) {
                    conflict()
                } else {
                    backend(error)
                }
            })?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn history(&self, id: &RequestId) -> Result<Vec<StatusHistoryEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT request_id, sequence_number, action, from_state, to_state, description,
                    actor_role, comment, cycle, prev_hash, entry_hash, occurred_at
             FROM request_status_history
             WHERE request_id = ?
             ORDER BY sequence_number ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.iter().map(entry_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn decisions(&self, id: &RequestId) -> Result<Vec<ApprovalDecision>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, request_id, actor_role, outcome, comment, cycle, decided_at
             FROM approval_decision
             WHERE request_id = ?
             ORDER BY decided_at ASC, rowid ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.iter().map(decision_from_row).collect::<Result<Vec<_>, _>>()?)
    }
}

async fn insert_request(conn: &mut SqliteConnection, request: &Request) -> Result<(), StorageError> {
    let result = sqlx::query(
        "INSERT INTO tool_request (id, requester_id, item_description, quantity, reason,
                                   department, priority, state, cycle, version,
                                   created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&request.id.0)
    .bind(&request.requester_id.0)
    .bind(&request.item_description)
    .bind(i64::from(request.quantity))
    .bind(&request.reason)
    .bind(&request.department)
    .bind(request.priority.as_str())
    .bind(request.state.as_str())
    .bind(i64::from(request.cycle))
    .bind(to_i64("version", request.version)?)
    .bind(format_timestamp(&request.created_at))
    .bind(format_timestamp(&request.updated_at))
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(error) if is_unique_violation(&error) => {
            Err(StorageError::AlreadyExists { request_id: request.id.clone() })
        }
        Err(error) => Err(backend(error)),
    }
}

/// Compare-and-swap on `version`. Zero affected rows means the request is
/// missing or another writer got there first.
async fn update_versioned(
    conn: &mut SqliteConnection,
    request: &Request,
    expected_version: u64,
) -> Result<(), StorageError> {
    let updated = sqlx::query(
        "UPDATE tool_request
         SET item_description = ?,
             quantity = ?,
             reason = ?,
             department = ?,
             priority = ?,
             state = ?,
             cycle = ?,
             version = ?,
             updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(&request.item_description)
    .bind(i64::from(request.quantity))
    .bind(&request.reason)
    .bind(&request.department)
    .bind(request.priority.as_str())
    .bind(request.state.as_str())
    .bind(i64::from(request.cycle))
    .bind(to_i64("version", request.version)?)
    .bind(format_timestamp(&request.updated_at))
    .bind(&request.id.0)
    .bind(to_i64("version", expected_version)?)
    .execute(&mut *conn)
    .await
    .map_err(backend)?;

    if updated.rows_affected() > 0 {
        return Ok(());
    }

    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tool_request WHERE id = ?")
        .bind(&request.id.0)
        .fetch_one(&mut *conn)
        .await
        .map_err(backend)?;
    if exists == 0 {
        Err(StorageError::NotFound { request_id: request.id.clone() })
    } else {
        Err(StorageError::VersionConflict { request_id: request.id.clone(), expected_version })
    }
}

async fn insert_history(
    conn: &mut SqliteConnection,
    entry: &StatusHistoryEntry,
) -> Result<(), sqlx::Error> {
    let sequence_number = i64::try_from(entry.sequence_number)
        .map_err(|error| sqlx::Error::Encode(Box::new(error)))?;

    sqlx::query(
        "INSERT INTO request_status_history (request_id, sequence_number, action, from_state,
                                             to_state, description, actor_role, comment, cycle,
                                             prev_hash, entry_hash, occurred_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.request_id.0)
    .bind(sequence_number)
    .bind(entry.action.as_str())
    .bind(entry.from_state.as_str())
    .bind(entry.to_state.as_str())
    .bind(&entry.description)
    .bind(entry.actor_role.as_str())
    .bind(&entry.comment)
    .bind(i64::from(entry.cycle))
    .bind(&entry.prev_hash)
    .bind(&entry.entry_hash)
    .bind(format_timestamp(&entry.timestamp))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_decision(
    conn: &mut SqliteConnection,
    decision: &ApprovalDecision,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO approval_decision (id, request_id, actor_role, outcome, comment, cycle,
                                        decided_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&decision.id.0)
    .bind(&decision.request_id.0)
    .bind(decision.actor_role.as_str())
    .bind(decision.outcome.as_str())
    .bind(&decision.comment)
    .bind(i64::from(decision.cycle))
    .bind(format_timestamp(&decision.decided_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn request_from_row(row: &SqliteRow) -> Result<Request, RepositoryError> {
    let priority_raw = row.try_get::<String, _>("priority")?;
    let priority = Priority::parse(&priority_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown priority `{priority_raw}`")))?;

    Ok(Request {
        id: RequestId(row.try_get("id")?),
        requester_id: RequesterId(row.try_get("requester_id")?),
        item_description: row.try_get("item_description")?,
        quantity: parse_u32("quantity", row.try_get("quantity")?)?,
        reason: row.try_get("reason")?,
        department: row.try_get("department")?,
        priority,
        state: parse_state("state", row.try_get("state")?)?,
        cycle: parse_u32("cycle", row.try_get("cycle")?)?,
        version: parse_u64("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<StatusHistoryEntry, RepositoryError> {
    let action_raw = row.try_get::<String, _>("action")?;
    let action = WorkflowAction::parse(&action_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown workflow action `{action_raw}`")))?;

    Ok(StatusHistoryEntry {
        request_id: RequestId(row.try_get("request_id")?),
        sequence_number: parse_u64("sequence_number", row.try_get("sequence_number")?)?,
        action,
        from_state: parse_state("from_state", row.try_get("from_state")?)?,
        to_state: parse_state("to_state", row.try_get("to_state")?)?,
        description: row.try_get("description")?,
        actor_role: parse_role(row.try_get("actor_role")?)?,
        comment: row.try_get("comment")?,
        cycle: parse_u32("cycle", row.try_get("cycle")?)?,
        prev_hash: row.try_get("prev_hash")?,
        entry_hash: row.try_get("entry_hash")?,
        timestamp: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

fn decision_from_row(row: &SqliteRow) -> Result<ApprovalDecision, RepositoryError> {
    let outcome_raw = row.try_get::<String, _>("outcome")?;
    let outcome = DecisionOutcome::parse(&outcome_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown decision outcome `{outcome_raw}`")))?;

    Ok(ApprovalDecision {
        id: DecisionId(row.try_get("id")?),
        request_id: RequestId(row.try_get("request_id")?),
        actor_role: parse_role(row.try_get("actor_role")?)?,
        outcome,
        comment: row.try_get("comment")?,
        cycle: parse_u32("cycle", row.try_get("cycle")?)?,
        decided_at: parse_timestamp("decided_at", row.try_get("decided_at")?)?,
    })
}

fn parse_state(column: &str, value: String) -> Result<RequestState, RepositoryError> {
    RequestState::parse(&value).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown request state in `{column}`: `{value}`"))
    })
}

fn parse_role(value: String) -> Result<ActorRole, RepositoryError> {
    ActorRole::parse(&value)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown actor role `{value}`")))
}

fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!("column `{column}` is out of range for u32: {value}"))
    })
}

fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!("column `{column}` must not be negative: {value}"))
    })
}

fn to_i64(column: &str, value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| {
        StorageError::Backend(format!("value for `{column}` does not fit in an sqlite integer"))
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

/// Fixed-width UTC so that text ordering matches time ordering.
fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn backend(error: sqlx::Error) -> StorageError {
    RepositoryError::Database(error).into()
}
