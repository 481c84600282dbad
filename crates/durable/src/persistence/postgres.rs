//! PostgreSQL implementation of HistoryStore
//!
//! - One row per run in `ledgerflow_executions`, one row per event in
//!   `ledgerflow_history_events`
//! - Appends lock the run row, so the duplicate, closed and sequence checks
//!   and the inserts happen atomically
//! - A run is created together with its start event, and closed in the same
//!   transaction that records its terminal event
//! - A partial unique index guarantees at most one running run per workflow id

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{ParentRef, WorkflowError};

/// PostgreSQL implementation of HistoryStore
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::PostgresHistoryStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/ledgerflow").await?;
/// let store = PostgresHistoryStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresHistoryStore {
    pool: PgPool,
}

impl PostgresHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("{}: {}", context, e);
        StoreError::Database(e.to_string())
    }
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionInfo, StoreError> {
    let status: String = row.get("status");
    let parent: Option<Value> = row.get("parent");
    let error: Option<Value> = row.get("error");

    Ok(ExecutionInfo {
        id: ExecutionId::new(row.get::<String, _>("workflow_id"), row.get::<Uuid, _>("run_id")),
        workflow_type: row.get("workflow_type"),
        status: status.parse()?,
        input: row.get("input"),
        parent: parent
            .map(serde_json::from_value::<ParentRef>)
            .transpose()?,
        result: row.get("result"),
        error: error
            .map(serde_json::from_value::<WorkflowError>)
            .transpose()?,
        created_at: row.get("created_at"),
        closed_at: row.get("closed_at"),
    })
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: &ExecutionId,
    sequence_no: u64,
    new: &NewEvent,
) -> Result<(), StoreError> {
    let payload = serde_json::to_vec(&new.event)?;
    sqlx::query(
        r#"
        INSERT INTO ledgerflow_history_events
            (workflow_id, run_id, sequence_no, event_id, event_kind, payload)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&id.workflow_id)
    .bind(id.run_id)
    .bind(sequence_no as i64)
    .bind(&new.event_id)
    .bind(new.event.kind())
    .bind(&payload)
    .execute(&mut **tx)
    .await
    .map_err(db_error("Failed to insert event"))?;
    Ok(())
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn create_execution(&self, execution: NewExecution) -> Result<(), StoreError> {
        let parent = execution
            .parent
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let result = sqlx::query(
            r#"
            INSERT INTO ledgerflow_executions (workflow_id, run_id, workflow_type, status, input, parent)
            VALUES ($1, $2, $3, 'running', $4, $5)
            "#,
        )
        .bind(&execution.id.workflow_id)
        .bind(execution.id.run_id)
        .bind(&execution.workflow_type)
        .bind(&execution.input)
        .bind(&parent)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(StoreError::WorkflowAlreadyRunning(
                    execution.id.workflow_id.clone(),
                ))
            }
            Err(e) => return Err(db_error("Failed to create execution")(e)),
        }

        insert_event(&mut tx, &execution.id, 1, &execution.started_event()).await?;
        tx.commit()
            .await
            .map_err(db_error("Failed to commit execution"))?;

        debug!(workflow_type = %execution.workflow_type, "created execution");
        Ok(())
    }

    #[instrument(skip(self), fields(execution_id = %id))]
    async fn get_execution(&self, id: &ExecutionId) -> Result<ExecutionInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, run_id, workflow_type, status, input, parent, result, error,
                   created_at, closed_at
            FROM ledgerflow_executions
            WHERE workflow_id = $1 AND run_id = $2
            "#,
        )
        .bind(&id.workflow_id)
        .bind(id.run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get execution"))?
        .ok_or_else(|| StoreError::ExecutionNotFound(id.clone()))?;

        execution_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn current_run(&self, workflow_id: &str) -> Result<ExecutionId, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_id FROM ledgerflow_executions
            WHERE workflow_id = $1
            ORDER BY created_at DESC, run_id DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get current run"))?
        .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        Ok(ExecutionId::new(workflow_id, row.get::<Uuid, _>("run_id")))
    }

    #[instrument(skip(self, result, error), fields(execution_id = %id))]
    async fn update_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let error_json = error.as_ref().map(serde_json::to_value).transpose()?;
        let closed_at: Option<DateTime<Utc>> = status.is_closed().then(Utc::now);

        let updated = sqlx::query(
            r#"
            UPDATE ledgerflow_executions
            SET status = $3, result = $4, error = $5, closed_at = $6
            WHERE workflow_id = $1 AND run_id = $2
            "#,
        )
        .bind(&id.workflow_id)
        .bind(id.run_id)
        .bind(status.as_str())
        .bind(&result)
        .bind(&error_json)
        .bind(closed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to update execution status"))?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(id.clone()));
        }
        debug!(%status, "updated execution status");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_executions(&self, status: ExecutionStatus) -> Result<Vec<ExecutionId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, run_id FROM ledgerflow_executions
            WHERE status = $1
            ORDER BY workflow_id, run_id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list executions"))?;

        Ok(rows
            .iter()
            .map(|row| ExecutionId::new(row.get::<String, _>("workflow_id"), row.get::<Uuid, _>("run_id")))
            .collect())
    }

    #[instrument(skip(self, events), fields(execution_id = %id, count = events.len()))]
    async fn append_events(
        &self,
        id: &ExecutionId,
        expected_sequence: Option<u64>,
        events: Vec<NewEvent>,
    ) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let status: String = sqlx::query(
            r#"
            SELECT status FROM ledgerflow_executions
            WHERE workflow_id = $1 AND run_id = $2
            FOR UPDATE
            "#,
        )
        .bind(&id.workflow_id)
        .bind(id.run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to lock execution"))?
        .ok_or_else(|| StoreError::ExecutionNotFound(id.clone()))?
        .get("status");

        let event_ids: Vec<String> = events.iter().map(|e| e.event_id.clone()).collect();
        let duplicate = sqlx::query(
            r#"
            SELECT event_id, sequence_no FROM ledgerflow_history_events
            WHERE workflow_id = $1 AND run_id = $2 AND event_id = ANY($3)
            ORDER BY sequence_no
            LIMIT 1
            "#,
        )
        .bind(&id.workflow_id)
        .bind(id.run_id)
        .bind(&event_ids)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to check duplicate events"))?;

        if let Some(row) = duplicate {
            return Err(StoreError::DuplicateEvent {
                event_id: row.get("event_id"),
                sequence_no: row.get::<i64, _>("sequence_no") as u64,
            });
        }

        if status.parse::<ExecutionStatus>()?.is_closed() {
            return Err(StoreError::ExecutionClosed(id.clone()));
        }

        let next: i64 = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence_no), 0) + 1 AS next_seq
            FROM ledgerflow_history_events
            WHERE workflow_id = $1 AND run_id = $2
            "#,
        )
        .bind(&id.workflow_id)
        .bind(id.run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to read sequence"))?
        .get("next_seq");

        let next = next as u64;
        if let Some(expected) = expected_sequence {
            if expected != next {
                return Err(StoreError::ConcurrencyConflict {
                    expected,
                    actual: next,
                });
            }
        }

        let mut sequence_no = next - 1;
        for new in &events {
            sequence_no += 1;
            insert_event(&mut tx, id, sequence_no, new).await?;

            if let Some((status, result, error)) = new.event.closing_status() {
                let error_json = error.as_ref().map(serde_json::to_value).transpose()?;
                sqlx::query(
                    r#"
                    UPDATE ledgerflow_executions
                    SET status = $3, result = $4, error = $5, closed_at = NOW()
                    WHERE workflow_id = $1 AND run_id = $2
                    "#,
                )
                .bind(&id.workflow_id)
                .bind(id.run_id)
                .bind(status.as_str())
                .bind(&result)
                .bind(&error_json)
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to close execution"))?;
            }
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit events"))?;

        debug!(sequence_no, "appended events");
        Ok(sequence_no)
    }

    #[instrument(skip(self), fields(execution_id = %id))]
    async fn read(&self, id: &ExecutionId, from_seq: u64) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_no, event_id, event_kind, payload, recorded_at
            FROM ledgerflow_history_events
            WHERE workflow_id = $1 AND run_id = $2 AND sequence_no >= $3
            ORDER BY sequence_no
            "#,
        )
        .bind(&id.workflow_id)
        .bind(id.run_id)
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to read events"))?;

        rows.iter()
            .map(|row| {
                let event_kind: String = row.get("event_kind");
                let payload: Vec<u8> = row.get("payload");
                EventRecord::decode(
                    row.get::<i64, _>("sequence_no") as u64,
                    row.get("event_id"),
                    &event_kind,
                    &payload,
                    row.get("recorded_at"),
                )
            })
            .collect()
    }
}
