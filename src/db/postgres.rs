//! PostgreSQL store for the work queue substrate and the assignment ledger.
//!
//! Schema is owned by the embedded refinery migrations under `migrations/`;
//! connecting never creates tables, so a fresh database stays untouched
//! until `run_migrations` is called explicitly.

use chrono::Utc;
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use async_trait::async_trait;

use crate::config::DatabaseConfig;
use crate::db::Database;
use crate::error::DatabaseError;
use crate::overseer::ledger::{
    parse_assignment_status, Assignment, NewAssignment, NewOverseerEvent, OverseerEvent,
};
use crate::queue::types::{
    parse_item_status, ClaimOptions, ExecutionOutcome, Identity, NewWorkItem,
    NewWorkItemExecution, NewWorkQueue, TranscriptRecord, WorkItem, WorkItemError,
    WorkItemExecution, WorkItemFilter, WorkItemPatch, WorkItemStatus, WorkQueue, WorkQueuePatch,
};

mod embedded {
    refinery::embed_migrations!("./migrations");
}

const ITEM_COLUMNS: &str = "id, queue_id, title, description, payload, status, status_reason, \
     parent_item_id, depends_on, blocked_by, created_by, assigned_to, priority, tags, \
     result, error, retry_count, max_retries, deadline, last_outcome, workstream, \
     created_at, updated_at, started_at, completed_at";

const ASSIGNMENT_COLUMNS: &str = "assignment_id, session_key, run_id, goal_id, status, \
     retry_count, last_retry_at, last_observed_activity_at, blocked_reason, recovery_policy, \
     created_at, updated_at";

/// Database store backed by PostgreSQL.
pub struct Store {
    pool: Pool,
}

impl Store {
    /// Create a store and verify connectivity. Does not touch the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Run the embedded migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.pool.get().await?;
        let client = &mut **conn;
        let report = embedded::migrations::runner()
            .run_async(client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!(version = migration.version(), name = migration.name(), "applied migration");
        }
        Ok(())
    }

    /// Get a connection from the pool.
    pub async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    /// Get a clone of the database pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, DatabaseError> {
    serde_json::to_value(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn identity_from_json(
    value: Option<serde_json::Value>,
) -> Result<Option<Identity>, DatabaseError> {
    value
        .map(|v| serde_json::from_value(v).map_err(|e| DatabaseError::Serialization(e.to_string())))
        .transpose()
}

fn error_from_json(
    value: Option<serde_json::Value>,
) -> Result<Option<WorkItemError>, DatabaseError> {
    value
        .map(|v| serde_json::from_value(v).map_err(|e| DatabaseError::Serialization(e.to_string())))
        .transpose()
}

fn map_unique_violation(e: tokio_postgres::Error, what: &str) -> DatabaseError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        DatabaseError::Constraint(format!("{} already exists", what))
    } else if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
        DatabaseError::Constraint(format!("{} references a missing record", what))
    } else {
        DatabaseError::Postgres(e)
    }
}

fn row_to_queue(row: &Row) -> WorkQueue {
    WorkQueue {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        name: row.get("name"),
        concurrency_limit: row.get("concurrency_limit"),
        default_priority: row.get("default_priority"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_item(row: &Row) -> Result<WorkItem, DatabaseError> {
    let status: String = row.get("status");
    Ok(WorkItem {
        id: row.get("id"),
        queue_id: row.get("queue_id"),
        title: row.get("title"),
        description: row.get("description"),
        payload: row.get("payload"),
        status: parse_item_status(&status),
        status_reason: row.get("status_reason"),
        parent_item_id: row.get("parent_item_id"),
        depends_on: row.get("depends_on"),
        blocked_by: row.get("blocked_by"),
        created_by: identity_from_json(row.get("created_by"))?,
        assigned_to: identity_from_json(row.get("assigned_to"))?,
        priority: row.get("priority"),
        tags: row.get("tags"),
        result: row.get("result"),
        error: error_from_json(row.get("error"))?,
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        deadline: row.get("deadline"),
        last_outcome: row.get("last_outcome"),
        workstream: row.get("workstream"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn row_to_assignment(row: &Row) -> Assignment {
    let status: String = row.get("status");
    Assignment {
        assignment_id: row.get("assignment_id"),
        session_key: row.get("session_key"),
        run_id: row.get("run_id"),
        goal_id: row.get("goal_id"),
        status: parse_assignment_status(&status),
        retry_count: row.get("retry_count"),
        last_retry_at: row.get("last_retry_at"),
        last_observed_activity_at: row.get("last_observed_activity_at"),
        blocked_reason: row.get("blocked_reason"),
        recovery_policy: row.get("recovery_policy"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_execution(row: &Row) -> WorkItemExecution {
    let outcome: String = row.get("outcome");
    WorkItemExecution {
        id: row.get("id"),
        item_id: row.get("item_id"),
        attempt_number: row.get("attempt_number"),
        session_key: row.get("session_key"),
        outcome: if outcome == "success" {
            ExecutionOutcome::Success
        } else {
            ExecutionOutcome::Error
        },
        error: row.get("error"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        duration_ms: row.get("duration_ms"),
    }
}

fn row_to_transcript(row: &Row) -> TranscriptRecord {
    TranscriptRecord {
        id: row.get("id"),
        item_id: row.get("item_id"),
        session_key: row.get("session_key"),
        content: row.get("content"),
        created_at: row.get("created_at"),
    }
}

/// Write every mutable column of an item back to storage.
async fn persist_item(
    tx: &deadpool_postgres::Transaction<'_>,
    item: &WorkItem,
) -> Result<(), DatabaseError> {
    let created_by = item.created_by.as_ref().map(to_json).transpose()?;
    let assigned_to = item.assigned_to.as_ref().map(to_json).transpose()?;
    let error = item.error.as_ref().map(to_json).transpose()?;

    tx.execute(
        r#"
        UPDATE work_items SET
            title = $2, description = $3, payload = $4, status = $5, status_reason = $6,
            depends_on = $7, blocked_by = $8, created_by = $9, assigned_to = $10,
            priority = $11, tags = $12, result = $13, error = $14, retry_count = $15,
            max_retries = $16, deadline = $17, last_outcome = $18, workstream = $19,
            updated_at = $20, started_at = $21, completed_at = $22
        WHERE id = $1
        "#,
        &[
            &item.id,
            &item.title,
            &item.description,
            &item.payload,
            &item.status.as_str(),
            &item.status_reason,
            &item.depends_on,
            &item.blocked_by,
            &created_by,
            &assigned_to,
            &item.priority,
            &item.tags,
            &item.result,
            &error,
            &item.retry_count,
            &item.max_retries,
            &item.deadline,
            &item.last_outcome,
            &item.workstream,
            &item.updated_at,
            &item.started_at,
            &item.completed_at,
        ],
    )
    .await?;
    Ok(())
}

async fn persist_assignment(
    tx: &deadpool_postgres::Transaction<'_>,
    assignment: &Assignment,
) -> Result<(), DatabaseError> {
    tx.execute(
        r#"
        UPDATE assignments SET
            session_key = $2, run_id = $3, goal_id = $4, status = $5, retry_count = $6,
            last_retry_at = $7, last_observed_activity_at = $8, blocked_reason = $9,
            recovery_policy = $10, updated_at = $11
        WHERE assignment_id = $1
        "#,
        &[
            &assignment.assignment_id,
            &assignment.session_key,
            &assignment.run_id,
            &assignment.goal_id,
            &assignment.status.as_str(),
            &assignment.retry_count,
            &assignment.last_retry_at,
            &assignment.last_observed_activity_at,
            &assignment.blocked_reason,
            &assignment.recovery_policy,
            &assignment.updated_at,
        ],
    )
    .await?;
    Ok(())
}

#[async_trait]
impl Database for Store {
    async fn storage_ready(&self) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        // to_regclass never creates anything.
        let row = conn
            .query_one("SELECT to_regclass('public.work_items') IS NOT NULL", &[])
            .await?;
        Ok(row.get(0))
    }

    // ==================== Work queues ====================

    async fn create_queue(&self, queue: &NewWorkQueue) -> Result<WorkQueue, DatabaseError> {
        if queue.concurrency_limit < 1 {
            return Err(DatabaseError::Constraint(
                "concurrency_limit must be at least 1".into(),
            ));
        }

        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        let row = conn
            .query_one(
                r#"
                INSERT INTO work_queues (id, agent_id, name, concurrency_limit, default_priority)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, agent_id, name, concurrency_limit, default_priority, created_at, updated_at
                "#,
                &[
                    &id,
                    &queue.agent_id,
                    &queue.name,
                    &queue.concurrency_limit,
                    &queue.default_priority,
                ],
            )
            .await
            .map_err(|e| map_unique_violation(e, &format!("queue for agent {}", queue.agent_id)))?;
        Ok(row_to_queue(&row))
    }

    async fn update_queue(
        &self,
        id: Uuid,
        patch: &WorkQueuePatch,
    ) -> Result<WorkQueue, DatabaseError> {
        if patch.concurrency_limit.is_some_and(|limit| limit < 1) {
            return Err(DatabaseError::Constraint(
                "concurrency_limit must be at least 1".into(),
            ));
        }

        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                UPDATE work_queues SET
                    name = COALESCE($2, name),
                    concurrency_limit = COALESCE($3, concurrency_limit),
                    default_priority = COALESCE($4, default_priority),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING id, agent_id, name, concurrency_limit, default_priority, created_at, updated_at
                "#,
                &[&id, &patch.name, &patch.concurrency_limit, &patch.default_priority],
            )
            .await?;

        row.map(|r| row_to_queue(&r))
            .ok_or_else(|| DatabaseError::NotFound(format!("queue {}", id)))
    }

    async fn get_queue(&self, id: Uuid) -> Result<Option<WorkQueue>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, agent_id, name, concurrency_limit, default_priority, created_at, updated_at \
                 FROM work_queues WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.map(|r| row_to_queue(&r)))
    }

    async fn get_queue_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Option<WorkQueue>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, agent_id, name, concurrency_limit, default_priority, created_at, updated_at \
                 FROM work_queues WHERE agent_id = $1",
                &[&agent_id],
            )
            .await?;
        Ok(row.map(|r| row_to_queue(&r)))
    }

    async fn list_queues(&self) -> Result<Vec<WorkQueue>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, agent_id, name, concurrency_limit, default_priority, created_at, updated_at \
                 FROM work_queues ORDER BY created_at",
                &[],
            )
            .await?;
        Ok(rows.iter().map(row_to_queue).collect())
    }

    // ==================== Work items ====================

    async fn create_item(&self, item: &NewWorkItem) -> Result<WorkItem, DatabaseError> {
        let conn = self.conn().await?;

        let queue_row = conn
            .query_opt(
                "SELECT default_priority FROM work_queues WHERE id = $1",
                &[&item.queue_id],
            )
            .await?;
        let default_priority: i32 = queue_row
            .ok_or_else(|| DatabaseError::NotFound(format!("queue {}", item.queue_id)))?
            .get("default_priority");

        let id = Uuid::new_v4();
        let status = if item.blocked_by.is_empty() {
            WorkItemStatus::Pending
        } else {
            WorkItemStatus::Blocked
        };
        let created_by = item.created_by.as_ref().map(to_json).transpose()?;
        let priority = item.priority.unwrap_or(default_priority);

        let row = conn
            .query_one(
                &format!(
                    r#"
                    INSERT INTO work_items (
                        id, queue_id, title, description, payload, status,
                        parent_item_id, depends_on, blocked_by, created_by,
                        priority, tags, max_retries, deadline, workstream
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                    RETURNING {}
                    "#,
                    ITEM_COLUMNS
                ),
                &[
                    &id,
                    &item.queue_id,
                    &item.title,
                    &item.description,
                    &item.payload,
                    &status.as_str(),
                    &item.parent_item_id,
                    &item.depends_on,
                    &item.blocked_by,
                    &created_by,
                    &priority,
                    &item.tags,
                    &item.max_retries,
                    &item.deadline,
                    &item.workstream,
                ],
            )
            .await
            .map_err(|e| map_unique_violation(e, "work item"))?;
        row_to_item(&row)
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<WorkItem>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM work_items WHERE id = $1", ITEM_COLUMNS),
                &[&id],
            )
            .await?;
        row.map(|r| row_to_item(&r)).transpose()
    }

    async fn update_item(
        &self,
        id: Uuid,
        patch: &WorkItemPatch,
    ) -> Result<WorkItem, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM work_items WHERE id = $1 FOR UPDATE",
                    ITEM_COLUMNS
                ),
                &[&id],
            )
            .await?;
        let mut item = row
            .map(|r| row_to_item(&r))
            .transpose()?
            .ok_or_else(|| DatabaseError::NotFound(format!("work item {}", id)))?;

        item.apply_patch(patch);
        persist_item(&tx, &item).await?;
        tx.commit().await?;
        Ok(item)
    }

    async fn claim_next_item(
        &self,
        queue_id: Uuid,
        identity: &Identity,
        opts: &ClaimOptions,
    ) -> Result<Option<WorkItem>, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        // Lock the queue row: claims for one queue serialize here, so the
        // concurrency count below cannot go stale mid-claim.
        let queue_row = tx
            .query_opt(
                "SELECT concurrency_limit FROM work_queues WHERE id = $1 FOR UPDATE",
                &[&queue_id],
            )
            .await?;
        let limit: i32 = queue_row
            .ok_or_else(|| DatabaseError::NotFound(format!("queue {}", queue_id)))?
            .get("concurrency_limit");

        let count_row = tx
            .query_one(
                "SELECT COUNT(*) FROM work_items WHERE queue_id = $1 AND status = 'in_progress'",
                &[&queue_id],
            )
            .await?;
        let in_progress: i64 = count_row.get(0);
        if in_progress >= limit as i64 {
            tx.commit().await?;
            return Ok(None);
        }

        let candidate = tx
            .query_opt(
                &format!(
                    r#"
                    SELECT {} FROM work_items
                    WHERE queue_id = $1 AND status = 'pending'
                      AND ($2::TEXT IS NULL OR workstream = $2)
                    ORDER BY priority DESC, created_at ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                    "#,
                    ITEM_COLUMNS
                ),
                &[&queue_id, &opts.workstream],
            )
            .await?;

        let Some(row) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };
        let mut item = row_to_item(&row)?;

        let now = Utc::now();
        item.status = WorkItemStatus::InProgress;
        item.assigned_to = Some(identity.clone());
        item.started_at = Some(now);
        item.updated_at = now;
        persist_item(&tx, &item).await?;
        tx.commit().await?;
        Ok(Some(item))
    }

    async fn list_items(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>, DatabaseError> {
        let conn = self.conn().await?;
        let assigned_to = filter.assigned_to.as_ref().map(to_json).transpose()?;
        let status = filter.status.map(|s| s.as_str());

        let rows = conn
            .query(
                &format!(
                    r#"
                    SELECT {} FROM work_items
                    WHERE ($1::UUID IS NULL OR queue_id = $1)
                      AND ($2::TEXT IS NULL OR status = $2)
                      AND ($3::JSONB IS NULL OR assigned_to = $3)
                      AND ($4::TEXT IS NULL OR workstream = $4)
                    ORDER BY priority DESC, created_at ASC
                    "#,
                    ITEM_COLUMNS
                ),
                &[&filter.queue_id, &status, &assigned_to, &filter.workstream],
            )
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn promote_unblocked_items(&self, queue_id: Uuid) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                r#"
                UPDATE work_items SET
                    status = 'pending',
                    status_reason = 'Dependencies satisfied',
                    updated_at = NOW()
                WHERE queue_id = $1 AND status = 'blocked'
                  AND NOT EXISTS (
                      SELECT 1 FROM work_items dep
                      WHERE dep.id = ANY(work_items.blocked_by)
                        AND dep.status <> 'completed'
                  )
                "#,
                &[&queue_id],
            )
            .await?;
        Ok(count)
    }

    // ==================== Executions ====================

    async fn record_execution(
        &self,
        execution: &NewWorkItemExecution,
    ) -> Result<WorkItemExecution, DatabaseError> {
        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        let duration_ms = (execution.completed_at - execution.started_at).num_milliseconds();

        conn.execute(
            r#"
            INSERT INTO work_item_executions (
                id, item_id, attempt_number, session_key, outcome, error,
                started_at, completed_at, duration_ms
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            &[
                &id,
                &execution.item_id,
                &execution.attempt_number,
                &execution.session_key,
                &execution.outcome.as_str(),
                &execution.error,
                &execution.started_at,
                &execution.completed_at,
                &duration_ms,
            ],
        )
        .await
        .map_err(|e| map_unique_violation(e, "execution"))?;

        Ok(WorkItemExecution {
            id,
            item_id: execution.item_id,
            attempt_number: execution.attempt_number,
            session_key: execution.session_key.clone(),
            outcome: execution.outcome,
            error: execution.error.clone(),
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            duration_ms,
        })
    }

    async fn list_executions(
        &self,
        item_id: Uuid,
    ) -> Result<Vec<WorkItemExecution>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, item_id, attempt_number, session_key, outcome, error, \
                 started_at, completed_at, duration_ms \
                 FROM work_item_executions WHERE item_id = $1 ORDER BY attempt_number, started_at",
                &[&item_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_execution).collect())
    }

    // ==================== Transcripts ====================

    async fn store_transcript(
        &self,
        item_id: Uuid,
        session_key: Option<&str>,
        content: &serde_json::Value,
    ) -> Result<Uuid, DatabaseError> {
        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO work_item_transcripts (id, item_id, session_key, content) \
             VALUES ($1, $2, $3, $4)",
            &[&id, &item_id, &session_key, content],
        )
        .await
        .map_err(|e| map_unique_violation(e, "transcript"))?;
        Ok(id)
    }

    async fn get_transcript(&self, id: Uuid) -> Result<Option<TranscriptRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, item_id, session_key, content, created_at \
                 FROM work_item_transcripts WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.map(|r| row_to_transcript(&r)))
    }

    async fn list_transcripts(
        &self,
        item_id: Uuid,
    ) -> Result<Vec<TranscriptRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, item_id, session_key, content, created_at \
                 FROM work_item_transcripts WHERE item_id = $1 ORDER BY created_at",
                &[&item_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_transcript).collect())
    }

    // ==================== Assignment ledger ====================

    async fn create_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<Assignment, DatabaseError> {
        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        let row = conn
            .query_one(
                &format!(
                    r#"
                    INSERT INTO assignments (assignment_id, session_key, run_id, goal_id, status, recovery_policy)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    RETURNING {}
                    "#,
                    ASSIGNMENT_COLUMNS
                ),
                &[
                    &id,
                    &assignment.session_key,
                    &assignment.run_id,
                    &assignment.goal_id,
                    &assignment.status.as_str(),
                    &assignment.recovery_policy,
                ],
            )
            .await?;
        Ok(row_to_assignment(&row))
    }

    async fn get_assignment(&self, id: Uuid) -> Result<Option<Assignment>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM assignments WHERE assignment_id = $1",
                    ASSIGNMENT_COLUMNS
                ),
                &[&id],
            )
            .await?;
        Ok(row.map(|r| row_to_assignment(&r)))
    }

    async fn find_assignment_by_session_key(
        &self,
        session_key: &str,
    ) -> Result<Option<Assignment>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM assignments \
                     WHERE session_key = $1 AND status NOT IN ('done', 'cancelled') \
                     ORDER BY updated_at DESC LIMIT 1",
                    ASSIGNMENT_COLUMNS
                ),
                &[&session_key],
            )
            .await?;
        Ok(row.map(|r| row_to_assignment(&r)))
    }

    async fn find_assignment_by_run_id(
        &self,
        run_id: Uuid,
    ) -> Result<Option<Assignment>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM assignments \
                     WHERE run_id = $1 AND status NOT IN ('done', 'cancelled') \
                     ORDER BY updated_at DESC LIMIT 1",
                    ASSIGNMENT_COLUMNS
                ),
                &[&run_id],
            )
            .await?;
        Ok(row.map(|r| row_to_assignment(&r)))
    }

    async fn with_assignment(
        &self,
        id: Uuid,
        mutate: Box<dyn for<'a> FnOnce(&'a mut Assignment) + Send>,
    ) -> Result<Option<Assignment>, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM assignments WHERE assignment_id = $1 FOR UPDATE",
                    ASSIGNMENT_COLUMNS
                ),
                &[&id],
            )
            .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let mut assignment = row_to_assignment(&row);
        mutate(&mut assignment);
        assignment.updated_at = Utc::now();
        persist_assignment(&tx, &assignment).await?;
        tx.commit().await?;
        Ok(Some(assignment))
    }

    // ==================== Overseer audit log ====================

    async fn append_overseer_event(
        &self,
        event: &NewOverseerEvent,
    ) -> Result<OverseerEvent, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO overseer_events (event_type, assignment_id, goal_id, work_node_id, data)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, ts, event_type, assignment_id, goal_id, work_node_id, data
                "#,
                &[
                    &event.event_type,
                    &event.assignment_id,
                    &event.goal_id,
                    &event.work_node_id,
                    &event.data,
                ],
            )
            .await?;
        Ok(OverseerEvent {
            id: row.get("id"),
            ts: row.get("ts"),
            event_type: row.get("event_type"),
            assignment_id: row.get("assignment_id"),
            goal_id: row.get("goal_id"),
            work_node_id: row.get("work_node_id"),
            data: row.get("data"),
        })
    }

    async fn list_overseer_events(
        &self,
        assignment_id: Uuid,
        limit: usize,
    ) -> Result<Vec<OverseerEvent>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, ts, event_type, assignment_id, goal_id, work_node_id, data \
                 FROM overseer_events WHERE assignment_id = $1 ORDER BY id ASC LIMIT $2",
                &[&assignment_id, &(limit as i64)],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| OverseerEvent {
                id: r.get("id"),
                ts: r.get("ts"),
                event_type: r.get("event_type"),
                assignment_id: r.get("assignment_id"),
                goal_id: r.get("goal_id"),
                work_node_id: r.get("work_node_id"),
                data: r.get("data"),
            })
            .collect())
    }
}
