//! Postgres-backed job store.
//!
//! Lock transitions are single conditional `UPDATE` statements, so the row lock
//! Postgres takes for the update is the only serialization point between engine
//! instances. Record updates carry the revision read at load time in their
//! `WHERE` clause and write only the columns that changed.
//!
//! Blob content is flushed before the guarded row write. Flushing only inserts
//! fresh blob rows, so a writer that then loses the revision check has changed
//! nothing another instance can read; its new rows are deleted again and the
//! blobs it superseded are only deleted after its row write succeeded.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` | Inserting a job id that is already stored |
//! | Database (other) | Any other | `Unavailable` | Constraint or statement failure |
//! | PoolClosed | N/A | `Unavailable` | Connection pool was closed |
//! | Other | N/A | `Unavailable` | Network errors, connection failures, etc. |
//!
//! ## Blocking bridge
//!
//! `JobStore` is synchronous. The trait methods run the async queries with
//! `Handle::block_on`, using the runtime passed to `with_runtime` or the ambient
//! one. They must be called from a plain thread (or `spawn_blocking`), never from
//! inside an async task.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};
use uuid::Uuid;

use flowjob_core::{
    BlobId, Entity, JobId, LockOwner, Persistent, PersistentState, StateDiff,
    StateValue, TenantId,
};

use super::blob::{BlobRef, BlobStore};
use super::record::{DeadLetterJob, JobLock, JobRecord, StoredJob, fields};
use super::store::{JobStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_blobs (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    bytes BYTEA NOT NULL
);

CREATE TABLE IF NOT EXISTS job_records (
    id UUID PRIMARY KEY,
    revision BIGINT NOT NULL,
    handler_type TEXT NOT NULL,
    handler_configuration TEXT,
    advanced_configuration_blob_id UUID,
    retries BIGINT NOT NULL CHECK (retries >= 0),
    exception_message TEXT,
    exception_blob_id UUID,
    tenant_id TEXT NOT NULL,
    lock_owner TEXT,
    lock_expiration_time TIMESTAMPTZ,
    due_at TIMESTAMPTZ,
    create_time TIMESTAMPTZ NOT NULL,
    CHECK ((lock_owner IS NULL) = (lock_expiration_time IS NULL))
);

CREATE INDEX IF NOT EXISTS job_records_due_idx
    ON job_records (due_at, create_time);

CREATE TABLE IF NOT EXISTS dead_letter_jobs (
    id UUID PRIMARY KEY,
    revision BIGINT NOT NULL,
    handler_type TEXT NOT NULL,
    handler_configuration TEXT,
    advanced_configuration_blob_id UUID,
    retries BIGINT NOT NULL,
    exception_message TEXT,
    exception_blob_id UUID,
    tenant_id TEXT NOT NULL,
    lock_owner TEXT,
    lock_expiration_time TIMESTAMPTZ,
    due_at TIMESTAMPTZ,
    create_time TIMESTAMPTZ NOT NULL,
    dead_lettered_at TIMESTAMPTZ NOT NULL,
    reason TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS dead_letter_jobs_tenant_idx
    ON dead_letter_jobs (tenant_id, dead_lettered_at);
"#;

const JOB_COLUMNS: &str = "id, revision, handler_type, handler_configuration, \
    advanced_configuration_blob_id, retries, exception_message, exception_blob_id, \
    tenant_id, lock_owner, lock_expiration_time, due_at, create_time";

/// Postgres job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Option<Handle>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime: None,
        }
    }

    /// Runtime used by the blocking trait methods.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> Result<F::Output, StoreError> {
        let handle = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| {
                StoreError::Unavailable(
                    "PostgresJobStore requires a tokio runtime; call with_runtime or run inside one"
                        .to_string(),
                )
            })?,
        };
        Ok(handle.block_on(fut))
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_blob(&self, id: BlobId) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT bytes FROM job_blobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_blob", e))?;
        row.map(|r| r.try_get::<Vec<u8>, _>("bytes"))
            .transpose()
            .map_err(|e| map_sqlx_error("fetch_blob", e))
    }

    /// Insert a new blob row. Blob rows are never updated in place.
    #[instrument(skip(self, bytes), fields(len = bytes.len()), err)]
    pub async fn insert_blob(&self, id: BlobId, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO job_blobs (id, name, bytes) VALUES ($1, $2, $3)")
            .bind(id.as_uuid())
            .bind(name)
            .bind(bytes)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_blob", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn remove_blob(&self, id: BlobId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_blobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_blob", e))?;
        Ok(())
    }

    /// Insert a job row. Blob content must already be flushed.
    #[instrument(skip(self, job), fields(job_id = %job.id()), err)]
    pub async fn insert_row(&self, job: &JobRecord) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO job_records ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        );
        bind_job(sqlx::query(&sql), job, job.revision())
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::AlreadyExists(*job.id())
                } else {
                    map_sqlx_error("insert_row", e)
                }
            })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job_records WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_job", e))?;
        row.map(|r| job_from_row(&r).map(JobRecord::from)).transpose()
    }

    /// The atomic claim: one conditional `UPDATE`.
    #[instrument(skip(self), fields(owner = %owner), err)]
    pub async fn try_claim(
        &self,
        id: JobId,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET lock_owner = $2, lock_expiration_time = $3, revision = revision + 1
            WHERE id = $1 AND (lock_owner IS NULL OR lock_expiration_time < $4)
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner.as_str())
        .bind(expires_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_claim", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.current_revision(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::job_not_found(id)),
        }
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    pub async fn try_renew(
        &self,
        id: JobId,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET lock_expiration_time = $3, revision = revision + 1
            WHERE id = $1 AND lock_owner = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner.as_str())
        .bind(expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_renew", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    pub async fn try_release(&self, id: JobId, owner: &LockOwner) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET lock_owner = NULL, lock_expiration_time = NULL, revision = revision + 1
            WHERE id = $1 AND lock_owner = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_release", e))?;
        Ok(result.rows_affected() == 1)
    }

    /// Write `diff` if the row is still at `revision`; returns the new revision.
    #[instrument(skip(self, diff), fields(changed = diff.len()), err)]
    pub async fn apply_diff(
        &self,
        id: JobId,
        revision: u64,
        diff: &StateDiff,
    ) -> Result<u64, StoreError> {
        let mut query = build_update(id, revision, diff)?;
        let row = query
            .build()
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("apply_diff", e))?;

        match row {
            Some(row) => {
                let next: i64 = row
                    .try_get("revision")
                    .map_err(|e| map_sqlx_error("apply_diff", e))?;
                to_revision(next)
            }
            None => match self.current_revision(id).await? {
                Some(actual) => Err(StoreError::VersionConflict {
                    id,
                    expected: revision,
                    actual,
                }),
                None => Err(StoreError::job_not_found(id)),
            },
        }
    }

    /// Delete a job row together with the blobs it references.
    #[instrument(skip(self), err)]
    pub async fn delete_row(&self, id: JobId) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            "DELETE FROM job_records WHERE id = $1 \
             RETURNING advanced_configuration_blob_id, exception_blob_id",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_row", e))?
        .ok_or_else(|| StoreError::job_not_found(id))?;

        delete_referenced_blobs(&mut tx, &row).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn due_job_ids(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM job_records
            WHERE (due_at IS NULL OR due_at <= $1)
              AND (lock_owner IS NULL OR lock_expiration_time < $1)
            ORDER BY COALESCE(due_at, create_time), create_time
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("due_job_ids", e))?;

        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("id").map(JobId::from_uuid))
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("due_job_ids", e))
    }

    /// Move a job row to the dead-letter table if it is still at `revision`.
    #[instrument(skip(self, job), fields(job_id = %job.id()), err)]
    pub async fn move_to_dead_letter(
        &self,
        job: &JobRecord,
        revision: u64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let id = *job.id();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let deleted = sqlx::query("DELETE FROM job_records WHERE id = $1 AND revision = $2")
            .bind(id.as_uuid())
            .bind(to_db_revision(revision))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("move_to_dead_letter", e))?;
        if deleted.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return match self.current_revision(id).await? {
                Some(actual) => Err(StoreError::VersionConflict {
                    id,
                    expected: revision,
                    actual,
                }),
                None => Err(StoreError::job_not_found(id)),
            };
        }

        let sql = format!(
            "INSERT INTO dead_letter_jobs ({JOB_COLUMNS}, dead_lettered_at, reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        );
        bind_job(sqlx::query(&sql), job, job.revision())
            .bind(at)
            .bind(reason)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("move_to_dead_letter", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_dead_letter(&self, id: JobId) -> Result<Option<DeadLetterJob>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS}, dead_lettered_at, reason FROM dead_letter_jobs WHERE id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_dead_letter", e))?;
        row.map(|r| dead_letter_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn dead_letters_for(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterJob>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS}, dead_lettered_at, reason FROM dead_letter_jobs \
             WHERE tenant_id = $1 ORDER BY dead_lettered_at ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dead_letters_for", e))?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn restore_row(&self, id: JobId, retries: u32) -> Result<JobRecord, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!("DELETE FROM dead_letter_jobs WHERE id = $1 RETURNING {JOB_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("restore_row", e))?
            .ok_or_else(|| StoreError::dead_letter_not_found(id))?;

        let mut stored = job_from_row(&row)?;
        stored.retries = retries;
        stored.lock = None;
        stored.revision += 1;
        let job = JobRecord::from(stored);

        let sql = format!(
            "INSERT INTO job_records ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        );
        bind_job(sqlx::query(&sql), &job, job.revision())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("restore_row", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    pub async fn delete_dead_letter_row(&self, id: JobId) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            "DELETE FROM dead_letter_jobs WHERE id = $1 \
             RETURNING advanced_configuration_blob_id, exception_blob_id",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_dead_letter_row", e))?
        .ok_or_else(|| StoreError::dead_letter_not_found(id))?;

        delete_referenced_blobs(&mut tx, &row).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    async fn current_revision(&self, id: JobId) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT revision FROM job_records WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_revision", e))?;
        row.map(|r| {
            r.try_get::<i64, _>("revision")
                .map_err(|e| map_sqlx_error("current_revision", e))
                .and_then(to_revision)
        })
        .transpose()
    }

    /// Delete blobs a failed write created, so they do not outlive the attempt.
    fn discard_blobs(&self, created: Vec<BlobId>) {
        for id in created {
            if let Err(e) = self.delete_blob(id) {
                debug!(blob_id = %id, error = %e, "failed to discard blob");
            }
        }
    }
}

/// Build the partial `UPDATE` for a diff. Column names are the snapshot field names.
fn build_update(
    id: JobId,
    revision: u64,
    diff: &StateDiff,
) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    let mut query = QueryBuilder::new("UPDATE job_records SET revision = revision + 1");
    for (field, value) in diff.iter() {
        if !fields::ALL.contains(&field) {
            return Err(StoreError::Unavailable(format!("unknown job column '{field}'")));
        }
        query.push(", ").push(field).push(" = ");
        match value {
            StateValue::Null => {
                query.push("NULL");
            }
            StateValue::Int(v) => {
                query.push_bind(*v);
            }
            StateValue::Text(v) => {
                query.push_bind(v.clone());
            }
            StateValue::Id(v) => {
                query.push_bind(*v);
            }
            StateValue::Timestamp(v) => {
                query.push_bind(*v);
            }
        }
    }
    query
        .push(" WHERE id = ")
        .push_bind(*id.as_uuid())
        .push(" AND revision = ")
        .push_bind(to_db_revision(revision))
        .push(" RETURNING revision");
    Ok(query)
}

fn bind_job<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    job: &'q JobRecord,
    revision: u64,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(job.id().as_uuid())
        .bind(to_db_revision(revision))
        .bind(job.handler_type())
        .bind(job.handler_configuration())
        .bind(
            job.advanced_configuration_ref()
                .and_then(BlobRef::id)
                .map(Uuid::from),
        )
        .bind(i64::from(job.retries()))
        .bind(job.exception_message())
        .bind(job.exception_ref().and_then(BlobRef::id).map(Uuid::from))
        .bind(job.tenant_id().as_str())
        .bind(job.lock_owner().map(LockOwner::as_str))
        .bind(job.lock_expiration_time())
        .bind(job.due_at())
        .bind(job.create_time())
}

async fn delete_referenced_blobs(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    row: &PgRow,
) -> Result<(), StoreError> {
    let mut ids = Vec::with_capacity(2);
    for column in [fields::ADVANCED_CONFIGURATION_BLOB_ID, fields::EXCEPTION_BLOB_ID] {
        let id: Option<Uuid> = row
            .try_get(column)
            .map_err(|e| map_sqlx_error("delete_referenced_blobs", e))?;
        ids.extend(id);
    }
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query("DELETE FROM job_blobs WHERE id = ANY($1)")
        .bind(ids)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_referenced_blobs", e))?;
    Ok(())
}

fn job_from_row(row: &PgRow) -> Result<StoredJob, StoreError> {
    let map = |e: sqlx::Error| map_sqlx_error("job_from_row", e);

    let owner: Option<String> = row.try_get(fields::LOCK_OWNER).map_err(map)?;
    let expires_at: Option<DateTime<Utc>> =
        row.try_get(fields::LOCK_EXPIRATION_TIME).map_err(map)?;
    let lock = match (owner, expires_at) {
        (Some(owner), Some(expires_at)) => Some(JobLock {
            owner: LockOwner::new(owner)
                .map_err(|e| StoreError::Unavailable(format!("corrupt lock owner: {e}")))?,
            expires_at,
        }),
        _ => None,
    };

    let retries: i64 = row.try_get(fields::RETRIES).map_err(map)?;
    let revision: i64 = row.try_get("revision").map_err(map)?;

    Ok(StoredJob {
        id: JobId::from_uuid(row.try_get("id").map_err(map)?),
        revision: to_revision(revision)?,
        handler_type: row.try_get(fields::HANDLER_TYPE).map_err(map)?,
        handler_configuration: row.try_get(fields::HANDLER_CONFIGURATION).map_err(map)?,
        advanced_configuration_blob_id: row
            .try_get::<Option<Uuid>, _>(fields::ADVANCED_CONFIGURATION_BLOB_ID)
            .map_err(map)?
            .map(BlobId::from_uuid),
        retries: u32::try_from(retries)
            .map_err(|_| StoreError::Unavailable(format!("corrupt retries value {retries}")))?,
        exception_message: row.try_get(fields::EXCEPTION_MESSAGE).map_err(map)?,
        exception_blob_id: row
            .try_get::<Option<Uuid>, _>(fields::EXCEPTION_BLOB_ID)
            .map_err(map)?
            .map(BlobId::from_uuid),
        tenant_id: TenantId::new(row.try_get::<String, _>(fields::TENANT_ID).map_err(map)?),
        lock,
        due_at: row.try_get(fields::DUE_AT).map_err(map)?,
        create_time: row.try_get("create_time").map_err(map)?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterJob, StoreError> {
    let job = JobRecord::from(job_from_row(row)?);
    let at: DateTime<Utc> = row
        .try_get("dead_lettered_at")
        .map_err(|e| map_sqlx_error("dead_letter_from_row", e))?;
    let reason: String = row
        .try_get("reason")
        .map_err(|e| map_sqlx_error("dead_letter_from_row", e))?;
    Ok(DeadLetterJob::new(job, reason, at))
}

fn to_db_revision(revision: u64) -> i64 {
    i64::try_from(revision).unwrap_or(i64::MAX)
}

fn to_revision(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Unavailable(format!("corrupt revision {value}")))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::Unavailable(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

impl BlobStore for PostgresJobStore {
    fn get_blob(&self, id: BlobId) -> Result<Option<Vec<u8>>, StoreError> {
        self.block_on(self.fetch_blob(id))?
    }

    fn put_blob(&self, name: &str, bytes: &[u8]) -> Result<BlobId, StoreError> {
        let id = BlobId::new();
        self.block_on(self.insert_blob(id, name, bytes))??;
        Ok(id)
    }

    fn delete_blob(&self, id: BlobId) -> Result<(), StoreError> {
        self.block_on(self.remove_blob(id))?
    }
}

impl JobStore for PostgresJobStore {
    fn insert_job(&self, job: &mut JobRecord) -> Result<(), StoreError> {
        let created = job.flush_blobs(self)?;
        if let Err(e) = self.block_on(self.insert_row(job))? {
            self.discard_blobs(created);
            return Err(e);
        }
        job.purge_retired_blobs(self)
    }

    fn load_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.block_on(self.fetch_job(id))?
    }

    fn conditional_claim(
        &self,
        id: JobId,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.block_on(self.try_claim(id, owner, expires_at, now))?
    }

    fn conditional_renew(
        &self,
        id: JobId,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.block_on(self.try_renew(id, owner, expires_at))?
    }

    fn conditional_release(&self, id: JobId, owner: &LockOwner) -> Result<bool, StoreError> {
        self.block_on(self.try_release(id, owner))?
    }

    fn update_job(
        &self,
        job: &mut JobRecord,
        baseline: &PersistentState,
    ) -> Result<StateDiff, StoreError> {
        let created = job.flush_blobs(self)?;
        let diff = baseline.diff(&job.persistent_state());
        if diff.is_empty() {
            job.purge_retired_blobs(self)?;
            return Ok(diff);
        }

        match self.block_on(self.apply_diff(*job.id(), job.revision(), &diff))? {
            Ok(revision) => {
                job.set_revision(revision);
                job.purge_retired_blobs(self)?;
                Ok(diff)
            }
            Err(e) => {
                self.discard_blobs(created);
                Err(e)
            }
        }
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        self.block_on(self.delete_row(id))?
    }

    fn find_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, StoreError> {
        self.block_on(self.due_job_ids(now, limit))?
    }

    fn dead_letter(
        &self,
        job: &mut JobRecord,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let created = job.flush_blobs(self)?;
        let expected = job.revision();
        job.clear_lock();
        job.set_revision(expected + 1);

        if let Err(e) = self.block_on(self.move_to_dead_letter(job, expected, reason, at))? {
            job.set_revision(expected);
            self.discard_blobs(created);
            return Err(e);
        }
        job.purge_retired_blobs(self)
    }

    fn load_dead_letter(&self, id: JobId) -> Result<Option<DeadLetterJob>, StoreError> {
        self.block_on(self.fetch_dead_letter(id))?
    }

    fn list_dead_letters(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterJob>, StoreError> {
        self.block_on(self.dead_letters_for(tenant_id, limit))?
    }

    fn restore_dead_letter(&self, id: JobId, retries: u32) -> Result<JobRecord, StoreError> {
        self.block_on(self.restore_row(id, retries))?
    }

    fn delete_dead_letter(&self, id: JobId) -> Result<(), StoreError> {
        self.block_on(self.delete_dead_letter_row(id))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff_of(before: PersistentState, after: PersistentState) -> StateDiff {
        before.diff(&after)
    }

    #[test]
    fn update_writes_only_changed_columns() {
        let diff = diff_of(
            PersistentState::new().with(fields::RETRIES, 3u32).with(fields::HANDLER_TYPE, "t"),
            PersistentState::new().with(fields::RETRIES, 2u32).with(fields::HANDLER_TYPE, "t"),
        );
        let query = build_update(JobId::new(), 4, &diff).unwrap();
        assert_eq!(
            query.sql(),
            "UPDATE job_records SET revision = revision + 1, retries = $1 \
             WHERE id = $2 AND revision = $3 RETURNING revision"
        );
    }

    #[test]
    fn cleared_fields_are_written_as_null() {
        let diff = diff_of(
            PersistentState::new()
                .with(fields::LOCK_OWNER, "node-a")
                .with(fields::LOCK_EXPIRATION_TIME, Utc::now()),
            PersistentState::new(),
        );
        let query = build_update(JobId::new(), 1, &diff).unwrap();
        assert_eq!(
            query.sql(),
            "UPDATE job_records SET revision = revision + 1, lock_expiration_time = NULL, \
             lock_owner = NULL WHERE id = $1 AND revision = $2 RETURNING revision"
        );
    }

    #[test]
    fn unknown_columns_are_rejected() {
        let diff = diff_of(
            PersistentState::new(),
            PersistentState::new().with("bogus; DROP TABLE job_records", 1i64),
        );
        assert!(matches!(
            build_update(JobId::new(), 1, &diff),
            Err(StoreError::Unavailable(_))
        ));
    }
}
