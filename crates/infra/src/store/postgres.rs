//! Postgres-backed job store.
//!
//! ## Schema
//!
//! One row per job in `jobs`, with the optimistic `version` column checked in
//! the `WHERE` clause of every update. Stage artifacts live in
//! `dialogue_turns`, `summaries` and `insights`, keyed by `job_id`.
//! `ensure_schema()` creates the tables idempotently.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` on insert, `Concurrency` otherwise |
//! | Database (check violation) | `23514` | `InvalidWrite` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |
//!
//! ## Sync access
//!
//! `JobStore` is a blocking trait used from worker threads. The store keeps a
//! `tokio::runtime::Handle` and drives its async queries with `block_on`, so
//! trait methods must be called from threads that are *not* runtime workers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use callpipe_core::{
    AudioRef, DialogueTurn, ExpectedVersion, Insight, Job, JobError, JobId, JobStatus, Summary,
};

use super::r#trait::{JobFilter, JobSnapshot, JobStore, StageOutput, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    status TEXT NOT NULL,
    source TEXT NOT NULL,
    audio_ref TEXT NOT NULL,
    version BIGINT NOT NULL CHECK (version >= 0),
    attempt_count JSONB NOT NULL DEFAULT '{}'::jsonb,
    last_error JSONB,
    cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
    extra_meta JSONB,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS jobs_status_updated_idx ON jobs (status, updated_at);
CREATE INDEX IF NOT EXISTS jobs_created_idx ON jobs (created_at DESC);

CREATE TABLE IF NOT EXISTS dialogue_turns (
    job_id UUID NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
    seq INTEGER NOT NULL CHECK (seq >= 0),
    channel TEXT NOT NULL,
    start_ms BIGINT NOT NULL,
    end_ms BIGINT NOT NULL CHECK (end_ms >= start_ms),
    text TEXT NOT NULL,
    PRIMARY KEY (job_id, seq)
);

CREATE TABLE IF NOT EXISTS summaries (
    job_id UUID PRIMARY KEY REFERENCES jobs (id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    generated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS insights (
    job_id UUID NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
    idx INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload JSONB NOT NULL,
    PRIMARY KEY (job_id, idx)
);
"#;

const JOB_COLUMNS: &str = "id, status, source, audio_ref, version, attempt_count, last_error, \
                           cancel_requested, extra_meta, created_at, updated_at";

/// Postgres-backed job store with version-checked writes.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    /// Create a store on `pool`, driving queries on `runtime`.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Postgres>, StoreError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))
    }

    /// Create tables and indexes if they are missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn insert_job(&self, job: &Job) -> Result<Job, StoreError> {
        if job.version != 0 {
            return Err(StoreError::InvalidWrite(format!(
                "new job {} must start at version 0, got {}",
                job.id, job.version
            )));
        }
        let encoded = EncodedJob::encode(job)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, status, source, audio_ref, version, attempt_count,
                last_error, cancel_requested, extra_meta, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.source.as_str())
        .bind(job.audio_ref.as_str())
        .bind(&encoded.attempt_count)
        .bind(&encoded.last_error)
        .bind(job.cancel_requested)
        .bind(&job.extra_meta)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(job.clone())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let mut conn = self.acquire().await?;
        fetch_job(&mut conn, job_id).await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    pub async fn update_job(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError> {
        let mut conn = self.acquire().await?;
        write_job(&mut conn, job, expected).await
    }

    #[instrument(
        skip(self, job, output),
        fields(job_id = %job.id, status = %job.status, stage = %output.stage()),
        err
    )]
    pub async fn commit_stage_output(
        &self,
        job: &Job,
        expected: ExpectedVersion,
        output: StageOutput,
    ) -> Result<Job, StoreError> {
        output.check_owner(job.id)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Version check first: a losing writer must not touch artifact tables.
        let stored = match write_job(&mut tx, job, expected).await {
            Ok(stored) => stored,
            Err(e) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(e);
            }
        };

        write_output(&mut tx, job.id, &output).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(stored)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_turns(&self, job_id: JobId) -> Result<Vec<DialogueTurn>, StoreError> {
        let mut conn = self.acquire().await?;
        fetch_turns(&mut conn, job_id).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_summary(&self, job_id: JobId) -> Result<Option<Summary>, StoreError> {
        let mut conn = self.acquire().await?;
        fetch_summary(&mut conn, job_id).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_insights(&self, job_id: JobId) -> Result<Vec<Insight>, StoreError> {
        let mut conn = self.acquire().await?;
        fetch_insights(&mut conn, job_id).await
    }

    /// Job row and artifacts inside one `REPEATABLE READ` transaction, so all
    /// four reads see the same committed state.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_snapshot(&self, job_id: JobId) -> Result<Option<JobSnapshot>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;

        let Some(job) = fetch_job(&mut tx, job_id).await? else {
            return Ok(None);
        };
        let snapshot = JobSnapshot {
            job,
            turns: fetch_turns(&mut tx, job_id).await?,
            summary: fetch_summary(&mut tx, job_id).await?,
            insights: fetch_insights(&mut tx, job_id).await?,
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(snapshot))
    }

    /// Newest-first listing. Status and age filters use `COALESCE`-style optional binds.
    #[instrument(skip(self, filter), err)]
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let statuses: Option<Vec<String>> = (!filter.statuses.is_empty())
            .then(|| filter.statuses.iter().map(|s| s.as_str().to_string()).collect());
        let limit = filter.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::text[] IS NULL OR status = ANY($1))
              AND ($2::timestamptz IS NULL OR updated_at < $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(statuses)
        .bind(filter.updated_before)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, job: &Job) -> Result<Job, StoreError> {
        self.runtime.block_on(self.insert_job(job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.runtime.block_on(self.load_job(job_id))
    }

    fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError> {
        self.runtime.block_on(self.update_job(job, expected))
    }

    fn commit_stage(
        &self,
        job: &Job,
        expected: ExpectedVersion,
        output: StageOutput,
    ) -> Result<Job, StoreError> {
        self.runtime
            .block_on(self.commit_stage_output(job, expected, output))
    }

    fn turns(&self, job_id: JobId) -> Result<Vec<DialogueTurn>, StoreError> {
        self.runtime.block_on(self.load_turns(job_id))
    }

    fn summary(&self, job_id: JobId) -> Result<Option<Summary>, StoreError> {
        self.runtime.block_on(self.load_summary(job_id))
    }

    fn insights(&self, job_id: JobId) -> Result<Vec<Insight>, StoreError> {
        self.runtime.block_on(self.load_insights(job_id))
    }

    fn snapshot(&self, job_id: JobId) -> Result<Option<JobSnapshot>, StoreError> {
        self.runtime.block_on(self.load_snapshot(job_id))
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        self.runtime.block_on(self.list_jobs(filter))
    }
}

/// JSON columns of a job row.
struct EncodedJob {
    attempt_count: JsonValue,
    last_error: Option<JsonValue>,
}

impl EncodedJob {
    fn encode(job: &Job) -> Result<Self, StoreError> {
        Ok(Self {
            attempt_count: serde_json::to_value(&job.attempt_count)
                .map_err(|e| StoreError::InvalidWrite(e.to_string()))?,
            last_error: job
                .last_error
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| StoreError::InvalidWrite(e.to_string()))?,
        })
    }
}

/// Version-checked overwrite of one job row, on a connection or inside a transaction.
async fn write_job(
    conn: &mut PgConnection,
    job: &Job,
    expected: ExpectedVersion,
) -> Result<Job, StoreError> {
    let encoded = EncodedJob::encode(job)?;
    let expected_version: Option<i64> = match expected {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    };

    let row = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            audio_ref = $3,
            attempt_count = $4,
            last_error = $5,
            cancel_requested = $6,
            extra_meta = $7,
            updated_at = $8,
            version = version + 1
        WHERE id = $1 AND ($9::bigint IS NULL OR version = $9)
        RETURNING version, created_at
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.audio_ref.as_str())
    .bind(&encoded.attempt_count)
    .bind(&encoded.last_error)
    .bind(job.cancel_requested)
    .bind(&job.extra_meta)
    .bind(job.updated_at)
    .bind(expected_version)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_job", e))?;

    if let Some(row) = row {
        let version: i64 = row.try_get("version").map_err(decode_error)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode_error)?;
        let mut stored = job.clone();
        stored.version = version as u64;
        stored.created_at = created_at;
        return Ok(stored);
    }

    // Nothing updated: either the row is gone or another writer got there first.
    let current: Option<i64> = sqlx::query_scalar("SELECT version FROM jobs WHERE id = $1")
        .bind(job.id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("check_version", e))?;

    match current {
        None => Err(StoreError::NotFound(job.id)),
        Some(actual) => Err(StoreError::version_mismatch(job.id, expected, actual as u64)),
    }
}

/// Replace the artifact rows a stage owns.
async fn write_output(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
    output: &StageOutput,
) -> Result<(), StoreError> {
    match output {
        StageOutput::Turns(turns) => {
            sqlx::query("DELETE FROM dialogue_turns WHERE job_id = $1")
                .bind(job_id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("replace_turns", e))?;

            for turn in turns {
                sqlx::query(
                    r#"
                    INSERT INTO dialogue_turns (job_id, seq, channel, start_ms, end_ms, text)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(job_id.as_uuid())
                .bind(turn.seq as i32)
                .bind(turn.channel.as_str())
                .bind(turn.start_ms as i64)
                .bind(turn.end_ms as i64)
                .bind(&turn.text)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("insert_turn", e))?;
            }
        }
        StageOutput::Summary(summary) => {
            sqlx::query(
                r#"
                INSERT INTO summaries (job_id, text, generated_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (job_id) DO UPDATE
                SET text = EXCLUDED.text, generated_at = EXCLUDED.generated_at
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(&summary.text)
            .bind(summary.generated_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_summary", e))?;
        }
        StageOutput::Insights(insights) => {
            sqlx::query("DELETE FROM insights WHERE job_id = $1")
                .bind(job_id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("replace_insights", e))?;

            for (idx, insight) in insights.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO insights (job_id, idx, kind, payload) VALUES ($1, $2, $3, $4)",
                )
                .bind(job_id.as_uuid())
                .bind(idx as i32)
                .bind(insight.kind.as_str())
                .bind(&insight.payload)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("insert_insight", e))?;
            }
        }
    }
    Ok(())
}

async fn fetch_job(conn: &mut PgConnection, job_id: JobId) -> Result<Option<Job>, StoreError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_job", e))?;

    row.map(|r| job_from_row(&r)).transpose()
}

async fn fetch_turns(conn: &mut PgConnection, job_id: JobId) -> Result<Vec<DialogueTurn>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT job_id, seq, channel, start_ms, end_ms, text
        FROM dialogue_turns
        WHERE job_id = $1
        ORDER BY seq ASC
        "#,
    )
    .bind(job_id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_turns", e))?;

    rows.iter().map(turn_from_row).collect()
}

async fn fetch_summary(conn: &mut PgConnection, job_id: JobId) -> Result<Option<Summary>, StoreError> {
    let row = sqlx::query("SELECT job_id, text, generated_at FROM summaries WHERE job_id = $1")
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_summary", e))?;

    row.map(|r| -> Result<Summary, StoreError> {
        Ok(Summary {
            job_id: JobId::from_uuid(r.try_get("job_id").map_err(decode_error)?),
            text: r.try_get("text").map_err(decode_error)?,
            generated_at: r.try_get("generated_at").map_err(decode_error)?,
        })
    })
    .transpose()
}

async fn fetch_insights(conn: &mut PgConnection, job_id: JobId) -> Result<Vec<Insight>, StoreError> {
    let rows = sqlx::query(
        "SELECT job_id, kind, payload FROM insights WHERE job_id = $1 ORDER BY idx ASC",
    )
    .bind(job_id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_insights", e))?;

    rows.iter()
        .map(|r| -> Result<Insight, StoreError> {
            let kind: String = r.try_get("kind").map_err(decode_error)?;
            Ok(Insight {
                job_id: JobId::from_uuid(r.try_get("job_id").map_err(decode_error)?),
                kind: kind.parse().map_err(|e| StoreError::Storage(format!("{e}")))?,
                payload: r.try_get("payload").map_err(decode_error)?,
            })
        })
        .collect()
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let source: String = row.try_get("source").map_err(decode_error)?;
    let audio_ref: String = row.try_get("audio_ref").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    let attempt_count: JsonValue = row.try_get("attempt_count").map_err(decode_error)?;
    let last_error: Option<JsonValue> = row.try_get("last_error").map_err(decode_error)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        status: status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Storage(format!("{e}")))?,
        source: serde_json::from_value(JsonValue::String(source))
            .map_err(|e| StoreError::Storage(format!("unknown job source: {e}")))?,
        audio_ref: AudioRef::from_stored(audio_ref),
        version: version as u64,
        attempt_count: serde_json::from_value(attempt_count)
            .map_err(|e| StoreError::Storage(format!("bad attempt_count: {e}")))?,
        last_error: last_error
            .map(serde_json::from_value::<JobError>)
            .transpose()
            .map_err(|e| StoreError::Storage(format!("bad last_error: {e}")))?,
        cancel_requested: row.try_get("cancel_requested").map_err(decode_error)?,
        extra_meta: row.try_get("extra_meta").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
    })
}

fn turn_from_row(row: &sqlx::postgres::PgRow) -> Result<DialogueTurn, StoreError> {
    let channel: String = row.try_get("channel").map_err(decode_error)?;
    let seq: i32 = row.try_get("seq").map_err(decode_error)?;
    let start_ms: i64 = row.try_get("start_ms").map_err(decode_error)?;
    let end_ms: i64 = row.try_get("end_ms").map_err(decode_error)?;

    Ok(DialogueTurn {
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode_error)?),
        seq: seq as u32,
        channel: channel
            .parse()
            .map_err(|e| StoreError::Storage(format!("{e}")))?,
        start_ms: start_ms as u64,
        end_ms: end_ms as u64,
        text: row.try_get("text").map_err(decode_error)?,
    })
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("row decode failed: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Concurrency(msg),
                Some("23514") => StoreError::InvalidWrite(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed during {}", operation))
        }
        other => StoreError::Storage(format!("{} failed: {}", operation, other)),
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

#[cfg(test)]
mod tests {
    use super::*;
    use callpipe_core::{JobSource, Stage};

    #[test]
    fn encoded_attempt_counts_use_stage_names() {
        let mut job = Job::new(AudioRef::parse("a.wav").unwrap(), JobSource::Audio, None);
        job.attempt_count.insert(Stage::Summary, 2);

        let encoded = EncodedJob::encode(&job).unwrap();
        assert_eq!(encoded.attempt_count, serde_json::json!({ "summary": 2 }));
        assert!(encoded.last_error.is_none());
    }

    #[test]
    fn job_source_decodes_from_column_text() {
        let source: JobSource =
            serde_json::from_value(JsonValue::String(JobSource::Transcript.as_str().into())).unwrap();
        assert_eq!(source, JobSource::Transcript);
    }

    #[test]
    fn pool_closed_maps_to_storage_error() {
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::PoolClosed),
            StoreError::Storage(_)
        ));
    }
}
