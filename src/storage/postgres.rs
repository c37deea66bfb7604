// src/storage/postgres.rs
use async_trait::async_trait;
use chrono::SubsecRound;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::domain::{AuditEntry, AuditFilter, OrgId, Run, RunFilter, RunId, RuleSetVersion};
use crate::rules::RuleSet;

use super::error::StorageError;
use super::traits::{AppendOutcome, PageCursor, RunStore};

/// Terminal statuses share this rank; see `RunStatus::rank`.
const TERMINAL_RANK: i16 = 2;

const UPSERT_RUN: &str = r#"
    INSERT INTO runs (
        org_id, id, rule_set_version, fingerprint, status, status_rank,
        actor, facts, decision, body, created_at, completed_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT (org_id, id) DO UPDATE SET
        status = EXCLUDED.status,
        status_rank = EXCLUDED.status_rank,
        decision = EXCLUDED.decision,
        body = EXCLUDED.body,
        completed_at = EXCLUDED.completed_at
    WHERE runs.status_rank < $13
      AND runs.status_rank <= EXCLUDED.status_rank
"#;

const INSERT_AUDIT: &str = r#"
    INSERT INTO audit_entries (
        org_id, run_id, rule_set_version, status, outcome, actor, body, recorded_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (org_id, run_id) DO NOTHING
"#;

/// PostgreSQL implementation of `RunStore`.
///
/// Every table is keyed by `(org_id, ...)`; the full entity is kept as a
/// JSONB `body` next to the columns used for filtering.
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    /// Create a new store with a connection pool.
    pub async fn connect(
        database_url: &str,
        min_connections: u32,
        max_connections: u32,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn upsert_run<'q>(org: &'q OrgId, run: &'q Run) -> Query<'q, Postgres, PgArguments> {
    sqlx::query(UPSERT_RUN)
        .bind(org.as_str())
        .bind(run.id.as_uuid())
        .bind(run.rule_set_version.as_str())
        .bind(run.fingerprint.as_str())
        .bind(run.status().as_str())
        .bind(run.status().rank() as i16)
        .bind(run.actor.as_str())
        .bind(Json(&run.facts))
        .bind(run.decision().map(Json))
        .bind(Json(run))
        .bind(run.created_at)
        .bind(run.completed_at())
        .bind(TERMINAL_RANK)
}

fn insert_audit<'q>(org: &'q OrgId, entry: &'q AuditEntry) -> Query<'q, Postgres, PgArguments> {
    sqlx::query(INSERT_AUDIT)
        .bind(org.as_str())
        .bind(entry.run_id.as_uuid())
        .bind(entry.rule_set_version.as_str())
        .bind(entry.status.as_str())
        .bind(entry.outcome().map(|o| o.as_str()))
        .bind(entry.actor.as_str())
        .bind(Json(entry))
        .bind(entry.recorded_at)
}

fn conflict(run: &Run) -> StorageError {
    StorageError::Conflict(format!(
        "run {} cannot move to {} from its stored status",
        run.id,
        run.status()
    ))
}

fn push_cursor(qb: &mut QueryBuilder<'_, Postgres>, at_col: &str, id_col: &str, after: Option<PageCursor>) {
    if let Some(cursor) = after {
        // Columns hold microseconds.
        qb.push(format!(" AND ({}, {}) > (", at_col, id_col))
            .push_bind(cursor.at.trunc_subsecs(6))
            .push(", ")
            .push_bind(cursor.id)
            .push(")");
    }
}

fn tenant_check(org: &OrgId, found: &OrgId) -> Result<(), StorageError> {
    if org != found {
        return Err(StorageError::TenantMismatch {
            expected: org.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn put_run(&self, org: &OrgId, run: &Run) -> Result<(), StorageError> {
        tenant_check(org, &run.org_id)?;

        let result = upsert_run(org, run).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(conflict(run));
        }
        Ok(())
    }

    async fn get_run(&self, org: &OrgId, id: RunId) -> Result<Option<Run>, StorageError> {
        let row: Option<Json<Run>> = sqlx::query_scalar(
            r#"
            SELECT body
            FROM runs
            WHERE org_id = $1 AND id = $2
            "#,
        )
        .bind(org.as_str())
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|Json(run)| run))
    }

    async fn query_runs(
        &self,
        org: &OrgId,
        filter: &RunFilter,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Run>, StorageError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT body FROM runs WHERE org_id = ");
        qb.push_bind(org.as_str());

        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(actor) = &filter.created_by {
            qb.push(" AND actor = ").push_bind(actor.as_str());
        }
        if let Some(version) = &filter.rule_set_version {
            qb.push(" AND rule_set_version = ").push_bind(version.as_str());
        }
        if let Some(t) = filter.created_after {
            qb.push(" AND created_at > ").push_bind(t);
        }
        if let Some(t) = filter.created_before {
            qb.push(" AND created_at < ").push_bind(t);
        }
        push_cursor(&mut qb, "created_at", "id", after);
        qb.push(" ORDER BY created_at, id LIMIT ").push_bind(limit as i64);

        let rows: Vec<Json<Run>> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|Json(run)| run).collect())
    }

    async fn put_rule_set(&self, org: &OrgId, rule_set: &RuleSet) -> Result<RuleSet, StorageError> {
        tenant_check(org, rule_set.org_id())?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO rule_sets (org_id, version, content_hash, missing_facts, body, published_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (org_id, version) DO NOTHING
            "#,
        )
        .bind(org.as_str())
        .bind(rule_set.version().as_str())
        .bind(rule_set.content_hash())
        .bind(rule_set.missing_facts().as_str())
        .bind(Json(rule_set))
        .bind(rule_set.published_at())
        .execute(&mut *tx)
        .await?;

        let Json(stored): Json<RuleSet> = sqlx::query_scalar(
            r#"
            SELECT body
            FROM rule_sets
            WHERE org_id = $1 AND version = $2
            "#,
        )
        .bind(org.as_str())
        .bind(rule_set.version().as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn get_rule_set(
        &self,
        org: &OrgId,
        version: &RuleSetVersion,
    ) -> Result<Option<RuleSet>, StorageError> {
        let row: Option<Json<RuleSet>> = sqlx::query_scalar(
            r#"
            SELECT body
            FROM rule_sets
            WHERE org_id = $1 AND version = $2
            "#,
        )
        .bind(org.as_str())
        .bind(version.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|Json(rule_set)| rule_set))
    }

    async fn append_audit(
        &self,
        org: &OrgId,
        entry: &AuditEntry,
    ) -> Result<AppendOutcome, StorageError> {
        tenant_check(org, &entry.org_id)?;

        let result = insert_audit(org, entry).execute(&self.pool).await?;
        Ok(if result.rows_affected() == 0 {
            AppendOutcome::AlreadyRecorded
        } else {
            AppendOutcome::Appended
        })
    }

    async fn finalize_run(
        &self,
        org: &OrgId,
        run: &Run,
        entry: &AuditEntry,
    ) -> Result<AppendOutcome, StorageError> {
        tenant_check(org, &run.org_id)?;
        tenant_check(org, &entry.org_id)?;

        let mut tx = self.pool.begin().await?;

        let appended = insert_audit(org, entry).execute(&mut *tx).await?;
        if appended.rows_affected() == 0 {
            // The entry may have been appended on its own. The guarded upsert
            // leaves terminal rows alone and settles anything earlier.
            upsert_run(org, run).execute(&mut *tx).await?;
            tx.commit().await?;
            return Ok(AppendOutcome::AlreadyRecorded);
        }

        let updated = upsert_run(org, run).execute(&mut *tx).await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(conflict(run));
        }

        tx.commit().await?;
        Ok(AppendOutcome::Appended)
    }

    async fn list_audit(
        &self,
        org: &OrgId,
        filter: &AuditFilter,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, StorageError> {
        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT body FROM audit_entries WHERE org_id = ");
        qb.push_bind(org.as_str());

        if let Some(run_id) = filter.run_id {
            qb.push(" AND run_id = ").push_bind(run_id.as_uuid());
        }
        if let Some(version) = &filter.rule_set_version {
            qb.push(" AND rule_set_version = ").push_bind(version.as_str());
        }
        if let Some(outcome) = filter.outcome {
            qb.push(" AND outcome = ").push_bind(outcome.as_str());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        push_cursor(&mut qb, "recorded_at", "run_id", after);
        qb.push(" ORDER BY recorded_at, run_id LIMIT ").push_bind(limit as i64);

        let rows: Vec<Json<AuditEntry>> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|Json(entry)| entry).collect())
    }
}
