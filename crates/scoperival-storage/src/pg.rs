use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scoperival_core::{
    ChangeRecord, Competitor, CompetitorPatch, JobStatus, MonitoringJob, NewChangeRecord,
    NewCompetitor, Session,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{ChangeFeed, ChangeNotification, Store, StoreError};

const COMPETITOR_COLUMNS: &str = "id, owner_id, name, url, status, last_checked, last_hash, changes_detected, added_at";

/// Postgres-backed store. Every statement filters on the session owner.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    feed: ChangeFeed,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            feed: ChangeFeed::default(),
        }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running store migrations")?;
        info!("store migrations complete");
        Ok(())
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

fn decode<T, E: std::fmt::Display>(value: Result<T, E>) -> Result<T, StoreError> {
    value.map_err(|e| StoreError::Backend(e.to_string()))
}

fn counter_to_db(value: u32) -> Result<i32, StoreError> {
    decode(i32::try_from(value))
}

fn competitor_from_row(row: &PgRow) -> Result<Competitor, StoreError> {
    let status: String = row.try_get("status").map_err(map_sqlx)?;
    let changes: i32 = row.try_get("changes_detected").map_err(map_sqlx)?;
    Ok(Competitor {
        id: row.try_get("id").map_err(map_sqlx)?,
        owner_id: row.try_get("owner_id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        url: row.try_get("url").map_err(map_sqlx)?,
        status: decode(status.parse())?,
        last_checked: row.try_get("last_checked").map_err(map_sqlx)?,
        last_fingerprint: row.try_get("last_hash").map_err(map_sqlx)?,
        changes_detected: decode(u32::try_from(changes))?,
        added_at: row.try_get("added_at").map_err(map_sqlx)?,
    })
}

fn change_record_from_row(row: &PgRow) -> Result<ChangeRecord, StoreError> {
    let change_type: String = row.try_get("change_type").map_err(map_sqlx)?;
    let severity: String = row.try_get("severity").map_err(map_sqlx)?;
    Ok(ChangeRecord {
        id: row.try_get("id").map_err(map_sqlx)?,
        competitor_id: row.try_get("competitor_id").map_err(map_sqlx)?,
        competitor_name: row.try_get("competitor_name").map_err(map_sqlx)?,
        change_type: decode(change_type.parse())?,
        description: row.try_get("description").map_err(map_sqlx)?,
        severity: decode(severity.parse())?,
        detected_at: row.try_get("detected_at").map_err(map_sqlx)?,
    })
}

fn job_from_row(row: &PgRow) -> Result<MonitoringJob, StoreError> {
    let status: String = row.try_get("status").map_err(map_sqlx)?;
    Ok(MonitoringJob {
        id: row.try_get("id").map_err(map_sqlx)?,
        competitor_id: row.try_get("competitor_id").map_err(map_sqlx)?,
        owner_id: row.try_get("owner_id").map_err(map_sqlx)?,
        status: decode(status.parse())?,
        scheduled_at: row.try_get("scheduled_at").map_err(map_sqlx)?,
        completed_at: row.try_get("completed_at").map_err(map_sqlx)?,
        error_message: row.try_get("error_message").map_err(map_sqlx)?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn create_competitor(
        &self,
        session: &Session,
        new: NewCompetitor,
    ) -> Result<Competitor, StoreError> {
        session.ensure_valid()?;
        let competitor = Competitor::from_new(session.user_id(), new, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO competitors (id, owner_id, name, url, status, changes_detected, added_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            "#,
        )
        .bind(competitor.id)
        .bind(competitor.owner_id)
        .bind(&competitor.name)
        .bind(&competitor.url)
        .bind(competitor.status.as_str())
        .bind(competitor.added_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(competitor)
    }

    async fn get_competitor(
        &self,
        session: &Session,
        id: Uuid,
    ) -> Result<Option<Competitor>, StoreError> {
        session.ensure_valid()?;
        let row = sqlx::query(&format!(
            "SELECT {COMPETITOR_COLUMNS} FROM competitors WHERE id = $1 AND owner_id = $2"
        ))
        .bind(id)
        .bind(session.user_id())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(competitor_from_row).transpose()
    }

    async fn list_competitors(&self, session: &Session) -> Result<Vec<Competitor>, StoreError> {
        session.ensure_valid()?;
        let rows = sqlx::query(&format!(
            "SELECT {COMPETITOR_COLUMNS} FROM competitors WHERE owner_id = $1 ORDER BY added_at DESC"
        ))
        .bind(session.user_id())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(competitor_from_row).collect()
    }

    async fn update_competitor(
        &self,
        session: &Session,
        id: Uuid,
        patch: &CompetitorPatch,
    ) -> Result<Competitor, StoreError> {
        session.ensure_valid()?;
        let changes = patch.changes_detected.map(counter_to_db).transpose()?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE competitors
               SET status = COALESCE($3, status),
                   last_checked = COALESCE($4, last_checked),
                   last_hash = COALESCE($5, last_hash),
                   changes_detected = COALESCE($6, changes_detected)
             WHERE id = $1
               AND owner_id = $2
            RETURNING {COMPETITOR_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(session.user_id())
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.last_checked)
        .bind(patch.last_fingerprint.as_deref())
        .bind(changes)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        match row {
            Some(row) => competitor_from_row(&row),
            None => Err(StoreError::competitor_not_found(id)),
        }
    }

    async fn delete_competitor(&self, session: &Session, id: Uuid) -> Result<(), StoreError> {
        session.ensure_valid()?;
        let result = sqlx::query("DELETE FROM competitors WHERE id = $1 AND owner_id = $2")
            .bind(id)
            .bind(session.user_id())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::competitor_not_found(id));
        }
        Ok(())
    }

    async fn insert_change_record(
        &self,
        session: &Session,
        new: NewChangeRecord,
    ) -> Result<ChangeRecord, StoreError> {
        session.ensure_valid()?;
        let record = ChangeRecord::from_new(new);
        let inserted = sqlx::query(
            r#"
            INSERT INTO change_records
                   (id, competitor_id, competitor_name, change_type, description, severity, detected_at)
            SELECT $1, $2, $3, $4, $5, $6, $7
             WHERE EXISTS (SELECT 1 FROM competitors WHERE id = $2 AND owner_id = $8)
            "#,
        )
        .bind(record.id)
        .bind(record.competitor_id)
        .bind(&record.competitor_name)
        .bind(record.change_type.as_str())
        .bind(&record.description)
        .bind(record.severity.as_str())
        .bind(record.detected_at)
        .bind(session.user_id())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::competitor_not_found(record.competitor_id));
        }
        self.feed.publish(ChangeNotification {
            owner_id: session.user_id(),
            record: record.clone(),
        });
        Ok(record)
    }

    async fn list_change_records(
        &self,
        session: &Session,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        session.ensure_valid()?;
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.competitor_id, r.competitor_name, r.change_type,
                   r.description, r.severity, r.detected_at
              FROM change_records r
              JOIN competitors c ON c.id = r.competitor_id
             WHERE c.owner_id = $1
             ORDER BY r.detected_at DESC
            "#,
        )
        .bind(session.user_id())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(change_record_from_row).collect()
    }

    async fn create_monitoring_job(
        &self,
        session: &Session,
        job: MonitoringJob,
    ) -> Result<MonitoringJob, StoreError> {
        session.ensure_valid()?;
        if job.owner_id != session.user_id() {
            return Err(StoreError::competitor_not_found(job.competitor_id));
        }
        let inserted = sqlx::query(
            r#"
            INSERT INTO monitoring_jobs (id, competitor_id, owner_id, status, scheduled_at)
            SELECT $1, $2, $3, $4, $5
             WHERE EXISTS (SELECT 1 FROM competitors WHERE id = $2 AND owner_id = $3)
            "#,
        )
        .bind(job.id)
        .bind(job.competitor_id)
        .bind(job.owner_id)
        .bind(job.status.as_str())
        .bind(job.scheduled_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::competitor_not_found(job.competitor_id));
        }
        Ok(job)
    }

    async fn finish_monitoring_job(
        &self,
        session: &Session,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        session.ensure_valid()?;
        let result = sqlx::query(
            r#"
            UPDATE monitoring_jobs
               SET status = $3,
                   error_message = $4,
                   completed_at = $5
             WHERE id = $1
               AND owner_id = $2
            "#,
        )
        .bind(job_id)
        .bind(session.user_id())
        .bind(status.as_str())
        .bind(error_message)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "monitoring job",
                id: job_id,
            });
        }
        Ok(())
    }

    async fn list_monitoring_jobs(
        &self,
        session: &Session,
        competitor_id: Uuid,
    ) -> Result<Vec<MonitoringJob>, StoreError> {
        session.ensure_valid()?;
        let rows = sqlx::query(
            r#"
            SELECT id, competitor_id, owner_id, status, scheduled_at, completed_at, error_message
              FROM monitoring_jobs
             WHERE owner_id = $1
               AND competitor_id = $2
             ORDER BY scheduled_at DESC
            "#,
        )
        .bind(session.user_id())
        .bind(competitor_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_owner_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT owner_id FROM competitors ORDER BY owner_id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| row.try_get("owner_id").map_err(map_sqlx))
            .collect()
    }

    fn change_feed(&self) -> &ChangeFeed {
        &self.feed
    }
}
