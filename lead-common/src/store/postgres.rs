use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use uuid::Uuid;

use super::{JobSlice, LeadStore, StoreError, StoreResult};
use crate::mapping::FieldMapping;
use crate::model::{
    EventType, ImportJob, JobCompletion, LeadSource, NewLeadSource, NewProspect, Prospect,
    ProspectEvent, RawRecord, SourceConfig, SourceKind, Webhook, WebhookParams,
};

/// SQLSTATE classes 22 (data exception) and 23 (integrity constraint violation) are
/// caused by the values being written. Every other class is about the server itself:
/// shutdowns, connection limits, serialization failures, read-only replicas.
fn is_row_level_sqlstate(code: &str) -> bool {
    code.starts_with("22") || code.starts_with("23")
}

/// Classify a sqlx error: a data or constraint error is scoped to the record being
/// written, everything else means the store is not usable right now.
impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(db_error) => {
                let row_level = db_error
                    .code()
                    .map_or(false, |code| is_row_level_sqlstate(&code));
                if row_level {
                    StoreError::Rejected(db_error.to_string())
                } else {
                    StoreError::Unavailable(db_error.to_string())
                }
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => StoreError::Decode(error.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SourceRow {
    id: Uuid,
    name: String,
    kind: String,
    config: Json<SourceConfig>,
    credentials: Option<Value>,
    active: bool,
    last_synced_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<SourceRow> for LeadSource {
    fn from(row: SourceRow) -> Self {
        LeadSource {
            id: row.id,
            name: row.name,
            kind: SourceKind::from_str(&row.kind).unwrap_or(SourceKind::Unsupported(row.kind)),
            config: row.config.0,
            credentials: row.credentials,
            active: row.active,
            last_synced_at: row.last_synced_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    source_id: Uuid,
    operation: String,
    status: String,
    message: String,
    processed: i64,
    imported: i64,
    failed: i64,
    details: Value,
    error: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for ImportJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(ImportJob {
            id: row.id,
            source_id: row.source_id,
            operation: row
                .operation
                .parse()
                .map_err(|e: crate::model::ParseModelError| StoreError::Decode(e.to_string()))?,
            status: row
                .status
                .parse()
                .map_err(|e: crate::model::ParseModelError| StoreError::Decode(e.to_string()))?,
            message: row.message,
            processed: row.processed,
            imported: row.imported,
            failed: row.failed,
            details: row.details,
            error: row.error,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    source_id: Uuid,
    event_type: String,
    url: String,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WebhookRow> for Webhook {
    type Error = StoreError;

    fn try_from(row: WebhookRow) -> Result<Self, Self::Error> {
        Ok(Webhook {
            id: row.id,
            source_id: row.source_id,
            event_type: EventType::from_str(&row.event_type)
                .map_err(|e| StoreError::Decode(e.to_string()))?,
            url: row.url,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, source_id, operation, status, message, processed, imported, \
    failed, details, error, started_at, completed_at";

const WEBHOOK_COLUMNS: &str = "id, source_id, event_type, url, active, created_at, updated_at";

/// A `LeadStore` backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a new pool to the database at `url`.
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::Unavailable(error.to_string()))
    }
}

#[async_trait]
impl LeadStore for PgStore {
    async fn insert_source(&self, source: NewLeadSource) -> StoreResult<LeadSource> {
        let source = source.into_source();

        sqlx::query(
            r#"
INSERT INTO lead_sources
    (id, name, kind, config, credentials, active, last_synced_at, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(source.kind.to_string())
        .bind(Json(&source.config))
        .bind(&source.credentials)
        .bind(source.active)
        .bind(source.last_synced_at)
        .bind(source.created_at)
        .execute(&self.pool)
        .await?;

        Ok(source)
    }

    async fn get_source(&self, source_id: Uuid) -> StoreResult<Option<LeadSource>> {
        let row: Option<SourceRow> = sqlx::query_as(
            r#"
SELECT id, name, kind, config, credentials, active, last_synced_at, created_at
FROM lead_sources
WHERE id = $1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LeadSource::from))
    }

    async fn touch_last_synced(&self, source_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE lead_sources SET last_synced_at = $2 WHERE id = $1")
            .bind(source_id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Missing {
                entity: "lead source",
                id: source_id,
            });
        }
        Ok(())
    }

    async fn get_mapping(&self, source_id: Uuid) -> StoreResult<Option<FieldMapping>> {
        let mapping: Option<Json<FieldMapping>> =
            sqlx::query_scalar("SELECT mapping FROM field_mappings WHERE source_id = $1")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(mapping.map(|m| m.0))
    }

    async fn put_mapping(&self, source_id: Uuid, mapping: &FieldMapping) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO field_mappings (source_id, mapping, updated_at)
VALUES ($1, $2, NOW())
ON CONFLICT (source_id) DO UPDATE
SET mapping = EXCLUDED.mapping, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(source_id)
        .bind(Json(mapping))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_job(&self, job: &ImportJob) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO import_jobs
    (id, source_id, operation, status, message, processed, imported, failed, details, error,
     started_at, completed_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id)
        .bind(job.source_id)
        .bind(job.operation.as_str())
        .bind(job.status.as_str())
        .bind(&job.message)
        .bind(job.processed)
        .bind(job.imported)
        .bind(job.failed)
        .bind(&job.details)
        .bind(&job.error)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish_job(&self, job_id: Uuid, completion: JobCompletion) -> StoreResult<ImportJob> {
        let query = format!(
            r#"
UPDATE import_jobs
SET
    status = $2,
    message = COALESCE($3, message),
    imported = $4,
    failed = $5,
    details = $6,
    error = $7,
    completed_at = $8
WHERE id = $1 AND status = 'pending'
RETURNING {JOB_COLUMNS}
            "#
        );

        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(job_id)
            .bind(completion.status.as_str())
            .bind(&completion.message)
            .bind(completion.imported)
            .bind(completion.failed)
            .bind(&completion.details)
            .bind(&completion.error)
            .bind(completion.completed_at)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None => match self.get_job(job_id).await? {
                Some(job) => Err(StoreError::Conflict(format!(
                    "import job {} is already {}",
                    job_id, job.status
                ))),
                None => Err(StoreError::Missing {
                    entity: "import job",
                    id: job_id,
                }),
            },
        }
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<ImportJob>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ImportJob::try_from).transpose()
    }

    async fn list_jobs(&self, source_id: Uuid, offset: i64, limit: i64) -> StoreResult<JobSlice> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM import_jobs WHERE source_id = $1")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;

        let query = format!(
            r#"
SELECT {JOB_COLUMNS}
FROM import_jobs
WHERE source_id = $1
ORDER BY started_at DESC, id DESC
OFFSET $2
LIMIT $3
            "#
        );
        let rows: Vec<JobRow> = sqlx::query_as(&query)
            .bind(source_id)
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let jobs = rows
            .into_iter()
            .map(ImportJob::try_from)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(JobSlice { jobs, total })
    }

    async fn find_retry_of(&self, job_id: Uuid) -> StoreResult<Option<ImportJob>> {
        let query = format!(
            r#"
SELECT {JOB_COLUMNS}
FROM import_jobs
WHERE operation = 'retry' AND details->>'retry_of' = $1
ORDER BY started_at
LIMIT 1
            "#
        );
        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(ImportJob::try_from).transpose()
    }

    async fn insert_prospect(
        &self,
        prospect: NewProspect,
    ) -> StoreResult<(Prospect, ProspectEvent)> {
        let prospect = Prospect::from_new(prospect);
        let event = ProspectEvent::imported(prospect.id);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
INSERT INTO prospects
    (id, source_id, first_name, last_name, email, phone, metadata, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(prospect.id)
        .bind(prospect.source_id)
        .bind(&prospect.first_name)
        .bind(&prospect.last_name)
        .bind(&prospect.email)
        .bind(&prospect.phone)
        .bind(Json::<&RawRecord>(&prospect.metadata))
        .bind(prospect.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
INSERT INTO prospect_events (id, prospect_id, event_type, occurred_at)
VALUES ($1, $2, 'imported', $3)
            "#,
        )
        .bind(event.id)
        .bind(event.prospect_id)
        .bind(event.occurred_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((prospect, event))
    }

    async fn insert_webhook(
        &self,
        source_id: Uuid,
        params: WebhookParams,
    ) -> StoreResult<Webhook> {
        let query = format!(
            r#"
INSERT INTO webhooks (id, source_id, event_type, url, active, created_at, updated_at)
VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
RETURNING {WEBHOOK_COLUMNS}
            "#
        );
        let row: WebhookRow = sqlx::query_as(&query)
            .bind(Uuid::now_v7())
            .bind(source_id)
            .bind(params.event_type.as_str())
            .bind(&params.url)
            .bind(params.active)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn update_webhook(
        &self,
        webhook_id: Uuid,
        params: WebhookParams,
    ) -> StoreResult<Webhook> {
        let query = format!(
            r#"
UPDATE webhooks
SET event_type = $2, url = $3, active = $4, updated_at = NOW()
WHERE id = $1
RETURNING {WEBHOOK_COLUMNS}
            "#
        );
        let row: Option<WebhookRow> = sqlx::query_as(&query)
            .bind(webhook_id)
            .bind(params.event_type.as_str())
            .bind(&params.url)
            .bind(params.active)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(StoreError::Missing {
            entity: "webhook",
            id: webhook_id,
        })?
        .try_into()
    }

    async fn delete_webhook(&self, webhook_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = $1")
            .bind(webhook_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Missing {
                entity: "webhook",
                id: webhook_id,
            });
        }
        Ok(())
    }

    async fn get_webhook(&self, webhook_id: Uuid) -> StoreResult<Option<Webhook>> {
        let query = format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1");
        let row: Option<WebhookRow> = sqlx::query_as(&query)
            .bind(webhook_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Webhook::try_from).transpose()
    }

    async fn list_webhooks(&self, source_id: Uuid) -> StoreResult<Vec<Webhook>> {
        let query = format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE source_id = $1 ORDER BY created_at"
        );
        let rows: Vec<WebhookRow> = sqlx::query_as(&query)
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Webhook::try_from).collect()
    }

    async fn active_webhooks(
        &self,
        source_id: Uuid,
        event_type: EventType,
    ) -> StoreResult<Vec<Webhook>> {
        let query = format!(
            r#"
SELECT {WEBHOOK_COLUMNS}
FROM webhooks
WHERE source_id = $1 AND event_type = $2 AND active
ORDER BY created_at
            "#
        );
        let rows: Vec<WebhookRow> = sqlx::query_as(&query)
            .bind(source_id)
            .bind(event_type.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Webhook::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CanonicalField, JobOperation, JobStatus};

    #[test]
    fn test_sqlx_errors_are_classified() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::ColumnNotFound("status".to_owned())),
            StoreError::Decode(_)
        ));
    }

    #[test]
    fn test_data_and_constraint_errors_are_row_level() {
        for code in ["23505", "23503", "23514", "23502", "22001", "22P02"] {
            assert!(is_row_level_sqlstate(code), "{} should reject the row", code);
        }
    }

    #[test]
    fn test_server_side_failures_are_not_row_level() {
        // admin_shutdown, cannot_connect_now, too_many_connections,
        // serialization_failure, read_only_sql_transaction, undefined_table
        for code in ["57P01", "57P03", "53300", "40001", "25006", "42P01"] {
            assert!(!is_row_level_sqlstate(code), "{} should not reject the row", code);
        }
    }

    #[test]
    fn test_unknown_job_status_does_not_decode() {
        let row = JobRow {
            id: Uuid::now_v7(),
            source_id: Uuid::now_v7(),
            operation: "import".to_owned(),
            status: "running".to_owned(),
            message: "".to_owned(),
            processed: 0,
            imported: 0,
            failed: 0,
            details: Value::Null,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };

        let decoded = ImportJob::try_from(row);
        assert_eq!(
            decoded,
            Err(StoreError::Decode("running is not a valid JobStatus".to_owned()))
        );
    }

    #[test]
    fn test_unknown_source_kind_is_kept() {
        let row = SourceRow {
            id: Uuid::now_v7(),
            name: "legacy".to_owned(),
            kind: "pipedrive".to_owned(),
            config: Json(SourceConfig::default()),
            credentials: None,
            active: true,
            last_synced_at: None,
            created_at: Utc::now(),
        };

        let source = LeadSource::from(row);
        assert_eq!(source.kind, SourceKind::Unsupported("pipedrive".to_owned()));
    }

    async fn store_with_source(db: PgPool) -> (PgStore, Uuid) {
        let store = PgStore::new_from_pool(db);
        let source = store
            .insert_source(NewLeadSource::new("warehouse", SourceKind::File))
            .await
            .expect("failed to insert lead source");
        (store, source.id)
    }

    fn new_prospect(source_id: Uuid, email: &str) -> NewProspect {
        NewProspect {
            source_id,
            first_name: Some("Ada".to_owned()),
            last_name: None,
            email: Some(email.to_owned()),
            phone: None,
            metadata: RawRecord::from([("email".to_owned(), email.to_owned())]),
        }
    }

    async fn count(store: &PgStore, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&store.pool)
            .await
            .expect("failed to count rows")
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_finish_job_applies_once(db: PgPool) {
        let (store, source_id) = store_with_source(db).await;
        let job = ImportJob::pending(source_id, JobOperation::Import, "Importing 1 record", 1);
        store.insert_job(&job).await.unwrap();

        let completion = JobCompletion::new(JobStatus::Success, 1, 0, serde_json::json!({}))
            .with_message("Imported 1 record");
        let finished = store.finish_job(job.id, completion.clone()).await.unwrap();

        assert_eq!(finished.status, JobStatus::Success);
        assert_eq!(finished.message, "Imported 1 record");
        assert_eq!((finished.imported, finished.failed), (1, 0));
        assert!(finished.completed_at.is_some());

        let again = store.finish_job(job.id, completion.clone()).await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));

        let unknown = store.finish_job(Uuid::now_v7(), completion).await;
        assert!(matches!(unknown, Err(StoreError::Missing { .. })));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_counts_cannot_exceed_processed(db: PgPool) {
        let (store, source_id) = store_with_source(db).await;
        let job = ImportJob::pending(source_id, JobOperation::Import, "Importing 1 record", 1);
        store.insert_job(&job).await.unwrap();

        let completion = JobCompletion::new(JobStatus::Success, 2, 0, serde_json::json!({}));
        let result = store.finish_job(job.id, completion).await;

        assert!(matches!(result, Err(StoreError::Rejected(_))));
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_list_jobs_newest_first_with_offset(db: PgPool) {
        let (store, source_id) = store_with_source(db).await;
        let other_source = store
            .insert_source(NewLeadSource::new("other", SourceKind::File))
            .await
            .unwrap()
            .id;
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut job = ImportJob::pending(source_id, JobOperation::Import, format!("{i}"), 1);
            job.started_at = base + chrono::Duration::seconds(i);
            store.insert_job(&job).await.unwrap();
            ids.push(job.id);
        }
        store
            .insert_job(&ImportJob::pending(other_source, JobOperation::Import, "other", 1))
            .await
            .unwrap();

        let all = store.list_jobs(source_id, 0, 10).await.unwrap();
        let listed: Vec<Uuid> = all.jobs.iter().map(|j| j.id).collect();
        assert_eq!(all.total, 3);
        assert_eq!(listed, vec![ids[2], ids[1], ids[0]]);

        let page = store.list_jobs(source_id, 1, 1).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.jobs.len(), 1);
        assert_eq!(page.jobs[0].id, ids[1]);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_insert_prospect_writes_event(db: PgPool) {
        let (store, source_id) = store_with_source(db).await;

        let (prospect, event) = store
            .insert_prospect(new_prospect(source_id, "ada@example.com"))
            .await
            .unwrap();

        assert_eq!(event.prospect_id, prospect.id);
        assert_eq!(count(&store, "prospects").await, 1);
        assert_eq!(count(&store, "prospect_events").await, 1);

        let metadata: Value = sqlx::query_scalar("SELECT metadata FROM prospects WHERE id = $1")
            .bind(prospect.id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(metadata, serde_json::json!({"email": "ada@example.com"}));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_insert_prospect_rolls_back_without_event(db: PgPool) {
        let (store, source_id) = store_with_source(db).await;
        sqlx::query(
            r#"
CREATE FUNCTION refuse_prospect_events() RETURNS trigger AS $$
BEGIN
    RAISE EXCEPTION 'prospect events are read only' USING ERRCODE = 'check_violation';
END
$$ LANGUAGE plpgsql
            "#,
        )
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
CREATE TRIGGER refuse_prospect_events BEFORE INSERT ON prospect_events
FOR EACH ROW EXECUTE FUNCTION refuse_prospect_events()
            "#,
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let result = store
            .insert_prospect(new_prospect(source_id, "ada@example.com"))
            .await;

        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert_eq!(count(&store, "prospects").await, 0);
        assert_eq!(count(&store, "prospect_events").await, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_prospect_for_unknown_source_is_rejected(db: PgPool) {
        let store = PgStore::new_from_pool(db);

        let result = store
            .insert_prospect(new_prospect(Uuid::now_v7(), "ada@example.com"))
            .await;

        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert!(result.unwrap_err().is_row_level());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_put_mapping_replaces_whole_mapping(db: PgPool) {
        let (store, source_id) = store_with_source(db).await;
        assert_eq!(store.get_mapping(source_id).await.unwrap(), None);

        store
            .put_mapping(source_id, &FieldMapping::default_mapping())
            .await
            .unwrap();
        let replacement = FieldMapping::new(std::collections::BTreeMap::from([(
            CanonicalField::Email,
            "Work Email".to_owned(),
        )]));
        store.put_mapping(source_id, &replacement).await.unwrap();

        assert_eq!(store.get_mapping(source_id).await.unwrap(), Some(replacement));
        assert_eq!(count(&store, "field_mappings").await, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_find_retry_of(db: PgPool) {
        let (store, source_id) = store_with_source(db).await;
        let original = ImportJob::pending(source_id, JobOperation::Import, "Importing", 2);
        store.insert_job(&original).await.unwrap();
        assert_eq!(store.find_retry_of(original.id).await.unwrap(), None);

        let retry = ImportJob::pending(source_id, JobOperation::Retry, "Retrying", 1)
            .with_details(serde_json::json!({ "retry_of": original.id }));
        store.insert_job(&retry).await.unwrap();

        let found = store.find_retry_of(original.id).await.unwrap().unwrap();
        assert_eq!(found.id, retry.id);

        let duplicate = ImportJob::pending(source_id, JobOperation::Retry, "Retrying", 1)
            .with_details(serde_json::json!({ "retry_of": original.id }));
        let result = store.insert_job(&duplicate).await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_webhook_lifecycle(db: PgPool) {
        let (store, source_id) = store_with_source(db).await;
        let webhook = store
            .insert_webhook(
                source_id,
                WebhookParams::new(EventType::Imported, "https://hooks.example.com/a"),
            )
            .await
            .unwrap();
        store
            .insert_webhook(
                source_id,
                WebhookParams::new(EventType::Imported, "https://hooks.example.com/b").inactive(),
            )
            .await
            .unwrap();

        let active = store
            .active_webhooks(source_id, EventType::Imported)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, webhook.id);
        assert_eq!(store.list_webhooks(source_id).await.unwrap().len(), 2);

        store.delete_webhook(webhook.id).await.unwrap();
        let gone = store.delete_webhook(webhook.id).await;
        assert!(matches!(gone, Err(StoreError::Missing { .. })));
    }
}
