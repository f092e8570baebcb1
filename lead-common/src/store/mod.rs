//! Data-access interface for everything the pipeline reads and writes.
//!
//! The pipeline never talks to a database directly: the import executor, the webhook
//! dispatcher and friends all hold an `Arc<dyn LeadStore>`. [`MemoryStore`] backs tests and
//! single-process deployments, [`PgStore`] backs production.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::mapping::FieldMapping;
use crate::model::{
    EventType, ImportJob, JobCompletion, LeadSource, NewLeadSource, NewProspect, Prospect,
    ProspectEvent, Webhook, WebhookParams,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Enumeration of errors surfaced by a `LeadStore`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store refused this particular write (constraint violation, bad value, ...).
    /// Other writes may still succeed.
    #[error("record rejected by store: {0}")]
    Rejected(String),
    /// The store cannot be reached or is failing every request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{entity} {id} does not exist")]
    Missing { entity: &'static str, id: Uuid },
    #[error("{0}")]
    Conflict(String),
    #[error("stored value could not be decoded: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether the failure is scoped to the single record being written.
    pub fn is_row_level(&self) -> bool {
        matches!(self, StoreError::Rejected(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A page of audit log entries plus the total number of entries for the source.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSlice {
    pub jobs: Vec<ImportJob>,
    pub total: i64,
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn insert_source(&self, source: NewLeadSource) -> StoreResult<LeadSource>;
    async fn get_source(&self, source_id: Uuid) -> StoreResult<Option<LeadSource>>;
    async fn touch_last_synced(&self, source_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    async fn get_mapping(&self, source_id: Uuid) -> StoreResult<Option<FieldMapping>>;
    /// Replace the whole mapping for a source.
    async fn put_mapping(&self, source_id: Uuid, mapping: &FieldMapping) -> StoreResult<()>;

    async fn insert_job(&self, job: &ImportJob) -> StoreResult<()>;
    /// Apply the terminal update to a pending job. Fails with `Conflict` if the job was
    /// already completed.
    async fn finish_job(&self, job_id: Uuid, completion: JobCompletion) -> StoreResult<ImportJob>;
    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<ImportJob>>;
    /// Jobs for a source, most recently started first.
    async fn list_jobs(&self, source_id: Uuid, offset: i64, limit: i64) -> StoreResult<JobSlice>;
    /// The `retry` job started from `job_id`, if there is one.
    async fn find_retry_of(&self, job_id: Uuid) -> StoreResult<Option<ImportJob>>;

    /// Persist a prospect together with its `imported` event. Either both exist afterwards
    /// or neither does.
    async fn insert_prospect(
        &self,
        prospect: NewProspect,
    ) -> StoreResult<(Prospect, ProspectEvent)>;

    async fn insert_webhook(&self, source_id: Uuid, params: WebhookParams)
        -> StoreResult<Webhook>;
    async fn update_webhook(&self, webhook_id: Uuid, params: WebhookParams)
        -> StoreResult<Webhook>;
    async fn delete_webhook(&self, webhook_id: Uuid) -> StoreResult<()>;
    async fn get_webhook(&self, webhook_id: Uuid) -> StoreResult<Option<Webhook>>;
    async fn list_webhooks(&self, source_id: Uuid) -> StoreResult<Vec<Webhook>>;
    async fn active_webhooks(
        &self,
        source_id: Uuid,
        event_type: EventType,
    ) -> StoreResult<Vec<Webhook>>;
}
