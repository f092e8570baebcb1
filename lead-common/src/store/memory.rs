use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{JobSlice, LeadStore, StoreError, StoreResult};
use crate::mapping::FieldMapping;
use crate::model::{
    EventType, ImportJob, JobCompletion, JobOperation, LeadSource, NewLeadSource, NewProspect,
    Prospect, ProspectEvent, Webhook, WebhookParams,
};

type RejectFn = Box<dyn Fn(&NewProspect) -> Option<String> + Send + Sync>;

#[derive(Default)]
struct Tables {
    sources: HashMap<Uuid, LeadSource>,
    mappings: HashMap<Uuid, FieldMapping>,
    jobs: Vec<ImportJob>,
    prospects: Vec<Prospect>,
    events: Vec<ProspectEvent>,
    webhooks: Vec<Webhook>,
}

/// Injected failures, used to exercise the pipeline's error paths without a real database.
#[derive(Default)]
struct Faults {
    reject_prospect: Option<RejectFn>,
    prospect_outage_after: Option<usize>,
    jobs_unavailable: bool,
}

/// A `LeadStore` kept entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any prospect for which `reject` returns an error message.
    pub fn reject_prospects_where<F>(&self, reject: F)
    where
        F: Fn(&NewProspect) -> Option<String> + Send + Sync + 'static,
    {
        self.faults().reject_prospect = Some(Box::new(reject));
    }

    /// After `count` more successful prospect writes, report the store as unavailable
    /// for prospect writes.
    pub fn fail_prospect_writes_after(&self, count: usize) {
        self.faults().prospect_outage_after = Some(count);
    }

    /// Make every job insert fail as if the store could not be reached.
    pub fn fail_job_inserts(&self) {
        self.faults().jobs_unavailable = true;
    }

    pub async fn prospects(&self, source_id: Uuid) -> Vec<Prospect> {
        let tables = self.tables.read().await;
        tables
            .prospects
            .iter()
            .filter(|p| p.source_id == source_id)
            .cloned()
            .collect()
    }

    pub async fn prospect_events(&self) -> Vec<ProspectEvent> {
        self.tables.read().await.events.clone()
    }

    pub async fn jobs(&self, source_id: Uuid) -> Vec<ImportJob> {
        let tables = self.tables.read().await;
        tables
            .jobs
            .iter()
            .filter(|j| j.source_id == source_id)
            .cloned()
            .collect()
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        // A poisoned lock only means a test panicked while holding it.
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_prospect_faults(&self, prospect: &NewProspect) -> StoreResult<()> {
        let mut faults = self.faults();

        if let Some(remaining) = faults.prospect_outage_after.as_mut() {
            if *remaining == 0 {
                return Err(StoreError::Unavailable("connection reset".to_owned()));
            }
            *remaining -= 1;
        }

        if let Some(reject) = faults.reject_prospect.as_ref() {
            if let Some(reason) = reject(prospect) {
                return Err(StoreError::Rejected(reason));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn insert_source(&self, source: NewLeadSource) -> StoreResult<LeadSource> {
        let source = source.into_source();
        self.tables
            .write()
            .await
            .sources
            .insert(source.id, source.clone());
        Ok(source)
    }

    async fn get_source(&self, source_id: Uuid) -> StoreResult<Option<LeadSource>> {
        Ok(self.tables.read().await.sources.get(&source_id).cloned())
    }

    async fn touch_last_synced(&self, source_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let source = tables
            .sources
            .get_mut(&source_id)
            .ok_or(StoreError::Missing {
                entity: "lead source",
                id: source_id,
            })?;
        source.last_synced_at = Some(at);
        Ok(())
    }

    async fn get_mapping(&self, source_id: Uuid) -> StoreResult<Option<FieldMapping>> {
        Ok(self.tables.read().await.mappings.get(&source_id).cloned())
    }

    async fn put_mapping(&self, source_id: Uuid, mapping: &FieldMapping) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .mappings
            .insert(source_id, mapping.clone());
        Ok(())
    }

    async fn insert_job(&self, job: &ImportJob) -> StoreResult<()> {
        if self.faults().jobs_unavailable {
            return Err(StoreError::Unavailable("connection refused".to_owned()));
        }
        self.tables.write().await.jobs.push(job.clone());
        Ok(())
    }

    async fn finish_job(&self, job_id: Uuid, completion: JobCompletion) -> StoreResult<ImportJob> {
        let mut tables = self.tables.write().await;
        let job = tables
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(StoreError::Missing {
                entity: "import job",
                id: job_id,
            })?;

        if job.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "import job {} is already {}",
                job_id, job.status
            )));
        }

        job.complete(completion);
        Ok(job.clone())
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<ImportJob>> {
        let tables = self.tables.read().await;
        Ok(tables.jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn list_jobs(&self, source_id: Uuid, offset: i64, limit: i64) -> StoreResult<JobSlice> {
        let tables = self.tables.read().await;
        // Newest insert first, so entries started in the same instant keep a stable order.
        let mut jobs: Vec<ImportJob> = tables
            .jobs
            .iter()
            .rev()
            .filter(|j| j.source_id == source_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let total = jobs.len() as i64;
        let jobs = jobs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();

        Ok(JobSlice { jobs, total })
    }

    async fn find_retry_of(&self, job_id: Uuid) -> StoreResult<Option<ImportJob>> {
        let tables = self.tables.read().await;
        let retry_of = serde_json::json!(job_id);
        Ok(tables
            .jobs
            .iter()
            .find(|j| {
                j.operation == JobOperation::Retry && j.details.get("retry_of") == Some(&retry_of)
            })
            .cloned())
    }

    async fn insert_prospect(
        &self,
        prospect: NewProspect,
    ) -> StoreResult<(Prospect, ProspectEvent)> {
        self.check_prospect_faults(&prospect)?;

        let prospect = Prospect::from_new(prospect);
        let event = ProspectEvent::imported(prospect.id);

        let mut tables = self.tables.write().await;
        tables.prospects.push(prospect.clone());
        tables.events.push(event.clone());

        Ok((prospect, event))
    }

    async fn insert_webhook(
        &self,
        source_id: Uuid,
        params: WebhookParams,
    ) -> StoreResult<Webhook> {
        let now = Utc::now();
        let webhook = Webhook {
            id: Uuid::now_v7(),
            source_id,
            event_type: params.event_type,
            url: params.url,
            active: params.active,
            created_at: now,
            updated_at: now,
        };
        self.tables.write().await.webhooks.push(webhook.clone());
        Ok(webhook)
    }

    async fn update_webhook(
        &self,
        webhook_id: Uuid,
        params: WebhookParams,
    ) -> StoreResult<Webhook> {
        let mut tables = self.tables.write().await;
        let webhook = tables
            .webhooks
            .iter_mut()
            .find(|w| w.id == webhook_id)
            .ok_or(StoreError::Missing {
                entity: "webhook",
                id: webhook_id,
            })?;

        webhook.event_type = params.event_type;
        webhook.url = params.url;
        webhook.active = params.active;
        webhook.updated_at = Utc::now();

        Ok(webhook.clone())
    }

    async fn delete_webhook(&self, webhook_id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let before = tables.webhooks.len();
        tables.webhooks.retain(|w| w.id != webhook_id);

        if tables.webhooks.len() == before {
            return Err(StoreError::Missing {
                entity: "webhook",
                id: webhook_id,
            });
        }
        Ok(())
    }

    async fn get_webhook(&self, webhook_id: Uuid) -> StoreResult<Option<Webhook>> {
        let tables = self.tables.read().await;
        Ok(tables.webhooks.iter().find(|w| w.id == webhook_id).cloned())
    }

    async fn list_webhooks(&self, source_id: Uuid) -> StoreResult<Vec<Webhook>> {
        let tables = self.tables.read().await;
        Ok(tables
            .webhooks
            .iter()
            .filter(|w| w.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn active_webhooks(
        &self,
        source_id: Uuid,
        event_type: EventType,
    ) -> StoreResult<Vec<Webhook>> {
        let tables = self.tables.read().await;
        Ok(tables
            .webhooks
            .iter()
            .filter(|w| w.source_id == source_id && w.event_type == event_type && w.active)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobOperation, JobStatus, RawRecord, SourceKind};

    fn new_prospect(source_id: Uuid, email: &str) -> NewProspect {
        NewProspect {
            source_id,
            first_name: None,
            last_name: None,
            email: Some(email.to_owned()),
            phone: None,
            metadata: RawRecord::new(),
        }
    }

    #[tokio::test]
    async fn test_finish_job_only_once() {
        let store = MemoryStore::new();
        let job = ImportJob::pending(Uuid::now_v7(), JobOperation::Import, "1 record", 1);
        store.insert_job(&job).await.unwrap();

        let completion = JobCompletion::new(JobStatus::Success, 1, 0, serde_json::json!({}));
        let finished = store.finish_job(job.id, completion.clone()).await.unwrap();
        assert_eq!(finished.status, JobStatus::Success);
        assert!(finished.completed_at.is_some());

        let second = store.finish_job(job.id, completion).await;
        assert!(matches!(second, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_list_jobs_newest_first_with_offset() {
        let store = MemoryStore::new();
        let source_id = Uuid::now_v7();
        let mut ids = Vec::new();
        for i in 0..3 {
            let job = ImportJob::pending(source_id, JobOperation::Import, format!("{i}"), 1);
            ids.push(job.id);
            store.insert_job(&job).await.unwrap();
        }
        store
            .insert_job(&ImportJob::pending(
                Uuid::now_v7(),
                JobOperation::Import,
                "other",
                1,
            ))
            .await
            .unwrap();

        let slice = store.list_jobs(source_id, 1, 5).await.unwrap();

        assert_eq!(slice.total, 3);
        let listed: Vec<Uuid> = slice.jobs.iter().map(|j| j.id).collect();
        assert_eq!(listed, vec![ids[1], ids[0]]);
    }

    #[tokio::test]
    async fn test_prospect_and_event_written_together() {
        let store = MemoryStore::new();
        let source_id = Uuid::now_v7();

        let (prospect, event) = store
            .insert_prospect(new_prospect(source_id, "a@example.com"))
            .await
            .unwrap();

        assert_eq!(event.prospect_id, prospect.id);
        assert_eq!(store.prospects(source_id).await, vec![prospect]);
        assert_eq!(store.prospect_events().await, vec![event]);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::new();
        let source_id = Uuid::now_v7();
        store.reject_prospects_where(|p| {
            (p.email.as_deref() == Some("bad@example.com")).then(|| "duplicate email".to_owned())
        });
        store.fail_prospect_writes_after(1);

        let rejected = store
            .insert_prospect(new_prospect(source_id, "bad@example.com"))
            .await;
        assert_eq!(
            rejected,
            Err(StoreError::Rejected("duplicate email".to_owned()))
        );

        // The rejected write still consumed the single allowed write before the outage.
        let unavailable = store
            .insert_prospect(new_prospect(source_id, "ok@example.com"))
            .await
            .unwrap_err();
        assert!(!unavailable.is_row_level());
        assert!(store.prospect_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_webhook_crud() {
        let store = MemoryStore::new();
        let source = store
            .insert_source(NewLeadSource::new("api", SourceKind::Api))
            .await
            .unwrap();

        let hook = store
            .insert_webhook(
                source.id,
                WebhookParams::new(EventType::Imported, "http://localhost/a"),
            )
            .await
            .unwrap();
        store
            .insert_webhook(
                source.id,
                WebhookParams::new(EventType::Imported, "http://localhost/b").inactive(),
            )
            .await
            .unwrap();

        let active = store
            .active_webhooks(source.id, EventType::Imported)
            .await
            .unwrap();
        assert_eq!(active, vec![hook.clone()]);

        let updated = store
            .update_webhook(
                hook.id,
                WebhookParams::new(EventType::ImportFailed, "http://localhost/c"),
            )
            .await
            .unwrap();
        assert_eq!(updated.event_type, EventType::ImportFailed);
        assert_eq!(updated.url, "http://localhost/c");

        store.delete_webhook(hook.id).await.unwrap();
        assert_eq!(store.list_webhooks(source.id).await.unwrap().len(), 1);
        assert!(matches!(
            store.delete_webhook(hook.id).await,
            Err(StoreError::Missing { .. })
        ));
    }
}
