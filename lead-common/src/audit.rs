//! Append-only record of job executions and webhook delivery attempts.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ImportJob, JobCompletion};
use crate::store::{LeadStore, StoreResult};

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub pages: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPage {
    pub data: Vec<ImportJob>,
    pub pagination: Pagination,
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn LeadStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn LeadStore>) -> Self {
        Self { store }
    }

    /// Append a new entry. Pending entries must later be closed with `finish`.
    pub async fn append(&self, job: ImportJob) -> StoreResult<ImportJob> {
        self.store.insert_job(&job).await?;
        Ok(job)
    }

    /// Apply the single terminal update to a pending entry.
    pub async fn finish(&self, job_id: Uuid, completion: JobCompletion) -> StoreResult<ImportJob> {
        let job = self.store.finish_job(job_id, completion).await?;
        metrics::counter!(
            "lead_audit_entries_finished_total",
            &[
                ("operation", job.operation.as_str()),
                ("status", job.status.as_str())
            ]
        )
        .increment(1);
        Ok(job)
    }

    pub async fn get(&self, job_id: Uuid) -> StoreResult<Option<ImportJob>> {
        self.store.get_job(job_id).await
    }

    /// A page of a source's entries, most recently started first. `page` is 1-based;
    /// out-of-range values are clamped.
    pub async fn page(&self, source_id: Uuid, page: i64, limit: i64) -> StoreResult<LogPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let offset = (page - 1).saturating_mul(limit);

        let slice = self.store.list_jobs(source_id, offset, limit).await?;
        let pages = (slice.total + limit - 1) / limit;

        Ok(LogPage {
            data: slice.jobs,
            pagination: Pagination {
                total: slice.total,
                page,
                limit,
                pages,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobOperation, JobStatus};
    use crate::store::MemoryStore;

    async fn seeded(source_id: Uuid, count: usize) -> AuditLog {
        let log = AuditLog::new(Arc::new(MemoryStore::new()));
        for i in 0..count {
            log.append(ImportJob::pending(
                source_id,
                JobOperation::Import,
                format!("run {i}"),
                1,
            ))
            .await
            .unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_page_metadata() {
        let source_id = Uuid::now_v7();
        let log = seeded(source_id, 5).await;

        let page = log.page(source_id, 2, 2).await.unwrap();

        assert_eq!(
            page.pagination,
            Pagination {
                total: 5,
                page: 2,
                limit: 2,
                pages: 3,
            }
        );
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[0].message, "run 2");
    }

    #[tokio::test]
    async fn test_page_clamps_out_of_range_values() {
        let source_id = Uuid::now_v7();
        let log = seeded(source_id, 1).await;

        let page = log.page(source_id, 0, 1_000).await.unwrap();

        assert_eq!(page.pagination.page, 1);
        assert_eq!(page.pagination.limit, MAX_PAGE_LIMIT);
        assert_eq!(page.pagination.pages, 1);
    }

    #[tokio::test]
    async fn test_empty_source_has_zero_pages() {
        let log = seeded(Uuid::now_v7(), 3).await;

        let page = log.page(Uuid::now_v7(), 1, 10).await.unwrap();

        assert!(page.data.is_empty());
        assert_eq!(page.pagination.total, 0);
        assert_eq!(page.pagination.pages, 0);
    }

    #[tokio::test]
    async fn test_finish_closes_entry() {
        let source_id = Uuid::now_v7();
        let log = AuditLog::new(Arc::new(MemoryStore::new()));
        let job = log
            .append(ImportJob::pending(
                source_id,
                JobOperation::ConnectionTest,
                "Testing connection",
                0,
            ))
            .await
            .unwrap();

        let finished = log
            .finish(
                job.id,
                JobCompletion::new(JobStatus::Success, 0, 0, serde_json::json!({}))
                    .with_message("ok"),
            )
            .await
            .unwrap();

        assert_eq!(finished.message, "ok");
        assert_eq!(log.get(job.id).await.unwrap(), Some(finished));
    }
}
