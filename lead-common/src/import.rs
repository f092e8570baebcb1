//! The import executor: map, persist and classify one batch of raw records.
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::error::{PipelineError, PipelineResult, RowError};
use crate::mapping::{FieldMapper, FieldMapping};
use crate::model::{
    EventType, ImportJob, JobCompletion, JobOperation, JobStatus, LeadSource, Prospect, RawRecord,
};
use crate::store::{LeadStore, StoreError};
use crate::webhook::WebhookDispatcher;

/// How to classify a batch that ran to completion with every record failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllFailedPolicy {
    Partial,
    Error,
}

pub const DEFAULT_ALL_FAILED_POLICY: AllFailedPolicy = AllFailedPolicy::Partial;

impl AllFailedPolicy {
    fn status(&self) -> JobStatus {
        match self {
            AllFailedPolicy::Partial => JobStatus::Partial,
            AllFailedPolicy::Error => JobStatus::Error,
        }
    }
}

impl FromStr for AllFailedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "partial" => Ok(AllFailedPolicy::Partial),
            "error" => Ok(AllFailedPolicy::Error),
            invalid => Err(format!("{} is not a valid AllFailedPolicy", invalid)),
        }
    }
}

/// What to do with a record none of whose mapped fields are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyRowPolicy {
    /// Persist a prospect with every canonical field null.
    Accept,
    /// Record the row as a failure.
    Reject,
}

pub const DEFAULT_EMPTY_ROW_POLICY: EmptyRowPolicy = EmptyRowPolicy::Accept;

/// Result of a run that reached a terminal classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub success: bool,
    pub status: JobStatus,
    pub imported: i64,
    pub failed: i64,
    pub log_id: Uuid,
}

/// Outcome of the row loop. `aborted` is set when the store stopped accepting writes;
/// rows after that point are recorded as failures without being attempted.
struct Batch {
    imported: Vec<Prospect>,
    failures: Vec<RowError>,
    aborted: Option<StoreError>,
}

#[derive(Clone)]
pub struct ImportExecutor {
    store: Arc<dyn LeadStore>,
    mapper: FieldMapper,
    audit: AuditLog,
    dispatcher: WebhookDispatcher,
    all_failed_policy: AllFailedPolicy,
    empty_row_policy: EmptyRowPolicy,
}

impl ImportExecutor {
    pub fn new(store: Arc<dyn LeadStore>, dispatcher: WebhookDispatcher) -> Self {
        Self {
            mapper: FieldMapper::new(store.clone()),
            audit: AuditLog::new(store.clone()),
            store,
            dispatcher,
            all_failed_policy: DEFAULT_ALL_FAILED_POLICY,
            empty_row_policy: DEFAULT_EMPTY_ROW_POLICY,
        }
    }

    pub fn with_all_failed_policy(mut self, policy: AllFailedPolicy) -> Self {
        self.all_failed_policy = policy;
        self
    }

    pub fn with_empty_row_policy(mut self, policy: EmptyRowPolicy) -> Self {
        self.empty_row_policy = policy;
        self
    }

    /// Import `rows` for `source_id` as a new `import` job.
    pub async fn run_import(
        &self,
        source_id: Uuid,
        rows: Vec<RawRecord>,
    ) -> PipelineResult<ImportSummary> {
        self.run(source_id, rows, JobOperation::Import, Map::new())
            .await
    }

    /// Run one batch as a new job tagged with `operation`. `origin` is merged into the
    /// job's details, both while pending and once finished.
    pub(crate) async fn run(
        &self,
        source_id: Uuid,
        rows: Vec<RawRecord>,
        operation: JobOperation,
        origin: Map<String, Value>,
    ) -> PipelineResult<ImportSummary> {
        if rows.is_empty() {
            return Err(PipelineError::validation("rows must not be empty"));
        }

        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or(PipelineError::not_found("lead source", source_id))?;
        let mapping = self.mapper.resolve_for_source(&source).await?;

        let processed = rows.len() as i64;
        let job = self
            .audit
            .append(
                ImportJob::pending(
                    source_id,
                    operation,
                    format!("Importing {} records", processed),
                    processed,
                )
                .with_details(Value::Object(origin.clone())),
            )
            .await?;

        info!(
            source_id = %source_id,
            log_id = %job.id,
            operation = operation.as_str(),
            "starting import of {} records",
            processed
        );

        let batch = self.process_rows(&source, &mapping, &rows).await;
        let imported = batch.imported.len() as i64;
        let failed = batch.failures.len() as i64;

        let status = match (&batch.aborted, imported, failed) {
            (Some(_), _, _) => JobStatus::Error,
            (None, _, 0) => JobStatus::Success,
            (None, 0, _) => self.all_failed_policy.status(),
            (None, _, _) => JobStatus::Partial,
        };

        let mut details = origin;
        details.insert("errors".to_owned(), json!(batch.failures));

        let message = match (status, &batch.aborted) {
            (_, Some(reason)) => format!("Import aborted: {}", reason),
            (JobStatus::Success, None) => format!("Imported {} records", imported),
            (JobStatus::Partial, None) => {
                format!("Imported {} of {} records, {} failed", imported, processed, failed)
            }
            (_, None) => format!("All {} records failed", processed),
        };

        let mut completion =
            JobCompletion::new(status, imported, failed, Value::Object(details)).with_message(message);
        if let Some(reason) = &batch.aborted {
            completion = completion.with_error(reason.to_string());
        }

        metrics::counter!("lead_import_jobs_total", &[("status", status.as_str())]).increment(1);
        metrics::counter!("lead_import_rows_total", &[("outcome", "imported")])
            .increment(imported as u64);
        metrics::counter!("lead_import_rows_total", &[("outcome", "failed")])
            .increment(failed as u64);

        if let Err(e) = self.audit.finish(job.id, completion).await {
            error!(log_id = %job.id, "failed to record import outcome: {}", e);
            let reason = match batch.aborted {
                Some(aborted) => aborted.to_string(),
                None => e.to_string(),
            };
            return Err(PipelineError::Aborted {
                log_id: Some(job.id),
                reason,
            });
        }

        if let Some(reason) = batch.aborted {
            error!(source_id = %source_id, log_id = %job.id, "import aborted: {}", reason);
            self.dispatcher
                .notify(
                    source_id,
                    EventType::ImportFailed,
                    json!({
                        "source_id": source_id,
                        "log_id": job.id,
                        "status": status,
                        "processed": processed,
                        "imported": imported,
                        "failed": failed,
                        "error": reason.to_string(),
                    }),
                )
                .await;
            return Err(PipelineError::Aborted {
                log_id: Some(job.id),
                reason: reason.to_string(),
            });
        }

        info!(
            source_id = %source_id,
            log_id = %job.id,
            status = status.as_str(),
            "import finished: {} imported, {} failed",
            imported,
            failed
        );

        let success = matches!(status, JobStatus::Success | JobStatus::Partial);
        if success {
            if let Err(e) = self.store.touch_last_synced(source_id, Utc::now()).await {
                warn!(source_id = %source_id, "failed to update last synced time: {}", e);
            }
        }

        let (event_type, payload) = if success {
            (
                EventType::Imported,
                json!({
                    "source_id": source_id,
                    "log_id": job.id,
                    "status": status,
                    "processed": processed,
                    "imported": imported,
                    "failed": failed,
                    "prospects": batch
                        .imported
                        .iter()
                        .map(|p| json!({
                            "id": p.id,
                            "first_name": p.first_name,
                            "last_name": p.last_name,
                            "email": p.email,
                        }))
                        .collect::<Vec<_>>(),
                }),
            )
        } else {
            (
                EventType::ImportFailed,
                json!({
                    "source_id": source_id,
                    "log_id": job.id,
                    "status": status,
                    "processed": processed,
                    "imported": imported,
                    "failed": failed,
                }),
            )
        };
        self.dispatcher.notify(source_id, event_type, payload).await;

        Ok(ImportSummary {
            success,
            status,
            imported,
            failed,
            log_id: job.id,
        })
    }

    /// Map and persist each row in order. A rejected row never stops the loop; an
    /// unavailable store does.
    async fn process_rows(
        &self,
        source: &LeadSource,
        mapping: &FieldMapping,
        rows: &[RawRecord],
    ) -> Batch {
        let mut batch = Batch {
            imported: Vec::new(),
            failures: Vec::new(),
            aborted: None,
        };

        for (index, row) in rows.iter().enumerate() {
            if let Some(reason) = &batch.aborted {
                batch.failures.push(RowError {
                    record: row.clone(),
                    error: format!("not attempted: {}", reason),
                });
                continue;
            }

            let candidate = mapping.project(source.id, row);
            if candidate.is_blank() && self.empty_row_policy == EmptyRowPolicy::Reject {
                warn!(source_id = %source.id, row = index, "record has no mapped fields");
                batch.failures.push(RowError {
                    record: row.clone(),
                    error: "record has no mapped fields".to_owned(),
                });
                continue;
            }

            match self.store.insert_prospect(candidate).await {
                Ok((prospect, _)) => batch.imported.push(prospect),
                Err(e) if e.is_row_level() => {
                    warn!(source_id = %source.id, row = index, "record failed: {}", e);
                    batch.failures.push(RowError {
                        record: row.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(source_id = %source.id, row = index, "store failed mid-import: {}", e);
                    batch.failures.push(RowError {
                        record: row.clone(),
                        error: e.to_string(),
                    });
                    batch.aborted = Some(e);
                }
            }
        }

        batch
    }
}
