//! `LeadPipeline` bundles every component behind the operations external callers use.
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditLog, LogPage};
use crate::connection::{ConnectionReport, ConnectionTester, DEFAULT_PROBE_TIMEOUT};
use crate::error::{PipelineError, PipelineResult};
use crate::import::{
    AllFailedPolicy, EmptyRowPolicy, ImportExecutor, ImportSummary, DEFAULT_ALL_FAILED_POLICY,
    DEFAULT_EMPTY_ROW_POLICY,
};
use crate::mapping::{FieldMapper, FieldMapping};
use crate::model::{EventType, LeadSource, NewLeadSource, RawRecord, Webhook, WebhookParams};
use crate::parse::{parse_rows, ParseOptions};
use crate::retry::{RetryCoordinator, RetryOutcome};
use crate::store::{LeadStore, StoreError};
use crate::webhook::{validate_target, DeliveryOutcome, WebhookDispatcher, DEFAULT_WEBHOOK_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub webhook_timeout: Duration,
    pub probe_timeout: Duration,
    pub all_failed_policy: AllFailedPolicy,
    pub empty_row_policy: EmptyRowPolicy,
    /// Let webhooks and connection tests reach loopback, private or link-local hosts.
    pub allow_internal_ips: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            webhook_timeout: DEFAULT_WEBHOOK_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            all_failed_policy: DEFAULT_ALL_FAILED_POLICY,
            empty_row_policy: DEFAULT_EMPTY_ROW_POLICY,
            allow_internal_ips: false,
        }
    }
}

#[derive(Clone)]
pub struct LeadPipeline {
    store: Arc<dyn LeadStore>,
    mapper: FieldMapper,
    audit: AuditLog,
    executor: ImportExecutor,
    retries: RetryCoordinator,
    tester: ConnectionTester,
    dispatcher: WebhookDispatcher,
}

impl LeadPipeline {
    pub fn new(store: Arc<dyn LeadStore>, settings: PipelineSettings) -> Result<Self, reqwest::Error> {
        let dispatcher = WebhookDispatcher::new(
            store.clone(),
            settings.webhook_timeout,
            settings.allow_internal_ips,
        )?;
        let executor = ImportExecutor::new(store.clone(), dispatcher.clone())
            .with_all_failed_policy(settings.all_failed_policy)
            .with_empty_row_policy(settings.empty_row_policy);

        Ok(Self {
            mapper: FieldMapper::new(store.clone()),
            audit: AuditLog::new(store.clone()),
            retries: RetryCoordinator::new(store.clone(), executor.clone()),
            tester: ConnectionTester::new(
                store.clone(),
                settings.probe_timeout,
                settings.allow_internal_ips,
            )?,
            executor,
            dispatcher,
            store,
        })
    }

    pub async fn create_source(&self, source: NewLeadSource) -> PipelineResult<LeadSource> {
        if source.name.trim().is_empty() {
            return Err(PipelineError::validation("source name must not be empty"));
        }
        ParseOptions::from_config(&source.config)
            .map_err(|e| PipelineError::validation(e.to_string()))?;

        let source = self.store.insert_source(source).await?;
        info!(source_id = %source.id, kind = %source.kind, "created lead source");
        Ok(source)
    }

    pub async fn get_source(&self, source_id: Uuid) -> PipelineResult<LeadSource> {
        self.store
            .get_source(source_id)
            .await?
            .ok_or(PipelineError::not_found("lead source", source_id))
    }

    pub async fn run_import(
        &self,
        source_id: Uuid,
        rows: Vec<RawRecord>,
    ) -> PipelineResult<ImportSummary> {
        self.executor.run_import(source_id, rows).await
    }

    /// Parse delimited text with the source's configuration, then import the rows.
    pub async fn import_text(&self, source_id: Uuid, text: &str) -> PipelineResult<ImportSummary> {
        let source = self.get_source(source_id).await?;
        let options = ParseOptions::from_config(&source.config)
            .map_err(|e| PipelineError::validation(e.to_string()))?;
        let rows = parse_rows(text, options).map_err(|e| PipelineError::validation(e.to_string()))?;

        self.executor.run_import(source_id, rows).await
    }

    pub async fn get_logs(&self, source_id: Uuid, page: i64, limit: i64) -> PipelineResult<LogPage> {
        self.get_source(source_id).await?;
        Ok(self.audit.page(source_id, page, limit).await?)
    }

    pub async fn retry_import(&self, source_id: Uuid, log_id: Uuid) -> PipelineResult<RetryOutcome> {
        self.retries.retry(source_id, log_id).await
    }

    pub async fn test_connection(&self, source_id: Uuid) -> PipelineResult<ConnectionReport> {
        self.tester.test_connection(source_id).await
    }

    /// Replace the source's mapping as a whole.
    pub async fn save_mapping(
        &self,
        source_id: Uuid,
        mapping: FieldMapping,
    ) -> PipelineResult<FieldMapping> {
        self.get_source(source_id).await?;
        mapping.validate().map_err(PipelineError::Validation)?;

        self.store.put_mapping(source_id, &mapping).await?;
        Ok(mapping)
    }

    pub async fn get_mapping(&self, source_id: Uuid) -> PipelineResult<FieldMapping> {
        let source = self.get_source(source_id).await?;
        Ok(self.mapper.resolve_for_source(&source).await?)
    }

    pub async fn list_webhooks(&self, source_id: Uuid) -> PipelineResult<Vec<Webhook>> {
        self.get_source(source_id).await?;
        Ok(self.store.list_webhooks(source_id).await?)
    }

    pub async fn create_webhook(
        &self,
        source_id: Uuid,
        params: WebhookParams,
    ) -> PipelineResult<Webhook> {
        self.get_source(source_id).await?;
        validate_target(&params.url).map_err(|e| PipelineError::validation(e.to_string()))?;

        let webhook = self.store.insert_webhook(source_id, params).await?;
        info!(webhook_id = %webhook.id, source_id = %source_id, "created webhook");
        Ok(webhook)
    }

    pub async fn update_webhook(
        &self,
        webhook_id: Uuid,
        params: WebhookParams,
    ) -> PipelineResult<Webhook> {
        validate_target(&params.url).map_err(|e| PipelineError::validation(e.to_string()))?;

        self.store
            .update_webhook(webhook_id, params)
            .await
            .map_err(missing_as_not_found)
    }

    pub async fn delete_webhook(&self, webhook_id: Uuid) -> PipelineResult<()> {
        self.store
            .delete_webhook(webhook_id)
            .await
            .map_err(missing_as_not_found)
    }

    /// Send a `test` event to one webhook, active or not. The attempt is logged like any
    /// other delivery.
    pub async fn test_webhook(&self, webhook_id: Uuid) -> PipelineResult<DeliveryOutcome> {
        let webhook = self
            .store
            .get_webhook(webhook_id)
            .await?
            .ok_or(PipelineError::not_found("webhook", webhook_id))?;

        let payload = json!({
            "source_id": webhook.source_id,
            "message": "This is a test notification",
        });
        Ok(self
            .dispatcher
            .deliver(&webhook, EventType::Test, &payload)
            .await)
    }
}

fn missing_as_not_found(error: StoreError) -> PipelineError {
    match error {
        StoreError::Missing { entity, id } => PipelineError::NotFound { entity, id },
        other => PipelineError::Store(other),
    }
}
