use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::dns::{build_http_client, is_public_target};
use crate::error::{PipelineError, PipelineResult};
use crate::model::{ImportJob, JobCompletion, JobOperation, JobStatus, LeadSource, SourceKind};
use crate::parse::ParseOptions;
use crate::store::LeadStore;
use crate::webhook::{validate_target, DeliveryError};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const HUBSPOT_API_URL: &str = "https://api.hubapi.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub success: bool,
    pub message: String,
    pub details: Value,
    pub log_id: Uuid,
}

/// Checks that a source can be read from, logging the attempt like any other job.
#[derive(Clone)]
pub struct ConnectionTester {
    client: reqwest::Client,
    store: Arc<dyn LeadStore>,
    audit: AuditLog,
    allow_internal_ips: bool,
}

impl ConnectionTester {
    pub fn new(
        store: Arc<dyn LeadStore>,
        probe_timeout: Duration,
        allow_internal_ips: bool,
    ) -> Result<Self, reqwest::Error> {
        let client = build_http_client(
            "Lead Pipeline Connection Tester",
            probe_timeout,
            HeaderMap::new(),
            allow_internal_ips,
        )?;

        Ok(Self {
            client,
            audit: AuditLog::new(store.clone()),
            store,
            allow_internal_ips,
        })
    }

    pub async fn test_connection(&self, source_id: Uuid) -> PipelineResult<ConnectionReport> {
        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or(PipelineError::not_found("lead source", source_id))?;

        let job = self
            .audit
            .append(ImportJob::pending(
                source_id,
                JobOperation::ConnectionTest,
                format!("Testing connection to {}", source.name),
                0,
            ))
            .await?;

        let (success, message, details) = self.check(&source).await;

        let status = if success {
            JobStatus::Success
        } else {
            JobStatus::Error
        };
        let mut completion =
            JobCompletion::new(status, 0, 0, details.clone()).with_message(message.clone());
        if !success {
            completion = completion.with_error(message.clone());
        }
        self.audit.finish(job.id, completion).await?;

        if success {
            info!(source_id = %source_id, "connection test passed: {}", message);
        } else {
            warn!(source_id = %source_id, "connection test failed: {}", message);
        }

        Ok(ConnectionReport {
            success,
            message,
            details,
            log_id: job.id,
        })
    }

    async fn check(&self, source: &LeadSource) -> (bool, String, Value) {
        match &source.kind {
            SourceKind::File => match ParseOptions::from_config(&source.config) {
                Ok(_) => (
                    true,
                    "File source configuration is valid".to_owned(),
                    json!({
                        "kind": source.kind,
                        "delimiter": source.config.delimiter.to_string(),
                        "has_header": source.config.has_header,
                    }),
                ),
                Err(e) => (false, e.to_string(), json!({ "kind": source.kind })),
            },
            SourceKind::Api => self.probe(&source.kind, source.config.endpoint.as_deref()).await,
            SourceKind::Salesforce => {
                self.probe(&source.kind, source.config.instance_url.as_deref())
                    .await
            }
            SourceKind::Hubspot => {
                let target = source
                    .config
                    .instance_url
                    .as_deref()
                    .unwrap_or(HUBSPOT_API_URL);
                self.probe(&source.kind, Some(target)).await
            }
            SourceKind::Unsupported(kind) => (
                false,
                format!("Unsupported source type: {}", kind),
                json!({ "kind": kind }),
            ),
        }
    }

    /// A single GET against `target`. Any response that is not a server error counts as
    /// reachable: credentials are not presented, so 401/403 are expected.
    async fn probe(&self, kind: &SourceKind, target: Option<&str>) -> (bool, String, Value) {
        let Some(target) = target else {
            return (
                false,
                format!("No endpoint configured for {} source", kind),
                json!({ "kind": kind }),
            );
        };

        let checked = validate_target(target).and_then(|url| {
            if self.allow_internal_ips || is_public_target(&url) {
                Ok(url)
            } else {
                Err(DeliveryError::NonPublicTarget(target.to_owned()))
            }
        });
        let url = match checked {
            Ok(url) => url,
            Err(e) => {
                return (
                    false,
                    e.to_string(),
                    json!({ "kind": kind, "target": target, "error_kind": e.kind() }),
                )
            }
        };

        match self.client.get(url).send().await {
            Ok(response) if !response.status().is_server_error() => (
                true,
                format!("Connected to {}", target),
                json!({ "kind": kind, "target": target, "status_code": response.status().as_u16() }),
            ),
            Ok(response) => (
                false,
                format!("{} responded with status {}", target, response.status().as_u16()),
                json!({ "kind": kind, "target": target, "status_code": response.status().as_u16() }),
            ),
            Err(e) => {
                let error = DeliveryError::from(&e);
                (
                    false,
                    format!("Could not reach {}: {}", target, e),
                    json!({ "kind": kind, "target": target, "error_kind": error.kind() }),
                )
            }
        }
    }
}
