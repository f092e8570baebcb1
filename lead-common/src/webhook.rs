use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::dns::{build_http_client, is_error_source, is_public_target, NoPublicIPv4Error};
use crate::model::{EventType, ImportJob, JobCompletion, JobOperation, JobStatus, Webhook};
use crate::store::LeadStore;

pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// A single webhook call that failed. Never propagated past the dispatcher: it is
/// recorded against the delivery's log entry instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("invalid webhook target {url}: {reason}")]
    InvalidTarget { url: String, reason: String },
    #[error("webhook request timed out: {0}")]
    Timeout(String),
    #[error("webhook endpoint responded with status {0}")]
    HttpStatus(u16),
    #[error("webhook connection failed: {0}")]
    Connection(String),
    #[error("webhook target {0} does not resolve to a public IPv4 address")]
    NonPublicTarget(String),
}

impl DeliveryError {
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::InvalidTarget { .. } => "invalid_target",
            DeliveryError::Timeout(_) => "timeout",
            DeliveryError::HttpStatus(_) => "http_status",
            DeliveryError::Connection(_) => "connection",
            DeliveryError::NonPublicTarget(_) => "non_public_target",
        }
    }

    fn invalid_target(url: &str, reason: impl Into<String>) -> Self {
        DeliveryError::InvalidTarget {
            url: url.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Anything reqwest reports that is neither a timeout, a bad status nor a refused
/// internal address is treated as a connection error.
impl From<&reqwest::Error> for DeliveryError {
    fn from(error: &reqwest::Error) -> Self {
        if is_error_source::<NoPublicIPv4Error>(error) {
            DeliveryError::NonPublicTarget(
                error.url().map(|url| url.to_string()).unwrap_or_default(),
            )
        } else if error.is_timeout() {
            DeliveryError::Timeout(error.to_string())
        } else if let Some(status) = error.status() {
            DeliveryError::HttpStatus(status.as_u16())
        } else {
            DeliveryError::Connection(error.to_string())
        }
    }
}

/// Check that `target` is an absolute http(s) URL with a host. Whether the host is
/// reachable from here is checked separately, see [`WebhookDispatcher::new`].
pub fn validate_target(target: &str) -> Result<Url, DeliveryError> {
    let url = Url::parse(target).map_err(|e| DeliveryError::invalid_target(target, e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(DeliveryError::invalid_target(
                target,
                format!("unsupported scheme {}", scheme),
            ))
        }
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(DeliveryError::invalid_target(target, "missing host")),
    }
}

/// What happened to one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub webhook_id: Uuid,
    pub url: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    /// The audit log entry recording this attempt, unless it could not be written.
    pub log_id: Option<Uuid>,
}

/// Fans an event out to a source's subscribed webhooks.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    store: Arc<dyn LeadStore>,
    audit: AuditLog,
    allow_internal_ips: bool,
}

impl WebhookDispatcher {
    /// Unless `allow_internal_ips` is set, targets on loopback, private or link-local
    /// addresses are refused before and after DNS resolution.
    pub fn new(
        store: Arc<dyn LeadStore>,
        request_timeout: Duration,
        allow_internal_ips: bool,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = build_http_client(
            "Lead Pipeline Webhook Dispatcher",
            request_timeout,
            headers,
            allow_internal_ips,
        )?;

        Ok(Self::with_client(store, client, allow_internal_ips))
    }

    pub fn with_client(
        store: Arc<dyn LeadStore>,
        client: reqwest::Client,
        allow_internal_ips: bool,
    ) -> Self {
        let audit = AuditLog::new(store.clone());
        Self {
            client,
            store,
            audit,
            allow_internal_ips,
        }
    }

    /// Deliver `payload` to every active webhook of `source_id` subscribed to
    /// `event_type`, concurrently. Failures are captured per delivery; this never fails.
    pub async fn notify(
        &self,
        source_id: Uuid,
        event_type: EventType,
        payload: Value,
    ) -> Vec<DeliveryOutcome> {
        let webhooks = match self.store.active_webhooks(source_id, event_type).await {
            Ok(webhooks) => webhooks,
            Err(e) => {
                error!(
                    source_id = %source_id,
                    event_type = %event_type,
                    "failed to look up webhooks: {}",
                    e
                );
                return Vec::new();
            }
        };

        if webhooks.is_empty() {
            debug!(source_id = %source_id, event_type = %event_type, "no webhooks to notify");
            return Vec::new();
        }

        join_all(
            webhooks
                .iter()
                .map(|webhook| self.deliver(webhook, event_type, &payload)),
        )
        .await
    }

    /// Make a single delivery attempt to `webhook`, whether or not it is active, and
    /// record the outcome in the audit log.
    pub async fn deliver(
        &self,
        webhook: &Webhook,
        event_type: EventType,
        payload: &Value,
    ) -> DeliveryOutcome {
        let body = delivery_body(webhook, event_type, payload);
        let log_id = self.begin(webhook, event_type).await;

        let start = Instant::now();
        let result = self.send(&webhook.url, &body).await;
        metrics::histogram!("lead_webhook_delivery_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        let status = match &result {
            Ok(_) => JobStatus::Success,
            Err(_) => JobStatus::Error,
        };
        metrics::counter!(
            "lead_webhook_deliveries_total",
            &[("status", status.as_str())]
        )
        .increment(1);

        match &result {
            Ok(code) => info!(
                webhook_id = %webhook.id,
                event_type = %event_type,
                "delivered webhook with status {}",
                code
            ),
            Err(e) => error!(
                webhook_id = %webhook.id,
                event_type = %event_type,
                "webhook delivery failed: {}",
                e
            ),
        }

        if let Some(log_id) = log_id {
            self.record(log_id, webhook, event_type, &result).await;
        }

        match result {
            Ok(code) => DeliveryOutcome {
                webhook_id: webhook.id,
                url: webhook.url.clone(),
                success: true,
                status_code: Some(code),
                error: None,
                log_id,
            },
            Err(e) => DeliveryOutcome {
                webhook_id: webhook.id,
                url: webhook.url.clone(),
                success: false,
                status_code: match e {
                    DeliveryError::HttpStatus(code) => Some(code),
                    _ => None,
                },
                error: Some(e.to_string()),
                log_id,
            },
        }
    }

    async fn send(&self, target: &str, body: &Value) -> Result<u16, DeliveryError> {
        let url = validate_target(target)?;
        if !self.allow_internal_ips && !is_public_target(&url) {
            return Err(DeliveryError::NonPublicTarget(target.to_owned()));
        }

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::from(&e))?;

        match response.error_for_status() {
            Ok(response) => Ok(response.status().as_u16()),
            Err(e) => Err(DeliveryError::from(&e)),
        }
    }

    /// Open the pending `webhook_delivery` entry before the request goes out.
    async fn begin(&self, webhook: &Webhook, event_type: EventType) -> Option<Uuid> {
        let pending = ImportJob::pending(
            webhook.source_id,
            JobOperation::WebhookDelivery,
            format!("Delivering {} event to {}", event_type, webhook.url),
            0,
        );

        match self.audit.append(pending).await {
            Ok(job) => Some(job.id),
            Err(e) => {
                warn!(webhook_id = %webhook.id, "failed to record webhook delivery: {}", e);
                None
            }
        }
    }

    async fn record(
        &self,
        log_id: Uuid,
        webhook: &Webhook,
        event_type: EventType,
        result: &Result<u16, DeliveryError>,
    ) {
        let completion = match result {
            Ok(code) => JobCompletion::new(
                JobStatus::Success,
                0,
                0,
                json!({
                    "webhook_id": webhook.id,
                    "event_type": event_type,
                    "url": webhook.url,
                    "status_code": code,
                }),
            )
            .with_message(format!("Delivered {} event to {}", event_type, webhook.url)),
            Err(e) => JobCompletion::new(
                JobStatus::Error,
                0,
                0,
                json!({
                    "webhook_id": webhook.id,
                    "event_type": event_type,
                    "url": webhook.url,
                    "error_kind": e.kind(),
                }),
            )
            .with_message(format!(
                "Failed to deliver {} event to {}",
                event_type, webhook.url
            ))
            .with_error(e.to_string()),
        };

        if let Err(e) = self.audit.finish(log_id, completion).await {
            warn!(webhook_id = %webhook.id, log_id = %log_id, "failed to finish webhook delivery log: {}", e);
        }
    }
}

/// The caller's payload merged with the delivery envelope fields. A payload that is not
/// a JSON object is nested under `data`.
fn delivery_body(webhook: &Webhook, event_type: EventType, payload: &Value) -> Value {
    let mut body = match payload {
        Value::Object(fields) => fields.clone(),
        Value::Null => Map::new(),
        other => {
            let mut fields = Map::new();
            fields.insert("data".to_owned(), other.clone());
            fields
        }
    };

    body.insert("event_type".to_owned(), json!(event_type));
    body.insert("webhook_id".to_owned(), json!(webhook.id));
    body.insert("timestamp".to_owned(), json!(Utc::now()));

    Value::Object(body)
}
