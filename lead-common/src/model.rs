use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// A raw record as received from a source: raw field name to string value.
pub type RawRecord = BTreeMap<String, String>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseModelError {
    #[error("{0} is not a valid JobStatus")]
    JobStatus(String),
    #[error("{0} is not a valid JobOperation")]
    JobOperation(String),
    #[error("{0} is not a valid EventType")]
    EventType(String),
    #[error("{0} is not a valid CanonicalField")]
    CanonicalField(String),
}

/// The kind of origin a `LeadSource` pulls prospects from.
///
/// `Unsupported` keeps a stored kind that this version has no connector for, so such a
/// source can still be loaded and reported on instead of failing every lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKind {
    File,
    Api,
    Salesforce,
    Hubspot,
    Unsupported(String),
}

impl FromStr for SourceKind {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_ref() {
            "file" | "csv" => SourceKind::File,
            "api" => SourceKind::Api,
            "salesforce" => SourceKind::Salesforce,
            "hubspot" => SourceKind::Hubspot,
            other => SourceKind::Unsupported(other.to_owned()),
        })
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SourceKind::File => write!(f, "file"),
            SourceKind::Api => write!(f, "api"),
            SourceKind::Salesforce => write!(f, "salesforce"),
            SourceKind::Hubspot => write!(f, "hubspot"),
            SourceKind::Unsupported(kind) => write!(f, "{}", kind),
        }
    }
}

impl Serialize for SourceKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SourceKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        // Infallible: unknown kinds become `Unsupported`.
        Ok(SourceKind::from_str(&raw).unwrap_or(SourceKind::Unsupported(raw)))
    }
}

/// The fixed set of attributes every source is mapped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    FirstName,
    LastName,
    Email,
    Phone,
}

impl CanonicalField {
    /// All canonical fields, in the order used for positional (header-less) rows.
    pub const ALL: [CanonicalField; 4] = [
        CanonicalField::FirstName,
        CanonicalField::LastName,
        CanonicalField::Email,
        CanonicalField::Phone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::FirstName => "first_name",
            CanonicalField::LastName => "last_name",
            CanonicalField::Email => "email",
            CanonicalField::Phone => "phone",
        }
    }
}

impl FromStr for CanonicalField {
    type Err = ParseModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalField::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| ParseModelError::CanonicalField(s.to_owned()))
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub delimiter: char,
    pub has_header: bool,
    /// Applied over the built-in default mapping when no FieldMapping is saved.
    pub mapping_overrides: BTreeMap<CanonicalField, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_url: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            has_header: true,
            mapping_overrides: BTreeMap::new(),
            endpoint: None,
            instance_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadSource {
    pub id: Uuid,
    pub name: String,
    pub kind: SourceKind,
    pub config: SourceConfig,
    /// Opaque to the pipeline and never echoed back.
    #[serde(skip_serializing, default)]
    pub credentials: Option<Value>,
    pub active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLeadSource {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub config: SourceConfig,
    #[serde(default)]
    pub credentials: Option<Value>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl NewLeadSource {
    pub fn new(name: &str, kind: SourceKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            config: SourceConfig::default(),
            credentials: None,
            active: true,
        }
    }

    pub fn with_config(mut self, config: SourceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn into_source(self) -> LeadSource {
        LeadSource {
            id: Uuid::now_v7(),
            name: self.name,
            kind: self.kind,
            config: self.config,
            credentials: self.credentials,
            active: self.active,
            last_synced_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Enumeration of possible statuses for an ImportJob.
/// Pending: the run has started and has not been classified yet.
/// Success: every record was handled without failures.
/// Partial: the run completed but some (or, by policy, all) records failed.
/// Error: the run was aborted before it could classify its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Success,
    Partial,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl FromStr for JobStatus {
    type Err = ParseModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "success" => Ok(JobStatus::Success),
            "partial" => Ok(JobStatus::Partial),
            "error" => Ok(JobStatus::Error),
            invalid => Err(ParseModelError::JobStatus(invalid.to_owned())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What produced an audit log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOperation {
    Import,
    Retry,
    ConnectionTest,
    WebhookDelivery,
}

impl JobOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOperation::Import => "import",
            JobOperation::Retry => "retry",
            JobOperation::ConnectionTest => "connection_test",
            JobOperation::WebhookDelivery => "webhook_delivery",
        }
    }
}

impl FromStr for JobOperation {
    type Err = ParseModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "import" => Ok(JobOperation::Import),
            "retry" => Ok(JobOperation::Retry),
            "connection_test" => Ok(JobOperation::ConnectionTest),
            "webhook_delivery" => Ok(JobOperation::WebhookDelivery),
            invalid => Err(ParseModelError::JobOperation(invalid.to_owned())),
        }
    }
}

/// One audited execution: an import run, a retry, a connection test or a webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub source_id: Uuid,
    pub operation: JobOperation,
    pub status: JobStatus,
    pub message: String,
    pub processed: i64,
    pub imported: i64,
    pub failed: i64,
    pub details: Value,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    /// A fresh entry in `pending` state, started now.
    pub fn pending(
        source_id: Uuid,
        operation: JobOperation,
        message: impl Into<String>,
        processed: i64,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            source_id,
            operation,
            status: JobStatus::Pending,
            message: message.into(),
            processed,
            imported: 0,
            failed: 0,
            details: Value::Object(Default::default()),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Apply a terminal update in memory. Stores call this to keep both
    /// implementations in agreement on what a completion changes.
    pub fn complete(&mut self, completion: JobCompletion) {
        self.status = completion.status;
        if let Some(message) = completion.message {
            self.message = message;
        }
        self.imported = completion.imported;
        self.failed = completion.failed;
        self.details = completion.details;
        self.error = completion.error;
        self.completed_at = Some(completion.completed_at);
    }
}

/// The single terminal update applied to a pending ImportJob.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub message: Option<String>,
    pub imported: i64,
    pub failed: i64,
    pub details: Value,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl JobCompletion {
    pub fn new(status: JobStatus, imported: i64, failed: i64, details: Value) -> Self {
        Self {
            status,
            message: None,
            imported,
            failed,
            details,
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A canonical prospect candidate, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProspect {
    pub source_id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// The raw record, verbatim.
    pub metadata: RawRecord,
}

impl NewProspect {
    pub fn field(&self, field: CanonicalField) -> Option<&str> {
        match field {
            CanonicalField::FirstName => self.first_name.as_deref(),
            CanonicalField::LastName => self.last_name.as_deref(),
            CanonicalField::Email => self.email.as_deref(),
            CanonicalField::Phone => self.phone.as_deref(),
        }
    }

    pub fn set_field(&mut self, field: CanonicalField, value: Option<String>) {
        match field {
            CanonicalField::FirstName => self.first_name = value,
            CanonicalField::LastName => self.last_name = value,
            CanonicalField::Email => self.email = value,
            CanonicalField::Phone => self.phone = value,
        }
    }

    /// True when none of the canonical fields could be resolved from the raw record.
    pub fn is_blank(&self) -> bool {
        CanonicalField::ALL
            .iter()
            .all(|field| self.field(*field).is_none())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prospect {
    pub id: Uuid,
    pub source_id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub metadata: RawRecord,
    pub created_at: DateTime<Utc>,
}

impl Prospect {
    pub fn from_new(new: NewProspect) -> Self {
        Self {
            id: Uuid::now_v7(),
            source_id: new.source_id,
            first_name: new.first_name,
            last_name: new.last_name,
            email: new.email,
            phone: new.phone,
            metadata: new.metadata,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProspectEventType {
    Imported,
}

/// Append-only audit fact about a prospect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProspectEvent {
    pub id: Uuid,
    pub prospect_id: Uuid,
    pub event_type: ProspectEventType,
    pub occurred_at: DateTime<Utc>,
}

impl ProspectEvent {
    pub fn imported(prospect_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            prospect_id,
            event_type: ProspectEventType::Imported,
            occurred_at: Utc::now(),
        }
    }
}

/// Events webhooks can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Imported,
    ImportFailed,
    Test,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Imported => "imported",
            EventType::ImportFailed => "import_failed",
            EventType::Test => "test",
        }
    }
}

impl FromStr for EventType {
    type Err = ParseModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "imported" => Ok(EventType::Imported),
            "import_failed" => Ok(EventType::ImportFailed),
            "test" => Ok(EventType::Test),
            invalid => Err(ParseModelError::EventType(invalid.to_owned())),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub source_id: Uuid,
    pub event_type: EventType,
    pub url: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body used both to create a webhook and to replace an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookParams {
    pub event_type: EventType,
    pub url: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl WebhookParams {
    pub fn new(event_type: EventType, url: &str) -> Self {
        Self {
            event_type,
            url: url.to_owned(),
            active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_round_trips_unknown_kinds() {
        assert_eq!(SourceKind::from_str("CSV").unwrap(), SourceKind::File);
        assert_eq!(
            SourceKind::from_str("pipedrive").unwrap(),
            SourceKind::Unsupported("pipedrive".to_owned())
        );

        let kind: SourceKind = serde_json::from_str("\"pipedrive\"").unwrap();
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"pipedrive\"");
    }

    #[test]
    fn test_job_status_from_str() {
        assert_eq!(JobStatus::from_str("partial").unwrap(), JobStatus::Partial);
        assert_eq!(
            JobStatus::from_str("done"),
            Err(ParseModelError::JobStatus("done".to_owned()))
        );
        assert!(!JobStatus::Pending.is_terminal());
        assert!(JobStatus::Error.is_terminal());
    }

    #[test]
    fn test_source_config_defaults_when_fields_missing() {
        let config: SourceConfig = serde_json::from_str(r#"{"delimiter": ";"}"#).unwrap();

        assert_eq!(config.delimiter, ';');
        assert!(config.has_header);
        assert!(config.mapping_overrides.is_empty());
    }

    #[test]
    fn test_credentials_are_not_serialized() {
        let mut new = NewLeadSource::new("crm", SourceKind::Hubspot);
        new.credentials = Some(serde_json::json!({"token": "secret"}));
        let source = new.into_source();

        let serialized = serde_json::to_value(&source).unwrap();
        assert!(serialized.get("credentials").is_none());
    }

    #[test]
    fn test_blank_prospect() {
        let mut prospect = NewProspect {
            source_id: Uuid::now_v7(),
            first_name: None,
            last_name: None,
            email: None,
            phone: None,
            metadata: RawRecord::new(),
        };
        assert!(prospect.is_blank());

        prospect.set_field(CanonicalField::Phone, Some("555".to_owned()));
        assert!(!prospect.is_blank());
        assert_eq!(prospect.field(CanonicalField::Phone), Some("555"));
    }
}
