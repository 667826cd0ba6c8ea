use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of conversion reported by the tracking subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionType {
    Registration,
    Purchase,
}

impl ConversionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionType::Registration => "registration",
            ConversionType::Purchase => "purchase",
        }
    }
}

impl fmt::Display for ConversionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a conversion.
///
/// The tracking subsystem owns the vocabulary; statuses this crate does not
/// know about are carried through as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConversionStatus {
    Approved,
    Declined,
    Refunded,
    Chargeback,
    Pending,
    Other(String),
}

impl ConversionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ConversionStatus::Approved => "approved",
            ConversionStatus::Declined => "declined",
            ConversionStatus::Refunded => "refunded",
            ConversionStatus::Chargeback => "chargeback",
            ConversionStatus::Pending => "pending",
            ConversionStatus::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for ConversionStatus {
    fn from(value: &str) -> Self {
        match value {
            "approved" => ConversionStatus::Approved,
            "declined" => ConversionStatus::Declined,
            "refunded" => ConversionStatus::Refunded,
            "chargeback" => ConversionStatus::Chargeback,
            "pending" => ConversionStatus::Pending,
            other => ConversionStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for ConversionStatus {
    fn from(value: String) -> Self {
        ConversionStatus::from(value.as_str())
    }
}

impl From<ConversionStatus> for String {
    fn from(value: ConversionStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finalized conversion handed over by the tracking subsystem.
///
/// Immutable once submitted; the engine only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub id: String,
    pub advertiser_id: String,
    pub partner_id: Option<String>,
    pub campaign_id: Option<String>,
    pub offer_id: Option<String>,
    pub flow_id: Option<String>,
    pub click_id: String,
    pub conversion_type: ConversionType,
    pub external_tx_id: String,
    pub currency: String,
    /// Decimal amount as reported, e.g. `"10.00"`.
    pub revenue: String,
    pub conversion_status: ConversionStatus,
    pub antifraud_level: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ConversionRecord {
    pub fn new(
        id: impl Into<String>,
        advertiser_id: impl Into<String>,
        click_id: impl Into<String>,
        conversion_type: ConversionType,
        conversion_status: impl Into<ConversionStatus>,
    ) -> Self {
        Self {
            id: id.into(),
            advertiser_id: advertiser_id.into(),
            partner_id: None,
            campaign_id: None,
            offer_id: None,
            flow_id: None,
            click_id: click_id.into(),
            conversion_type,
            external_tx_id: String::new(),
            currency: "USD".to_string(),
            revenue: "0".to_string(),
            conversion_status: conversion_status.into(),
            antifraud_level: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_partner_id(mut self, partner_id: impl Into<String>) -> Self {
        self.partner_id = Some(partner_id.into());
        self
    }

    pub fn with_campaign(
        mut self,
        campaign_id: impl Into<String>,
        offer_id: impl Into<String>,
        flow_id: impl Into<String>,
    ) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self.offer_id = Some(offer_id.into());
        self.flow_id = Some(flow_id.into());
        self
    }

    pub fn with_external_tx_id(mut self, tx_id: impl Into<String>) -> Self {
        self.external_tx_id = tx_id.into();
        self
    }

    pub fn with_revenue(mut self, revenue: impl Into<String>, currency: impl Into<String>) -> Self {
        self.revenue = revenue.into();
        self.currency = currency.into();
        self
    }

    pub fn with_antifraud_level(mut self, level: impl Into<String>) -> Self {
        self.antifraud_level = Some(level.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Engine-internal projection of a [`ConversionRecord`].
///
/// This is also the broker wire payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostbackTask {
    pub conversion_id: String,
    pub advertiser_id: String,
    pub partner_id: Option<String>,
    pub campaign_id: Option<String>,
    pub offer_id: Option<String>,
    pub flow_id: Option<String>,
    pub click_id: String,
    pub conversion_type: ConversionType,
    pub external_tx_id: String,
    pub conversion_status: ConversionStatus,
    pub revenue: String,
    pub currency: String,
    pub antifraud_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// Credentials injected into every request after template substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthInjection {
    Query { key: String, value: String },
    Header { name: String, value: String },
}

/// Keyed signature settings for a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    pub enabled: bool,
    pub secret: String,
    /// Template rendered with the same macros as the URL, then signed.
    pub payload_template: String,
    /// Query parameter that carries the signature.
    pub param_name: String,
    /// Header that carries the signature.
    pub header_name: String,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: String::new(),
            payload_template: String::new(),
            param_name: "signature".to_string(),
            header_name: "X-Postback-Signature".to_string(),
        }
    }
}

/// Advertiser/tracker delivery configuration.
///
/// Owned by an external configuration store; the engine treats it as
/// read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostbackProfile {
    pub advertiser_id: String,
    pub url_template: String,
    pub method: HttpMethod,
    pub auth: Option<AuthInjection>,
    /// Advertiser-defined macros, key to literal value.
    pub custom_params: BTreeMap<String, String>,
    /// `status_map[conversion_type][conversion_status]` to tracker label.
    pub status_map: HashMap<String, HashMap<String, String>>,
    pub signature: SignatureConfig,
    /// Optional POST body template; the default JSON body is sent otherwise.
    pub body_template: Option<String>,
    pub timeout_ms: u64,
    pub backoff_base_secs: u64,
}

impl Default for PostbackProfile {
    fn default() -> Self {
        Self {
            advertiser_id: String::new(),
            url_template: String::new(),
            method: HttpMethod::Get,
            auth: None,
            custom_params: BTreeMap::new(),
            status_map: HashMap::new(),
            signature: SignatureConfig::default(),
            body_template: None,
            timeout_ms: 10_000,
            backoff_base_secs: 2,
        }
    }
}

impl PostbackProfile {
    /// Create a GET profile with default timeout (10s) and backoff base (2s).
    pub fn new(advertiser_id: impl Into<String>, url_template: impl Into<String>) -> Self {
        Self {
            advertiser_id: advertiser_id.into(),
            url_template: url_template.into(),
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_auth(mut self, auth: AuthInjection) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_custom_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_params.insert(key.into(), value.into());
        self
    }

    /// Map `(conversion_type, conversion_status)` to the label the tracker expects.
    pub fn with_status_label(
        mut self,
        conversion_type: ConversionType,
        status: impl Into<ConversionStatus>,
        label: impl Into<String>,
    ) -> Self {
        self.status_map
            .entry(conversion_type.as_str().to_string())
            .or_default()
            .insert(status.into().as_str().to_string(), label.into());
        self
    }

    pub fn with_signature(
        mut self,
        secret: impl Into<String>,
        payload_template: impl Into<String>,
    ) -> Self {
        self.signature.enabled = true;
        self.signature.secret = secret.into();
        self.signature.payload_template = payload_template.into();
        self
    }

    pub fn with_signature_param(mut self, param_name: impl Into<String>) -> Self {
        self.signature.param_name = param_name.into();
        self
    }

    pub fn with_body_template(mut self, template: impl Into<String>) -> Self {
        self.body_template = Some(template.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_backoff_base_secs(mut self, base: u64) -> Self {
        self.backoff_base_secs = base;
        self
    }
}

/// A [`PostbackTask`] wrapped with delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueJob {
    /// `postback_{conversion_id}_{enqueue_epoch_millis}`.
    pub job_id: String,
    pub task: PostbackTask,
    /// 1-based attempt number of the next delivery.
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_delay_ms: u64,
}

/// Which execution strategy the selector currently routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Durable,
    Autonomous,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Durable => f.write_str("durable"),
            ExecutionMode::Autonomous => f.write_str("autonomous"),
        }
    }
}

/// Job counters for one queue backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl QueueStats {
    pub fn new(waiting: u64, active: u64, completed: u64, failed: u64) -> Self {
        Self {
            waiting,
            active,
            completed,
            failed,
            total: waiting + active + completed + failed,
        }
    }
}

/// Statistics surface consumed by the monitoring dashboard.
///
/// `error` is set when the durable broker could not be queried; the
/// counters then describe the in-process backend only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatsReport {
    pub mode: ExecutionMode,
    #[serde(flatten)]
    pub stats: QueueStats,
    pub error: Option<String>,
}
