//! Notification fan-out to the push vendor.
//!
//! The vendor addresses devices through a filter expression over user tags.
//! Recipients are chunked into groups of `CHUNK_SIZE`, each group becoming
//! one vendor call with an OR-joined `account_number` filter.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const CHUNK_SIZE: usize = 100;

/// Vendor error meaning no device in the filter is subscribed.
pub const NOT_SUBSCRIBED: &str = "All included players are not subscribed";

const DEFAULT_PUSH_API_URL: &str = "https://onesignal.com/api/v1/notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    RiskLevelChanged,
    BroadcastNewHelp,
    NotifyHelpAccepted,
    AccountSymptomFollowUp,
    AccountSymptomSpike,
    BehaviorReportOnRiskArea,
}

/// Data attached to a notification for the client app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub notification_type: NotificationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poi_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub symptoms: Vec<String>,
}

impl Payload {
    pub fn new(notification_type: NotificationType) -> Self {
        Self {
            notification_type,
            poi_id: None,
            help_id: None,
            symptoms: Vec::new(),
        }
    }

    pub fn with_poi(mut self, poi_id: Option<&str>) -> Self {
        self.poi_id = poi_id.map(str::to_string);
        self
    }

    pub fn with_help(mut self, help_id: &str) -> Self {
        self.help_id = Some(help_id.to_string());
        self
    }

    pub fn with_symptoms(mut self, symptoms: Vec<String>) -> Self {
        self.symptoms = symptoms;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Tag {
        field: String,
        key: String,
        relation: String,
        value: String,
    },
    Operator {
        operator: String,
    },
}

impl Filter {
    fn account(account_number: &str) -> Self {
        Filter::Tag {
            field: "tag".to_string(),
            key: "account_number".to_string(),
            relation: "=".to_string(),
            value: account_number.to_string(),
        }
    }

    fn or() -> Self {
        Filter::Operator {
            operator: "OR".to_string(),
        }
    }
}

/// `a OR b OR c` over `account_number` tags.
pub fn account_filters(account_numbers: &[String]) -> Vec<Filter> {
    let mut filters = Vec::with_capacity(account_numbers.len() * 2);
    for (i, number) in account_numbers.iter().enumerate() {
        if i > 0 {
            filters.push(Filter::or());
        }
        filters.push(Filter::account(number));
    }
    filters
}

/// One vendor call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub headings: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub contents: BTreeMap<String, String>,
    pub filters: Vec<Filter>,
    pub data: Payload,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PushError {
    #[error("All included players are not subscribed")]
    NotSubscribed,
    #[error("push vendor rejected request: {0}")]
    Rejected(String),
    #[error("push vendor unreachable: {0}")]
    Transport(String),
}

#[async_trait]
pub trait PushSink: Send + Sync {
    async fn send(&self, request: &PushRequest) -> Result<(), PushError>;
}

/// Vendor client speaking the REST notification API.
pub struct HttpPushSink {
    client: reqwest::Client,
    url: String,
    app_id: String,
    api_key: String,
}

impl HttpPushSink {
    pub fn new(url: Option<&str>, app_id: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.unwrap_or(DEFAULT_PUSH_API_URL).to_string(),
            app_id: app_id.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Deserialize, Default)]
struct VendorResponse {
    #[serde(default)]
    errors: serde_json::Value,
}

fn vendor_errors(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect(),
        serde_json::Value::Object(map) => map.iter().map(|(k, v)| format!("{k}: {v}")).collect(),
        serde_json::Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[async_trait]
impl PushSink for HttpPushSink {
    async fn send(&self, request: &PushRequest) -> Result<(), PushError> {
        let mut body = serde_json::to_value(request)
            .map_err(|e| PushError::Rejected(format!("unserializable request: {e}")))?;
        body["app_id"] = serde_json::Value::String(self.app_id.clone());

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Basic {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;

        let status = resp.status();
        let parsed: VendorResponse = resp.json().await.unwrap_or_default();
        let errors = vendor_errors(&parsed.errors);

        if errors.len() == 1 && errors[0] == NOT_SUBSCRIBED {
            return Err(PushError::NotSubscribed);
        }
        if !status.is_success() || !errors.is_empty() {
            return Err(PushError::Rejected(format!("{status}: {}", errors.join("; "))));
        }
        Ok(())
    }
}

/// The fan-out adapter the loops talk to.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn PushSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn PushSink>) -> Self {
        Self { sink }
    }

    /// Sends one templated notification to every recipient. Every chunk is
    /// attempted; the first failure is returned afterwards.
    pub async fn notify_accounts(
        &self,
        recipients: &[String],
        template_id: &str,
        payload: &Payload,
    ) -> EngineResult<()> {
        self.fan_out(recipients, |filters| PushRequest {
            template_id: Some(template_id.to_string()),
            headings: BTreeMap::new(),
            contents: BTreeMap::new(),
            filters,
            data: payload.clone(),
        })
        .await
    }

    /// Same fan-out with inline localized text instead of a template.
    pub async fn notify_accounts_text(
        &self,
        recipients: &[String],
        headings: &BTreeMap<String, String>,
        contents: &BTreeMap<String, String>,
        payload: &Payload,
    ) -> EngineResult<()> {
        self.fan_out(recipients, |filters| PushRequest {
            template_id: None,
            headings: headings.clone(),
            contents: contents.clone(),
            filters,
            data: payload.clone(),
        })
        .await
    }

    pub async fn notify_account_text(
        &self,
        recipient: &str,
        headings: &BTreeMap<String, String>,
        contents: &BTreeMap<String, String>,
        payload: &Payload,
    ) -> EngineResult<()> {
        self.notify_accounts_text(&[recipient.to_string()], headings, contents, payload)
            .await
    }

    /// Attempts every chunk. When nothing went out the first failure is a
    /// retryable `Delivery`; once any chunk reached the vendor it becomes a
    /// `PartialDelivery`, which the activity runner does not retry.
    async fn fan_out<F>(&self, recipients: &[String], build: F) -> EngineResult<()>
    where
        F: Fn(Vec<Filter>) -> PushRequest + Send + Sync,
    {
        let mut first_error = None;
        let mut delivered = 0;
        let mut failed = 0;
        for (index, chunk) in recipients.chunks(CHUNK_SIZE).enumerate() {
            let request = build(account_filters(chunk));
            match self.sink.send(&request).await {
                Ok(()) => {
                    delivered += 1;
                    tracing::debug!(chunk = index, recipients = chunk.len(), "notification sent");
                }
                Err(PushError::NotSubscribed) => {
                    delivered += 1;
                    tracing::debug!(chunk = index, "no subscribed recipients in chunk");
                }
                Err(err) => {
                    failed += 1;
                    tracing::warn!(chunk = index, recipients = chunk.len(), error = %err, "notification chunk failed");
                    first_error.get_or_insert(format!("chunk {index}: {err}"));
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(msg) if delivered == 0 => Err(EngineError::Delivery(msg)),
            Some(msg) => {
                tracing::warn!(delivered, failed, "fan-out partly delivered");
                Err(EngineError::PartialDelivery(msg))
            }
        }
    }
}
