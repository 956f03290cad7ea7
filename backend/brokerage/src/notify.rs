//! Notification port.
//!
//! Delivery is best-effort: the engine sends only after a store mutation
//! has committed, and a failed send never reverses it. Actual mail
//! transport lives behind an HTTP relay; when none is configured the
//! notifications are only logged.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::errors::{BrokerageError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Template {
    ProjectSubmission,
    PaymentConfirmation,
    ProjectAssigned,
    ProjectCompleted,
    MarketplacePurchase,
}

impl Template {
    /// Subject line for this template, filled from `data`.
    pub fn subject(&self, data: &Value) -> String {
        let field = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or_default();
        match self {
            Self::ProjectSubmission => format!("New Project Submission: {}", field("title")),
            Self::PaymentConfirmation => format!("Payment Confirmation: {}", field("title")),
            Self::ProjectAssigned => format!("Project Assigned: {}", field("title")),
            Self::ProjectCompleted => format!("Project Completed: {}", field("title")),
            Self::MarketplacePurchase => {
                format!("Marketplace Purchase: {}", field("productName"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub to: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    pub template: Template,
    pub data: Value,
}

impl Notification {
    pub fn new(template: Template, to: Vec<String>, data: Value) -> Self {
        Self {
            to,
            cc: Vec::new(),
            template,
            data,
        }
    }

    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.cc.push(address.into());
        self
    }

    pub fn subject(&self) -> String {
        self.template.subject(&self.data)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            template = ?notification.template,
            to = ?notification.to,
            cc = ?notification.cc,
            subject = %notification.subject(),
            "Notification (log only)"
        );
        Ok(())
    }
}

/// Posts notifications as JSON to a mail relay.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
    url: String,
    from: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>, from: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
            from: from.into(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "from": self.from,
                "to": notification.to,
                "cc": notification.cc,
                "subject": notification.subject(),
                "template": notification.template,
                "data": notification.data,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerageError::Unavailable(format!(
                "mail relay returned {status}"
            )));
        }
        debug!(template = ?notification.template, "Notification relayed");
        Ok(())
    }
}
