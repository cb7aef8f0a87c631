//! Notification relay: hand a notification request to the provider, then
//! announce the handover on the email-service topic.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map};
use storefront_common::RelayKind;
use storefront_events::Event;
use tracing::info;

use crate::error::ValidationError;
use crate::relay::{Accepted, Relay};

pub const SENT_TO_PROVIDER: &str = "NOTIFICATION_SENT_TO_PROVIDER";
pub const PROCESSED_NOTIFICATION_REQUEST: &str = "PROCESSED_NOTIFICATION_REQUEST_AND_SENT";

/// Derived from the subject line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    Welcome,
    Invoice,
    Generic,
}

impl NotificationType {
    pub fn classify(subject: &str) -> Self {
        if subject.contains("Bienvenido") {
            NotificationType::Welcome
        } else if subject.contains("Factura") {
            NotificationType::Invoice
        } else {
            NotificationType::Generic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Welcome => "WELCOME",
            NotificationType::Invoice => "INVOICE",
            NotificationType::Generic => "GENERIC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    /// Service that asked for the notification.
    pub origin: String,
    pub to: String,
    pub subject: String,
    pub content: String,
}

/// The provider that actually delivers notifications.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> anyhow::Result<()>;
}

/// Logs the notification instead of sending it.
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, request: &NotificationRequest) -> anyhow::Result<()> {
        info!(
            origin = %request.origin,
            to = %request.to,
            subject = %request.subject,
            "Simulated notification send"
        );
        Ok(())
    }
}

pub struct NotificationRelay {
    sender: Arc<dyn NotificationSender>,
}

impl NotificationRelay {
    pub fn new(sender: Arc<dyn NotificationSender>) -> Self {
        Self { sender }
    }
}

fn field<'a>(accepted: &'a Accepted, name: &str) -> &'a str {
    accepted.payload[name].as_str().unwrap_or_default()
}

#[async_trait]
impl Relay for NotificationRelay {
    fn kind(&self) -> RelayKind {
        RelayKind::Notification
    }

    fn has_side_effect(&self) -> bool {
        true
    }

    fn accept(&self, consumed: &Event) -> Result<Accepted, ValidationError> {
        let id = consumed.event_id();
        let to = consumed
            .payload_str("to")
            .ok_or_else(|| ValidationError::missing_payload(id, "to"))?;
        let subject = consumed
            .payload_str("subject")
            .ok_or_else(|| ValidationError::missing_payload(id, "subject"))?;
        let content = consumed
            .payload_str("content")
            .ok_or_else(|| ValidationError::missing_payload(id, "content"))?;

        let mut snapshot = Map::new();
        snapshot.insert("status".into(), json!(SENT_TO_PROVIDER));
        snapshot.insert(
            "notificationType".into(),
            json!(NotificationType::classify(subject).as_str()),
        );

        Ok(Accepted {
            key: to.to_string(),
            payload: json!({
                "to": to,
                "subject": subject,
                "content": content,
            }),
            snapshot,
            log_status: PROCESSED_NOTIFICATION_REQUEST,
        })
    }

    async fn dispatch(&self, consumed: &Event, accepted: &Accepted) -> anyhow::Result<()> {
        let request = NotificationRequest {
            origin: consumed.source().to_string(),
            to: field(accepted, "to").to_string(),
            subject: field(accepted, "subject").to_string(),
            content: field(accepted, "content").to_string(),
        };
        self.sender.send(&request).await
    }
}
