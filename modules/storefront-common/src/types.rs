use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// --- Topics ---

/// Published by user-service on successful registration.
pub const USER_REGISTRATION_TOPIC: &str = "user-registration";
/// Notification requests (welcome, cart reminders, invoices).
pub const NOTIFICATION_TOPIC: &str = "notification-topic";
/// Provider handover, consumed by whatever actually sends email.
pub const EMAIL_SERVICE_TOPIC: &str = "email-service";

// --- Relays ---

/// The relays this workspace ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    /// user-registration → notification-topic
    Welcome,
    /// notification-topic → email-service
    Notification,
}

impl RelayKind {
    /// Service name stamped into `Event::source`.
    pub fn service_name(&self) -> &'static str {
        match self {
            RelayKind::Welcome => "WelcomeService",
            RelayKind::Notification => "NotificationService",
        }
    }

    pub fn default_group_id(&self) -> &'static str {
        match self {
            RelayKind::Welcome => "welcome-service-group",
            RelayKind::Notification => "notification-service-group",
        }
    }

    pub fn default_consume_topic(&self) -> &'static str {
        match self {
            RelayKind::Welcome => USER_REGISTRATION_TOPIC,
            RelayKind::Notification => NOTIFICATION_TOPIC,
        }
    }

    pub fn default_produce_topic(&self) -> &'static str {
        match self {
            RelayKind::Welcome => NOTIFICATION_TOPIC,
            RelayKind::Notification => EMAIL_SERVICE_TOPIC,
        }
    }
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayKind::Welcome => write!(f, "welcome"),
            RelayKind::Notification => write!(f, "notification"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown relay: {0} (expected welcome or notification)")]
pub struct UnknownRelay(pub String);

impl FromStr for RelayKind {
    type Err = UnknownRelay;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "welcome" => Ok(RelayKind::Welcome),
            "notification" | "notification-dispatch" => Ok(RelayKind::Notification),
            other => Err(UnknownRelay(other.to_string())),
        }
    }
}

/// How a relay names the events it derives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// Stable ids derived from the consumed event id. Replays collapse onto
    /// the same outbound record.
    #[default]
    Derived,
    /// Fresh random ids per delivery. Replays produce new outbound events.
    Random,
}

impl FromStr for IdStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "derived" => Ok(IdStrategy::Derived),
            "random" => Ok(IdStrategy::Random),
            other => Err(format!("unknown id strategy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_kind_parses_aliases() {
        assert_eq!("welcome".parse::<RelayKind>().unwrap(), RelayKind::Welcome);
        assert_eq!(
            "Notification-Dispatch".parse::<RelayKind>().unwrap(),
            RelayKind::Notification
        );
        assert!("order".parse::<RelayKind>().is_err());
    }

    #[test]
    fn relays_chain_through_notification_topic() {
        assert_eq!(
            RelayKind::Welcome.default_produce_topic(),
            RelayKind::Notification.default_consume_topic()
        );
    }
}
