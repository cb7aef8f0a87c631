//! Welcome relay: a new registration becomes a welcome notification request.

use serde_json::{json, Map};
use storefront_common::RelayKind;
use storefront_events::Event;

use crate::error::ValidationError;
use crate::relay::{Accepted, Relay};

pub const WELCOME_SUBJECT: &str = "¡Bienvenido a nuestra plataforma!";
pub const WELCOME_QUEUED: &str = "WELCOME_NOTIFICATION_QUEUED";
pub const PROCESSED_USER_REGISTRATION: &str = "PROCESSED_USER_REGISTRATION";

pub struct WelcomeRelay;

impl WelcomeRelay {
    fn content(name: &str, user_id: &str) -> String {
        format!(
            "Hola {name}, gracias por registrarte en nuestro e-commerce. Tu ID de usuario es {user_id}."
        )
    }
}

impl Relay for WelcomeRelay {
    fn kind(&self) -> RelayKind {
        RelayKind::Welcome
    }

    fn accept(&self, consumed: &Event) -> Result<Accepted, ValidationError> {
        let id = consumed.event_id();
        let email = consumed
            .payload_str("email")
            .ok_or_else(|| ValidationError::missing_payload(id, "email"))?;
        let name = consumed
            .payload_str("name")
            .ok_or_else(|| ValidationError::missing_payload(id, "name"))?;
        let user_id = consumed
            .snapshot_str("userId")
            .ok_or_else(|| ValidationError::missing_snapshot(id, "userId"))?;

        let mut snapshot = Map::new();
        snapshot.insert("status".into(), json!(WELCOME_QUEUED));
        snapshot.insert("targetUserId".into(), json!(user_id));

        Ok(Accepted {
            key: email.to_string(),
            payload: json!({
                "to": email,
                "subject": WELCOME_SUBJECT,
                "content": Self::content(name, user_id),
            }),
            snapshot,
            log_status: PROCESSED_USER_REGISTRATION,
        })
    }
}
