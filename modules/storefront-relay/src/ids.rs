//! Ids for the events a relay derives from a consumed event.

use storefront_common::IdStrategy;
use storefront_events::Event;
use uuid::Uuid;

/// Which derived event an id is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Outbound,
    Log,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Outbound => "outbound",
            Role::Log => "log",
        }
    }
}

/// Under `IdStrategy::Derived` the id is a UUIDv5 over
/// `<service>/<consumed id>/<role>`, so a redelivered event maps onto the
/// records of its first delivery.
#[derive(Debug, Clone)]
pub struct OutboundIds {
    strategy: IdStrategy,
    service: String,
}

impl OutboundIds {
    pub fn new(strategy: IdStrategy, service: impl Into<String>) -> Self {
        Self {
            strategy,
            service: service.into(),
        }
    }

    pub fn strategy(&self) -> IdStrategy {
        self.strategy
    }

    pub fn id_for(&self, consumed_event_id: &str, role: Role) -> String {
        match self.strategy {
            IdStrategy::Random => Event::generate_id(),
            IdStrategy::Derived => {
                let name = format!("{}/{}/{}", self.service, consumed_event_id, role.as_str());
                format!("evt_{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
            }
        }
    }
}
