use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

/// Opaque identity handed over by the identity provider. Trusted as-is.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = DispatchError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self).map_err(|_| {
                    DispatchError::Validation(format!(
                        "invalid {} '{}'",
                        stringify!($name),
                        s
                    ))
                })
            }
        }
    };
}

uuid_id!(ProfileId);
uuid_id!(OrderId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Requester,
    Agent,
    Recipient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Requester => "requester",
            Role::Agent => "agent",
            Role::Recipient => "recipient",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requester" => Ok(Role::Requester),
            "agent" => Ok(Role::Agent),
            "recipient" => Ok(Role::Recipient),
            other => Err(DispatchError::Validation(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Accepted,
    Delivered,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Accepted => "accepted",
            OrderStatus::Delivered => "delivered",
        }
    }

    /// The only edges of the order state machine. `Delivered` is terminal.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Accepted)
                | (OrderStatus::Accepted, OrderStatus::Delivered)
        )
    }

    /// Whether an order in this status must carry an agent.
    pub fn requires_agent(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "accepted" => Ok(OrderStatus::Accepted),
            "delivered" => Ok(OrderStatus::Delivered),
            other => Err(DispatchError::Validation(format!(
                "unknown order status '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: ProfileId,
    pub actor_id: ActorId,
    pub role: Role,
    pub display_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub requester_profile_id: ProfileId,
    #[serde(default)]
    pub recipient_profile_id: Option<ProfileId>,
    #[serde(default)]
    pub agent_profile_id: Option<ProfileId>,
    pub pickup_address: String,
    pub delivery_address: String,
    pub description: String,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by every committed write; starts at 1.
    pub revision: u64,
}

impl Order {
    /// True when the profile is the requester, the agent or the recipient.
    pub fn involves(&self, profile_id: ProfileId) -> bool {
        self.requester_profile_id == profile_id
            || self.agent_profile_id == Some(profile_id)
            || self.recipient_profile_id == Some(profile_id)
    }

    /// `agent_profile_id` is set exactly when the status requires it.
    pub fn is_consistent(&self) -> bool {
        self.status.requires_agent() == self.agent_profile_id.is_some()
    }

    /// Parties can always read an order; any agent can read it while it sits
    /// in the pending pool.
    pub fn readable_by(&self, profile_id: ProfileId, role: Role) -> bool {
        self.involves(profile_id) || (role == Role::Agent && self.status == OrderStatus::Pending)
    }
}

/// Requester-supplied payload for a new order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderInput {
    pub pickup_address: String,
    pub delivery_address: String,
    pub description: String,
    /// Display name of the recipient, resolved best-effort.
    #[serde(default)]
    pub recipient_name: Option<String>,
}

impl NewOrderInput {
    pub fn new(
        pickup_address: impl Into<String>,
        delivery_address: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            pickup_address: pickup_address.into(),
            delivery_address: delivery_address.into(),
            description: description.into(),
            recipient_name: None,
        }
    }

    pub fn with_recipient(mut self, name: impl Into<String>) -> Self {
        self.recipient_name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        let missing: Vec<&str> = [
            ("pickupAddress", &self.pickup_address),
            ("deliveryAddress", &self.delivery_address),
            ("description", &self.description),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Validation(format!(
                "required fields are empty: {}",
                missing.join(", ")
            )))
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProfileInput {
    pub role: Role,
    pub display_name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl NewProfileInput {
    pub fn new(role: Role, display_name: impl Into<String>) -> Self {
        Self {
            role,
            display_name: display_name.into(),
            phone: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.display_name.trim().is_empty() {
            return Err(DispatchError::Validation(
                "displayName must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

uuid_id!(WriteId);

/// Field changes applied by a conditional write.
///
/// Each mutation carries a fresh [`WriteId`]; the store remembers the last one
/// it committed per order so a retried write can tell its own earlier commit
/// apart from someone else's.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderMutation {
    pub status: OrderStatus,
    pub agent_profile_id: Option<ProfileId>,
    pub write_id: WriteId,
}

impl OrderMutation {
    pub fn accept(agent: ProfileId) -> Self {
        Self {
            status: OrderStatus::Accepted,
            agent_profile_id: Some(agent),
            write_id: WriteId::generate(),
        }
    }

    pub fn deliver() -> Self {
        Self {
            status: OrderStatus::Delivered,
            agent_profile_id: None,
            write_id: WriteId::generate(),
        }
    }
}

/// Query shapes supported by the store. Results are newest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderQuery {
    Status(OrderStatus),
    Requester(ProfileId),
    Agent(ProfileId),
    Recipient(ProfileId),
}
