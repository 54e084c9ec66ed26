use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    ActorId, NewOrderInput, NewProfileInput, Order, OrderId, OrderMutation, OrderQuery,
    OrderStatus, Profile, ProfileId, Role, WriteId,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The conditional write predicate did not hold. Carries the stored record
    /// and the id of the write that produced it, when the store knows it.
    #[error("conditional write rejected: order is '{}'", current.status)]
    Conflict {
        current: Box<Order>,
        last_write: Option<WriteId>,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("unique constraint violated: {0}")]
    Duplicate(&'static str),

    /// Transient failure; the repository may retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store data corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable home of profiles and orders.
///
/// Every method is atomic with respect to every other call on the same store.
/// `compare_and_set` is the only way an order changes after insertion: it must
/// check `expected` against the stored status and apply `mutation` as one
/// indivisible step, bumping `revision` and recording `mutation.write_id`.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn insert_profile(&self, actor: &ActorId, input: &NewProfileInput) -> StoreResult<Profile>;

    async fn profile_by_actor(&self, actor: &ActorId) -> StoreResult<Option<Profile>>;

    /// Profiles with the given role whose display name equals `name`,
    /// in registration order.
    async fn profiles_named(&self, name: &str, role: Role) -> StoreResult<Vec<Profile>>;

    async fn insert_order(
        &self,
        requester: ProfileId,
        recipient: Option<ProfileId>,
        input: &NewOrderInput,
    ) -> StoreResult<Order>;

    async fn order(&self, id: OrderId) -> StoreResult<Option<Order>>;

    async fn query_orders(&self, query: OrderQuery) -> StoreResult<Vec<Order>>;

    async fn compare_and_set(
        &self,
        id: OrderId,
        expected: OrderStatus,
        mutation: &OrderMutation,
    ) -> StoreResult<Order>;
}
