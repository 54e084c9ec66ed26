use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::store::{EntityStore, StoreError, StoreResult};
use crate::types::{
    ActorId, NewOrderInput, NewProfileInput, Order, OrderId, OrderMutation, OrderQuery,
    OrderStatus, Profile, ProfileId, Role,
};

/// Typed reads and writes over an [`EntityStore`].
///
/// Transient store failures are retried here with bounded backoff; every other
/// store outcome is translated once into the caller-facing taxonomy.
#[derive(Clone)]
pub struct OrderRepository {
    store: Arc<dyn EntityStore>,
    retry: RetryConfig,
}

impl OrderRepository {
    pub fn new(store: Arc<dyn EntityStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    async fn retrying<T, F, Fut>(&self, operation: &'static str, mut call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let attempts = self.retry.attempts();
        let mut attempt = 1;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient store failure, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn register_profile(
        &self,
        actor: &ActorId,
        input: &NewProfileInput,
    ) -> DispatchResult<Profile> {
        input.validate()?;
        let profile = self
            .retrying("register_profile", || self.store.insert_profile(actor, input))
            .await
            .map_err(|err| match err {
                StoreError::Duplicate(_) => DispatchError::DuplicateProfile,
                other => translate(other),
            })?;
        info!(profile_id = %profile.id, role = %profile.role, "profile registered");
        Ok(profile)
    }

    pub async fn resolve_profile(&self, actor: &ActorId) -> DispatchResult<Option<Profile>> {
        self.retrying("resolve_profile", || self.store.profile_by_actor(actor))
            .await
            .map_err(translate)
    }

    /// Best-effort: the first recipient registered under exactly this name.
    pub async fn find_recipient_by_name(&self, name: &str) -> DispatchResult<Option<ProfileId>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        let matches = self
            .retrying("find_recipient_by_name", || {
                self.store.profiles_named(name, Role::Recipient)
            })
            .await
            .map_err(translate)?;
        if matches.len() > 1 {
            debug!(name, candidates = matches.len(), "ambiguous recipient name, using first match");
        }
        Ok(matches.first().map(|profile| profile.id))
    }

    pub async fn create(&self, requester: &Profile, input: &NewOrderInput) -> DispatchResult<Order> {
        if requester.role != Role::Requester {
            return Err(DispatchError::denied(requester.role, "create"));
        }
        input.validate()?;

        let recipient = match input.recipient_name.as_deref() {
            Some(name) => self.find_recipient_by_name(name).await?,
            None => None,
        };

        let order = self
            .retrying("create", || {
                self.store.insert_order(requester.id, recipient, input)
            })
            .await
            .map_err(|err| match err {
                StoreError::NotFound { .. } => DispatchError::ProfileRequired,
                other => translate(other),
            })?;

        info!(
            order_id = %order.id,
            requester = %requester.id,
            recipient_resolved = recipient.is_some(),
            "order created"
        );
        Ok(order)
    }

    pub async fn list_pending(&self) -> DispatchResult<Vec<Order>> {
        self.query(OrderQuery::Status(OrderStatus::Pending)).await
    }

    pub async fn list_by_requester(&self, profile_id: ProfileId) -> DispatchResult<Vec<Order>> {
        self.query(OrderQuery::Requester(profile_id)).await
    }

    pub async fn list_by_agent(&self, profile_id: ProfileId) -> DispatchResult<Vec<Order>> {
        self.query(OrderQuery::Agent(profile_id)).await
    }

    pub async fn list_by_recipient(&self, profile_id: ProfileId) -> DispatchResult<Vec<Order>> {
        self.query(OrderQuery::Recipient(profile_id)).await
    }

    async fn query(&self, query: OrderQuery) -> DispatchResult<Vec<Order>> {
        let orders = self
            .retrying("query_orders", || self.store.query_orders(query))
            .await
            .map_err(translate)?;
        debug!(?query, count = orders.len(), "orders listed");
        Ok(orders)
    }

    pub async fn get_by_id(&self, id: OrderId) -> DispatchResult<Order> {
        self.retrying("get_by_id", || self.store.order(id))
            .await
            .map_err(translate)?
            .ok_or_else(|| DispatchError::order_not_found(id))
    }

    /// Conditional update: applies `mutation` only if the stored status is
    /// still `expected`, otherwise fails with [`DispatchError::Conflict`].
    pub async fn apply_transition(
        &self,
        id: OrderId,
        expected: OrderStatus,
        mutation: OrderMutation,
    ) -> DispatchResult<Order> {
        if !expected.can_transition_to(mutation.status) {
            return Err(DispatchError::InvalidTransition {
                order_id: id,
                from: expected,
                to: mutation.status,
            });
        }

        let mutation_ref = &mutation;
        let mut attempted = false;
        let result = self
            .retrying("apply_transition", || {
                let retry = attempted;
                attempted = true;
                let mutation = mutation_ref;
                async move {
                    match self.store.compare_and_set(id, expected, mutation).await {
                        // A write that committed before a transient failure shows up
                        // as a conflict on retry; recognise our own result.
                        Err(StoreError::Conflict {
                            current,
                            last_write,
                        }) if retry && last_write == Some(mutation.write_id) => Ok(*current),
                        other => other,
                    }
                }
            })
            .await;

        match result {
            Ok(order) => {
                info!(
                    order_id = %order.id,
                    from = %expected,
                    to = %order.status,
                    revision = order.revision,
                    "order transition committed"
                );
                Ok(order)
            }
            Err(other) => Err(translate(other)),
        }
    }
}

fn translate(err: StoreError) -> DispatchError {
    match err {
        StoreError::Conflict { current, .. } => DispatchError::Conflict {
            order_id: current.id,
            current: current.status,
        },
        StoreError::NotFound { entity, id } => DispatchError::NotFound { entity, id },
        StoreError::Duplicate(what) => DispatchError::Validation(format!("duplicate {what}")),
        StoreError::Unavailable(message) | StoreError::Corrupt(message) => {
            DispatchError::Unavailable(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalStore;

    fn repository() -> OrderRepository {
        OrderRepository::new(Arc::new(LocalStore::new()), RetryConfig::no_retry())
    }

    async fn profile(repo: &OrderRepository, actor: &str, role: Role, name: &str) -> Profile {
        repo.register_profile(&ActorId::new(actor), &NewProfileInput::new(role, name))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_requires_requester_role_before_validation() {
        let repo = repository();
        let agent = profile(&repo, "g", Role::Agent, "Gil").await;
        let err = repo
            .create(&agent, &NewOrderInput::new("", "", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Authorization { .. }));
    }

    #[tokio::test]
    async fn create_rejects_blank_fields() {
        let repo = repository();
        let requester = profile(&repo, "r", Role::Requester, "Acme").await;
        let err = repo
            .create(&requester, &NewOrderInput::new("A", "B", "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert!(repo.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recipient_is_resolved_by_exact_name() {
        let repo = repository();
        let requester = profile(&repo, "r", Role::Requester, "Acme").await;
        let first = profile(&repo, "c1", Role::Recipient, "Maria").await;
        profile(&repo, "c2", Role::Recipient, "Maria").await;
        profile(&repo, "g", Role::Agent, "Joana").await;

        let matched = repo
            .create(
                &requester,
                &NewOrderInput::new("A", "B", "box").with_recipient(" Maria "),
            )
            .await
            .unwrap();
        assert_eq!(matched.recipient_profile_id, Some(first.id));

        let agent_named = repo
            .create(
                &requester,
                &NewOrderInput::new("A", "B", "box").with_recipient("Joana"),
            )
            .await
            .unwrap();
        assert_eq!(agent_named.recipient_profile_id, None);

        assert_eq!(repo.list_by_recipient(first.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_reported() {
        let repo = repository();
        profile(&repo, "same", Role::Agent, "Gil").await;
        let err = repo
            .register_profile(
                &ActorId::new("same"),
                &NewProfileInput::new(Role::Agent, "Gil"),
            )
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::DuplicateProfile);
    }

    #[tokio::test]
    async fn apply_transition_reports_conflict_with_current_status() {
        let repo = repository();
        let requester = profile(&repo, "r", Role::Requester, "Acme").await;
        let order = repo
            .create(&requester, &NewOrderInput::new("A", "B", "box"))
            .await
            .unwrap();
        let agent = ProfileId::generate();

        repo.apply_transition(order.id, OrderStatus::Pending, OrderMutation::accept(agent))
            .await
            .unwrap();
        let err = repo
            .apply_transition(order.id, OrderStatus::Pending, OrderMutation::accept(agent))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::Conflict {
                order_id: order.id,
                current: OrderStatus::Accepted
            }
        );
    }

    #[tokio::test]
    async fn missing_order_is_reported_with_its_id() {
        let repo = repository();
        let id = OrderId::generate();
        let err = repo
            .apply_transition(id, OrderStatus::Pending, OrderMutation::accept(ProfileId::generate()))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::order_not_found(id));
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[tokio::test]
    async fn apply_transition_rejects_illegal_edges_up_front() {
        let repo = repository();
        let err = repo
            .apply_transition(
                OrderId::generate(),
                OrderStatus::Delivered,
                OrderMutation::deliver(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    }
}
