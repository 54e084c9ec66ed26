use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::arbiter::ClaimArbiter;
use crate::config::DispatchConfig;
use crate::directory::ProfileDirectory;
use crate::error::{DispatchError, DispatchResult};
use crate::guard::{AccessGuard, Operation};
use crate::lifecycle::LifecycleEngine;
use crate::local::LocalStore;
use crate::notifier::{ChangeNotifier, Interest, OrderEvent, Subscription};
use crate::repository::OrderRepository;
use crate::store::EntityStore;
use crate::types::{
    ActorId, NewOrderInput, NewProfileInput, Order, OrderId, Profile, Role,
};

/// What a caller wants to watch. Resolved against the caller's profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchRequest {
    PendingPool,
    Mine,
    Order(OrderId),
}

/// Entry point for every order operation.
///
/// Each call names the acting identity explicitly; nothing is read from
/// ambient state. The flow is always: resolve profile, authorize, then hand
/// over to the repository, arbiter or lifecycle engine, publishing committed
/// mutations to the notifier.
#[derive(Clone)]
pub struct DispatchService {
    repository: OrderRepository,
    directory: Arc<dyn ProfileDirectory>,
    arbiter: ClaimArbiter,
    engine: LifecycleEngine,
    notifier: ChangeNotifier,
}

impl DispatchService {
    pub fn new(store: Arc<dyn EntityStore>, config: &DispatchConfig) -> Self {
        let repository = OrderRepository::new(store, config.retry.clone());
        let notifier = ChangeNotifier::new(config.notifier.channel_capacity);
        Self {
            directory: Arc::new(repository.clone()),
            arbiter: ClaimArbiter::new(repository.clone(), notifier.clone()),
            engine: LifecycleEngine::new(repository.clone(), notifier.clone()),
            repository,
            notifier,
        }
    }

    /// Builds a service over a [`LocalStore`], persisted when the config names
    /// a snapshot path.
    pub fn from_config(config: &DispatchConfig) -> Result<Self> {
        let store = match config.store.snapshot_path.as_ref() {
            Some(path) => {
                let store = LocalStore::open(path)
                    .with_context(|| format!("Failed to open store at {}", path.display()))?;
                info!("Using persisted local store at {}", path.display());
                store
            }
            None => {
                info!("Using in-memory local store");
                LocalStore::new()
            }
        };
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn with_directory(mut self, directory: Arc<dyn ProfileDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn repository(&self) -> &OrderRepository {
        &self.repository
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    async fn profile_for(&self, actor: &ActorId) -> DispatchResult<Profile> {
        self.directory
            .resolve_profile(actor)
            .await?
            .ok_or(DispatchError::ProfileRequired)
    }

    async fn authorized(&self, actor: &ActorId, operation: Operation) -> DispatchResult<Profile> {
        let profile = self.profile_for(actor).await?;
        AccessGuard::ensure(profile.role, operation)?;
        Ok(profile)
    }

    pub async fn register_profile(
        &self,
        actor: &ActorId,
        input: NewProfileInput,
    ) -> DispatchResult<Profile> {
        self.repository.register_profile(actor, &input).await
    }

    /// Confirms the actor's stored role matches the role it claims to sign in
    /// with.
    pub async fn sign_in(&self, actor: &ActorId, declared: Role) -> DispatchResult<Profile> {
        let profile = self.profile_for(actor).await?;
        if profile.role != declared {
            return Err(DispatchError::RoleMismatch {
                declared,
                actual: profile.role,
            });
        }
        debug!(profile_id = %profile.id, role = %profile.role, "actor signed in");
        Ok(profile)
    }

    pub async fn create_order(&self, actor: &ActorId, input: NewOrderInput) -> DispatchResult<Order> {
        let requester = self.authorized(actor, Operation::Create).await?;
        let order = self.repository.create(&requester, &input).await?;
        self.notifier.publish(OrderEvent::created(order.clone()));
        Ok(order)
    }

    pub async fn list_pending(&self, actor: &ActorId) -> DispatchResult<Vec<Order>> {
        self.authorized(actor, Operation::ListPending).await?;
        self.repository.list_pending().await
    }

    /// Requesters see what they created, agents what they hold, recipients
    /// what is addressed to them.
    pub async fn list_own(&self, actor: &ActorId) -> DispatchResult<Vec<Order>> {
        let profile = self.authorized(actor, Operation::ListOwn).await?;
        match profile.role {
            Role::Requester => self.repository.list_by_requester(profile.id).await,
            Role::Agent => self.repository.list_by_agent(profile.id).await,
            Role::Recipient => self.repository.list_by_recipient(profile.id).await,
        }
    }

    pub async fn get_order(&self, actor: &ActorId, order_id: OrderId) -> DispatchResult<Order> {
        let (_, order) = self.readable_order(actor, order_id).await?;
        Ok(order)
    }

    async fn readable_order(
        &self,
        actor: &ActorId,
        order_id: OrderId,
    ) -> DispatchResult<(Profile, Order)> {
        let profile = self.authorized(actor, Operation::ListOwn).await?;
        let order = self.repository.get_by_id(order_id).await?;
        if !order.readable_by(profile.id, profile.role) {
            return Err(DispatchError::denied(profile.role, "read this order"));
        }
        Ok((profile, order))
    }

    pub async fn claim(&self, actor: &ActorId, order_id: OrderId) -> DispatchResult<Order> {
        let agent = self.authorized(actor, Operation::Claim).await?;
        self.arbiter.claim(order_id, agent.id).await
    }

    pub async fn complete(&self, actor: &ActorId, order_id: OrderId) -> DispatchResult<Order> {
        let agent = self.authorized(actor, Operation::Complete).await?;
        self.engine.complete(order_id, agent.id).await
    }

    /// Registers a subscription. Callers should list right after subscribing
    /// so that no commit falls between their read and their first event.
    pub async fn watch(&self, actor: &ActorId, request: WatchRequest) -> DispatchResult<Subscription> {
        let interest = match request {
            WatchRequest::PendingPool => {
                self.authorized(actor, Operation::ListPending).await?;
                Interest::PendingPool
            }
            WatchRequest::Mine => {
                let profile = self.authorized(actor, Operation::ListOwn).await?;
                Interest::Involving(profile.id)
            }
            WatchRequest::Order(order_id) => {
                let (reader, _) = self.readable_order(actor, order_id).await?;
                Interest::Order {
                    order_id,
                    reader: reader.id,
                    role: reader.role,
                }
            }
        };
        Ok(self.notifier.subscribe(interest))
    }
}
