use async_trait::async_trait;

use crate::error::DispatchResult;
use crate::repository::OrderRepository;
use crate::types::{ActorId, Profile};

/// Maps an authenticated actor to its profile.
///
/// The service consults it at the start of every operation. The default
/// implementation reads the profiles table through the repository; deployments
/// with an external directory plug their own in.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn resolve_profile(&self, actor: &ActorId) -> DispatchResult<Option<Profile>>;
}

#[async_trait]
impl ProfileDirectory for OrderRepository {
    async fn resolve_profile(&self, actor: &ActorId) -> DispatchResult<Option<Profile>> {
        OrderRepository::resolve_profile(self, actor).await
    }
}
