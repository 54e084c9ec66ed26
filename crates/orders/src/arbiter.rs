use tracing::{debug, info};

use crate::error::{DispatchError, DispatchResult};
use crate::notifier::{ChangeNotifier, OrderEvent};
use crate::repository::OrderRepository;
use crate::types::{Order, OrderId, OrderMutation, OrderStatus, ProfileId};

/// Resolves concurrent claims on a pending order: first committed write wins.
///
/// No lock is taken here. The store's conditional write on
/// `status = pending` is the only serialization point, so any number of
/// arbiters, in any number of processes, can share one store.
#[derive(Clone)]
pub struct ClaimArbiter {
    repository: OrderRepository,
    notifier: ChangeNotifier,
}

impl ClaimArbiter {
    pub fn new(repository: OrderRepository, notifier: ChangeNotifier) -> Self {
        Self {
            repository,
            notifier,
        }
    }

    /// Claims `order_id` for `agent`. Losing a race yields
    /// [`DispatchError::AlreadyClaimed`]; callers must not retry it.
    pub async fn claim(&self, order_id: OrderId, agent: ProfileId) -> DispatchResult<Order> {
        let current = self.repository.get_by_id(order_id).await?;
        if current.status != OrderStatus::Pending {
            debug!(%order_id, status = %current.status, "claim on non-pending order");
            return Err(DispatchError::AlreadyClaimed(order_id));
        }

        let claimed = self
            .repository
            .apply_transition(order_id, OrderStatus::Pending, OrderMutation::accept(agent))
            .await
            .map_err(|err| match err {
                DispatchError::Conflict { .. } => {
                    info!(%order_id, %agent, "claim lost the race");
                    DispatchError::AlreadyClaimed(order_id)
                }
                other => other,
            })?;

        info!(%order_id, %agent, "order claimed");
        self.notifier.publish(OrderEvent::claimed(claimed.clone()));
        Ok(claimed)
    }
}
