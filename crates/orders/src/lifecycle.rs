use tracing::info;

use crate::error::{DispatchError, DispatchResult};
use crate::notifier::{ChangeNotifier, OrderEvent};
use crate::repository::OrderRepository;
use crate::types::{Order, OrderId, OrderMutation, OrderStatus, ProfileId};

/// Applies the agent-driven transitions of the order state machine.
///
/// `pending -> accepted` belongs to [`crate::ClaimArbiter`]; this engine owns
/// `accepted -> delivered`. Ownership is checked before status, so an agent
/// that does not hold the order always gets `NotYourOrder`.
#[derive(Clone)]
pub struct LifecycleEngine {
    repository: OrderRepository,
    notifier: ChangeNotifier,
}

impl LifecycleEngine {
    pub fn new(repository: OrderRepository, notifier: ChangeNotifier) -> Self {
        Self {
            repository,
            notifier,
        }
    }

    pub async fn complete(&self, order_id: OrderId, agent: ProfileId) -> DispatchResult<Order> {
        let current = self.repository.get_by_id(order_id).await?;
        check_completable(&current, agent)?;

        let delivered = match self
            .repository
            .apply_transition(order_id, OrderStatus::Accepted, OrderMutation::deliver())
            .await
        {
            Ok(order) => order,
            Err(DispatchError::Conflict { .. }) => {
                // Someone moved the order between our read and our write.
                let latest = self.repository.get_by_id(order_id).await?;
                check_completable(&latest, agent)?;
                return Err(DispatchError::InvalidTransition {
                    order_id,
                    from: latest.status,
                    to: OrderStatus::Delivered,
                });
            }
            Err(other) => return Err(other),
        };

        info!(%order_id, %agent, "order delivered");
        self.notifier.publish(OrderEvent::completed(delivered.clone()));
        Ok(delivered)
    }
}

fn check_completable(order: &Order, agent: ProfileId) -> DispatchResult<()> {
    if order.agent_profile_id != Some(agent) {
        return Err(DispatchError::NotYourOrder(order.id));
    }
    if !order.status.can_transition_to(OrderStatus::Delivered) {
        return Err(DispatchError::InvalidTransition {
            order_id: order.id,
            from: order.status,
            to: OrderStatus::Delivered,
        });
    }
    Ok(())
}
