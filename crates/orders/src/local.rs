use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::store::{EntityStore, StoreError, StoreResult};
use crate::types::{
    ActorId, NewOrderInput, NewProfileInput, Order, OrderId, OrderMutation, OrderQuery,
    OrderStatus, Profile, ProfileId, Role, WriteId,
};

/// Insertion sequence; breaks `created_at` ties so listings stay stable.
type Seq = u64;

#[derive(Default)]
struct StoreState {
    profiles: HashMap<ProfileId, Profile>,
    profile_by_actor: HashMap<ActorId, ProfileId>,
    profile_registration: Vec<ProfileId>,
    orders: HashMap<OrderId, (Seq, Order)>,
    by_status: HashMap<OrderStatus, BTreeSet<(Seq, OrderId)>>,
    by_requester: HashMap<ProfileId, BTreeSet<(Seq, OrderId)>>,
    by_agent: HashMap<ProfileId, BTreeSet<(Seq, OrderId)>>,
    by_recipient: HashMap<ProfileId, BTreeSet<(Seq, OrderId)>>,
    /// Last committed write per order. Not persisted.
    last_write: HashMap<OrderId, WriteId>,
    next_seq: Seq,
}

/// A single committed write, and its own inverse.
#[derive(Clone)]
enum Change {
    InsertProfile(Profile),
    RemoveProfile(ProfileId),
    InsertOrder(Order),
    RemoveOrder(OrderId),
    ReplaceOrder {
        order: Order,
        write: Option<WriteId>,
    },
}

impl StoreState {
    /// Applies `change` and returns the change that undoes it.
    fn apply(&mut self, change: Change) -> Option<Change> {
        match change {
            Change::InsertProfile(profile) => {
                let id = profile.id;
                self.profile_by_actor
                    .insert(profile.actor_id.clone(), profile.id);
                self.profile_registration.push(profile.id);
                self.profiles.insert(profile.id, profile);
                Some(Change::RemoveProfile(id))
            }
            Change::RemoveProfile(id) => {
                let profile = self.profiles.remove(&id)?;
                self.profile_by_actor.remove(&profile.actor_id);
                self.profile_registration.retain(|existing| *existing != id);
                Some(Change::InsertProfile(profile))
            }
            Change::InsertOrder(order) => {
                let id = order.id;
                let seq = self.next_seq;
                self.next_seq += 1;
                self.index(seq, &order);
                self.orders.insert(order.id, (seq, order));
                Some(Change::RemoveOrder(id))
            }
            Change::RemoveOrder(id) => {
                let (seq, order) = self.orders.remove(&id)?;
                self.unindex(seq, &order);
                Some(Change::InsertOrder(order))
            }
            Change::ReplaceOrder { order, write } => {
                let id = order.id;
                let (seq, previous) = self.orders.remove(&id)?;
                self.unindex(seq, &previous);
                self.index(seq, &order);
                self.orders.insert(id, (seq, order));
                let previous_write = match write {
                    Some(write) => self.last_write.insert(id, write),
                    None => self.last_write.remove(&id),
                };
                Some(Change::ReplaceOrder {
                    order: previous,
                    write: previous_write,
                })
            }
        }
    }

    fn index(&mut self, seq: Seq, order: &Order) {
        let key = (seq, order.id);
        self.by_status.entry(order.status).or_default().insert(key);
        self.by_requester
            .entry(order.requester_profile_id)
            .or_default()
            .insert(key);
        if let Some(agent) = order.agent_profile_id {
            self.by_agent.entry(agent).or_default().insert(key);
        }
        if let Some(recipient) = order.recipient_profile_id {
            self.by_recipient.entry(recipient).or_default().insert(key);
        }
    }

    fn unindex(&mut self, seq: Seq, order: &Order) {
        let key = (seq, order.id);
        if let Some(set) = self.by_status.get_mut(&order.status) {
            set.remove(&key);
        }
        if let Some(set) = self.by_requester.get_mut(&order.requester_profile_id) {
            set.remove(&key);
        }
        if let Some(set) = order.agent_profile_id.and_then(|a| self.by_agent.get_mut(&a)) {
            set.remove(&key);
        }
        if let Some(set) = order
            .recipient_profile_id
            .and_then(|r| self.by_recipient.get_mut(&r))
        {
            set.remove(&key);
        }
    }

    fn select(&self, query: OrderQuery) -> Vec<Order> {
        let index = match query {
            OrderQuery::Status(status) => self.by_status.get(&status),
            OrderQuery::Requester(id) => self.by_requester.get(&id),
            OrderQuery::Agent(id) => self.by_agent.get(&id),
            OrderQuery::Recipient(id) => self.by_recipient.get(&id),
        };

        let mut orders: Vec<(Seq, Order)> = index
            .into_iter()
            .flatten()
            .filter_map(|(_, id)| self.orders.get(id).cloned())
            .collect();

        orders.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| seq_b.cmp(seq_a))
        });
        orders.into_iter().map(|(_, order)| order).collect()
    }

    fn conflict(&self, current: Order) -> StoreError {
        StoreError::Conflict {
            last_write: self.last_write.get(&current.id).copied(),
            current: Box::new(current),
        }
    }

    fn encode_snapshot(&self) -> StoreResult<Vec<u8>> {
        let profiles = self
            .profile_registration
            .iter()
            .filter_map(|id| self.profiles.get(id).cloned())
            .collect();

        let mut orders: Vec<&(Seq, Order)> = self.orders.values().collect();
        orders.sort_by_key(|(seq, _)| *seq);

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            profiles,
            orders: orders.into_iter().map(|(_, order)| order.clone()).collect(),
        };
        serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| StoreError::Corrupt(format!("failed to encode snapshot: {err}")))
    }

    fn from_snapshot(snapshot: Snapshot) -> StoreResult<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut state = StoreState::default();
        for profile in snapshot.profiles {
            if state.profile_by_actor.contains_key(&profile.actor_id) {
                return Err(StoreError::Corrupt(format!(
                    "actor {} has more than one profile",
                    profile.actor_id
                )));
            }
            state.apply(Change::InsertProfile(profile));
        }
        for order in snapshot.orders {
            if !order.is_consistent() {
                return Err(StoreError::Corrupt(format!(
                    "order {} is '{}' but agent presence disagrees",
                    order.id, order.status
                )));
            }
            state.apply(Change::InsertOrder(order));
        }
        Ok(state)
    }
}

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    profiles: Vec<Profile>,
    orders: Vec<Order>,
}

/// In-process entity store with optional JSON snapshot durability.
///
/// The state mutex is only taken inside synchronous sections, which makes
/// every trait method (and in particular `compare_and_set`) atomic. When a
/// snapshot is configured, writes queue on `writer` while the file is written
/// on the blocking pool; a change becomes visible only once it is on disk, so
/// a failed write leaves the state untouched and readers never wait on I/O.
pub struct LocalStore {
    state: Mutex<StoreState>,
    snapshot_path: Option<PathBuf>,
    writer: tokio::sync::Mutex<()>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot_path: None,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Opens a store persisted at `path`, loading the existing snapshot if any.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|err| {
                StoreError::Corrupt(format!("failed to read {}: {err}", path.display()))
            })?;
            let snapshot: Snapshot = serde_json::from_str(&raw).map_err(|err| {
                StoreError::Corrupt(format!("failed to parse {}: {err}", path.display()))
            })?;
            let state = StoreState::from_snapshot(snapshot)?;
            info!(
                path = %path.display(),
                profiles = state.profiles.len(),
                orders = state.orders.len(),
                "loaded store snapshot"
            );
            state
        } else {
            StoreState::default()
        };

        Ok(Self {
            state: Mutex::new(state),
            snapshot_path: Some(path),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("store state poisoned".to_string()))
    }

    /// Runs `prepare` against the current state and commits the change it
    /// returns, durably first when a snapshot is configured.
    async fn commit<T, F>(&self, prepare: F) -> StoreResult<T>
    where
        F: FnOnce(&StoreState) -> StoreResult<(Change, T)> + Send,
        T: Send,
    {
        let Some(path) = self.snapshot_path.as_ref() else {
            let mut state = self.lock()?;
            let (change, output) = prepare(&*state)?;
            state.apply(change);
            return Ok(output);
        };

        let _writer = self.writer.lock().await;
        let (change, output, payload) = {
            let mut state = self.lock()?;
            let (change, output) = prepare(&*state)?;
            let undo = state.apply(change.clone());
            let payload = state.encode_snapshot();
            if let Some(undo) = undo {
                state.apply(undo);
            }
            (change, output, payload?)
        };

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&target, &payload))
            .await
            .map_err(|err| StoreError::Unavailable(format!("snapshot writer failed: {err}")))??;

        self.lock()?.apply(change);
        Ok(output)
    }
}

fn write_atomically(path: &Path, payload: &[u8]) -> StoreResult<()> {
    let unavailable =
        |err: std::io::Error| StoreError::Unavailable(format!("{}: {err}", path.display()));

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(unavailable)?;

    let mut temp = NamedTempFile::new_in(parent).map_err(unavailable)?;
    temp.write_all(payload).map_err(unavailable)?;
    temp.as_file().sync_all().map_err(unavailable)?;
    temp.persist(path).map_err(|err| unavailable(err.error))?;
    Ok(())
}

#[async_trait]
impl EntityStore for LocalStore {
    async fn insert_profile(&self, actor: &ActorId, input: &NewProfileInput) -> StoreResult<Profile> {
        self.commit(|state| {
            if state.profile_by_actor.contains_key(actor) {
                return Err(StoreError::Duplicate("profiles.actor_id"));
            }
            let profile = Profile {
                id: ProfileId::generate(),
                actor_id: actor.clone(),
                role: input.role,
                display_name: input.display_name.trim().to_string(),
                phone: input.phone.clone(),
                created_at: Utc::now(),
            };
            Ok((Change::InsertProfile(profile.clone()), profile))
        })
        .await
    }

    async fn profile_by_actor(&self, actor: &ActorId) -> StoreResult<Option<Profile>> {
        let state = self.lock()?;
        Ok(state
            .profile_by_actor
            .get(actor)
            .and_then(|id| state.profiles.get(id))
            .cloned())
    }

    async fn profiles_named(&self, name: &str, role: Role) -> StoreResult<Vec<Profile>> {
        let state = self.lock()?;
        Ok(state
            .profile_registration
            .iter()
            .filter_map(|id| state.profiles.get(id))
            .filter(|profile| profile.role == role && profile.display_name == name)
            .cloned()
            .collect())
    }

    async fn insert_order(
        &self,
        requester: ProfileId,
        recipient: Option<ProfileId>,
        input: &NewOrderInput,
    ) -> StoreResult<Order> {
        self.commit(|state| {
            if !state.profiles.contains_key(&requester) {
                return Err(StoreError::NotFound {
                    entity: "profile",
                    id: requester.to_string(),
                });
            }
            let now = Utc::now();
            let order = Order {
                id: OrderId::generate(),
                requester_profile_id: requester,
                recipient_profile_id: recipient,
                agent_profile_id: None,
                pickup_address: input.pickup_address.trim().to_string(),
                delivery_address: input.delivery_address.trim().to_string(),
                description: input.description.trim().to_string(),
                status: OrderStatus::Pending,
                created_at: now,
                updated_at: now,
                revision: 1,
            };
            Ok((Change::InsertOrder(order.clone()), order))
        })
        .await
    }

    async fn order(&self, id: OrderId) -> StoreResult<Option<Order>> {
        let state = self.lock()?;
        Ok(state.orders.get(&id).map(|(_, order)| order.clone()))
    }

    async fn query_orders(&self, query: OrderQuery) -> StoreResult<Vec<Order>> {
        let state = self.lock()?;
        Ok(state.select(query))
    }

    async fn compare_and_set(
        &self,
        id: OrderId,
        expected: OrderStatus,
        mutation: &OrderMutation,
    ) -> StoreResult<Order> {
        self.commit(|state| {
            let current = state
                .orders
                .get(&id)
                .map(|(_, order)| order.clone())
                .ok_or_else(|| StoreError::NotFound {
                    entity: "order",
                    id: id.to_string(),
                })?;

            let edge_allowed = current.status == expected
                && expected.can_transition_to(mutation.status)
                && (mutation.agent_profile_id.is_none() || current.agent_profile_id.is_none());
            if !edge_allowed {
                debug!(order_id = %id, current = %current.status, expected = %expected, "conditional write rejected");
                return Err(state.conflict(current));
            }

            let mut updated = current.clone();
            updated.status = mutation.status;
            if let Some(agent) = mutation.agent_profile_id {
                updated.agent_profile_id = Some(agent);
            }
            if !updated.is_consistent() {
                return Err(state.conflict(current));
            }
            updated.updated_at = Utc::now();
            updated.revision += 1;

            let change = Change::ReplaceOrder {
                order: updated.clone(),
                write: Some(mutation.write_id),
            };
            Ok((change, updated))
        })
        .await
    }
}
