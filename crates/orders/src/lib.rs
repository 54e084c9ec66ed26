pub mod arbiter;
pub mod config;
pub mod directory;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod local;
pub mod notifier;
pub mod repository;
pub mod service;
pub mod store;
pub mod types;

pub use arbiter::ClaimArbiter;
pub use config::DispatchConfig;
pub use directory::ProfileDirectory;
pub use error::{DispatchError, DispatchResult};
pub use guard::{AccessGuard, Decision, Operation};
pub use lifecycle::LifecycleEngine;
pub use local::LocalStore;
pub use notifier::{ChangeNotifier, Interest, OrderEvent, OrderEventKind, Subscription};
pub use repository::OrderRepository;
pub use service::{DispatchService, WatchRequest};
pub use store::{EntityStore, StoreError};
pub use types::*;
