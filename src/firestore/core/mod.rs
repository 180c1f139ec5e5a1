//! Queries, views and the client façade that drives them.

pub mod async_queue;
pub mod event_manager;
pub mod filter;
pub mod firestore_client;
pub mod query;
pub mod target;
pub mod target_id_generator;
pub mod user;
pub mod view;
pub mod view_snapshot;

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use event_manager::{EventManager, ListenOptions, QueryListener};
pub use filter::{CompositeFilter, CompositeOperator, FieldFilter, Filter, Operator};
pub use firestore_client::FirestoreClient;
pub use query::{LimitType, Query};
pub use target::{Bound, Direction, OrderBy, Target};
pub use target_id_generator::TargetIdGenerator;
pub use user::User;
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentSet, DocumentViewChange, SyncState, ViewSnapshot};
