// ============================================================================
// DataStack Library
// ============================================================================

pub mod context;
pub mod core;
pub mod facade;
pub mod fetch;
pub mod query;
pub mod storage;
pub mod sync;
pub mod update;

// Re-export main types for convenience
pub use crate::core::{
    AttributeKind, EntitySchema, ObjectId, Result, StackError, StoreError, Value,
};
pub use crate::facade::{CommitSubscription, DataStack, StackConfig, StackStats};

// Context chain
pub use crate::context::{GraphChange, MainContext, Object};

// Fetching and queries
pub use crate::fetch::{FetchRequest, ReadCapable};
pub use crate::query::{
    AggregateFunction, AggregateQuery, FetchOptions, Predicate, SelectTarget, SortDescriptor,
};

// Storage
pub use crate::storage::{MountOptions, StoreCoordinator};

// Transactions
pub use crate::update::{
    CommitNotice, OriginId, OriginOptions, OriginOrdering, OriginTarget, TransactionOrigin,
    UpdateContext, UpdateHandle, WriteCapable,
};

// List synchronization
pub use crate::sync::{
    BoundList, BridgeDriver, ChangeBatch, ListBridge, ListEvent, ReconcileKind, ResultSet,
};
