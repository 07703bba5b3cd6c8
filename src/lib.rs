//! # docsync
//!
//! A reactive subscription, caching and mutation-dispatch layer over a
//! remote document store.
//!
//! ## Core Concepts
//!
//! - **Store handle**: The installed connection to the remote store, possibly
//!   absent until the application has finished connecting
//! - **Query identity**: Structurally equal queries share one identity, so a
//!   rebuilt descriptor never reopens a listener
//! - **Subscriptions**: One live channel per identity, shared by all
//!   consumers and closed when the last one detaches
//! - **Mutations**: Writes are queued and return immediately; failures go to
//!   the error surface, successes arrive as fresh snapshots
//!
//! ## Example
//!
//! ```ignore
//! use docsync::{MemoryStore, QueryDescriptor, StoreHandle, SyncConfig, SyncContext};
//!
//! let store = MemoryStore::new();
//! let ctx = SyncContext::headless(SyncConfig::default(), Some(StoreHandle::new(store)))?;
//!
//! // Watch a collection
//! let products = ctx.observe(QueryDescriptor::collection("products"));
//! println!("{:?}", products.result());
//!
//! // Write without waiting
//! ctx.dispatch_create("products", &json!({"name": "Shirt", "price": 999}));
//! ```

pub mod context;
pub mod error;
pub mod memory;
pub mod models;
pub mod mutations;
pub mod query;
pub mod store;
pub mod subscriptions;
pub mod surface;
pub mod types;

// Re-exports
pub use context::{Observer, SyncConfig, SyncContext};
pub use error::{Result, SyncError};
pub use memory::{MemoryStore, MemoryStoreStats};
pub use mutations::{DispatchConfig, DispatchStats, MutationDispatcher};
pub use query::{identity_of, QueryDescriptor, QueryIdentityMemoizer, QueryKey};
pub use store::{OnError, OnSnapshot, RemoteStore, StoreHandle, StoreId, StoreSlot, Unsubscribe};
pub use subscriptions::{
    Attachment, ConsumerId, ManagerStats, QueryResult, SubscriptionConfig, SubscriptionId,
    SubscriptionManager, SubscriptionState,
};
pub use surface::{ErrorSurface, Failure, Notice, NoticeLevel, RecordingSurface, TracingSurface};
pub use types::*;
