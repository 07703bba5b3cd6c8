//! Live, deduplicated query subscriptions.
//!
//! This module turns query identities into live channels on the store:
//! - One upstream channel per distinct [`QueryKey`](crate::query::QueryKey)
//! - Fan-out of every snapshot to all attached consumers, in store order
//! - Cached latest state, so late consumers see data immediately
//! - Reference counting, closing the channel after the last detach
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::new(SubscriptionConfig::default(), surface);
//!
//! let key = identity_of(&QueryDescriptor::collection("products"), &store)?;
//! let attachment = manager.attach(key, &store);
//!
//! loop {
//!     match attachment.recv_timeout(Duration::from_secs(1)) {
//!         Ok(result) if result.is_loading => println!("loading..."),
//!         Ok(result) => println!("{:?}", result.data),
//!         Err(_) => break,
//!     }
//! }
//! // Dropping the attachment closes the channel if it was the last one.
//! ```

mod cache;
mod manager;
mod types;

pub use manager::{Attachment, SubscriptionManager};
pub use types::{
    ConsumerId, ManagerStats, QueryResult, SubscriptionConfig, SubscriptionId, SubscriptionState,
};
