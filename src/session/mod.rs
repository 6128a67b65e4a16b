//! Session identity and the durable session store.

pub mod entry;
pub mod key;
pub mod store;

pub use entry::{ChatType, DeliveryRoute, QueuePolicy, SessionEntry, TokenUsage};
pub use key::SessionKey;
pub use store::{SessionMap, SessionStore, StoreNotice};
