//! Message store boundary.
//!
//! The durable log itself is an external collaborator reached through
//! [`MessageStore`]; the index of messages still owed to subscriptions
//! ([`TopicIndex`]) is owned by the broker.

pub mod in_memory;
pub mod index;
pub mod r#trait;

pub use in_memory::InMemoryMessageStore;
pub use index::TopicIndex;
pub use r#trait::{MessageStore, StoreError};
