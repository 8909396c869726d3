//! Worker/orchestrator comms protocol.
//!
//! This module defines the file-based channel between the two roles of a task:
//! - Roles, message types, priorities and ids
//! - Which role may send which type
//! - The on-disk store (inboxes, archive)
//! - A per-task mailbox facade

pub mod mailbox;
pub mod store;
pub mod types;
pub mod validator;

pub use mailbox::{Consumed, Mailbox};
pub use store::{CommsStats, Store};
pub use types::{Message, MessageId, MessageType, Priority, Role};
pub use validator::{allowed_types, validate};
