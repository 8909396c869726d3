//! Nancy library root.

pub mod cli;
pub mod comms;
pub mod config;
pub mod drivers;
pub mod error;
pub mod gate;
pub mod logging;
pub mod task;

pub use cli::Commands;
pub use comms::{Consumed, Mailbox, Message, MessageId, MessageType, Priority, Role, Store};
pub use config::{load_settings, load_settings_or_default, Settings};
pub use drivers::{create_driver, Driver, DriverKind};
pub use error::{Error, Result};
pub use gate::{evaluate_hook, gate_check, GateDecision, GatePolicy};
pub use task::Task;
