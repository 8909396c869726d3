//! Host runtime drivers.
//!
//! Each driver wires the gate and comms into one agent runtime. Runtimes with
//! a pre-action hook get the gate as that hook; the rest fall back to polling.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod claude;
pub mod codex;
pub mod driver;

pub use driver::{Capabilities, Driver, GatingMode, SessionRecord};

/// Supported host runtimes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Claude,
    Codex,
}

impl DriverKind {
    pub const ALL: [DriverKind; 2] = [DriverKind::Claude, DriverKind::Codex];

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Claude => "claude",
            DriverKind::Codex => "codex",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Driver factory.
pub fn create_driver(kind: DriverKind) -> Arc<dyn Driver> {
    match kind {
        DriverKind::Claude => Arc::new(claude::ClaudeDriver::new()),
        DriverKind::Codex => Arc::new(codex::CodexDriver::new()),
    }
}
