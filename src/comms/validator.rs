//! Which message kinds each role may originate.

use super::types::{MessageType, Role};
use crate::error::{Error, Result};

const WORKER_TYPES: &[MessageType] = &[
    MessageType::Blocker,
    MessageType::Progress,
    MessageType::ReviewRequest,
];

const ORCHESTRATOR_TYPES: &[MessageType] = &[
    MessageType::Directive,
    MessageType::Guidance,
    MessageType::Stop,
];

/// Message types `role` is permitted to send.
pub fn allowed_types(role: Role) -> &'static [MessageType] {
    match role {
        Role::Worker => WORKER_TYPES,
        Role::Orchestrator => ORCHESTRATOR_TYPES,
    }
}

/// Check a raw type string against the sender's permitted set.
///
/// Unknown strings and known types belonging to the other role are both
/// rejected with `InvalidType`.
pub fn validate(role: Role, msg_type: &str) -> Result<MessageType> {
    let allowed = allowed_types(role);
    match msg_type.parse::<MessageType>() {
        Ok(parsed) if allowed.contains(&parsed) => Ok(parsed),
        _ => Err(Error::InvalidType {
            msg_type: msg_type.to_string(),
            role,
            allowed,
        }),
    }
}
