//! Directive gate: the pre-action check that makes a role consume its inbox
//! before doing anything else.
//!
//! The gate is stateless and read-only. It never archives, and it never
//! returns an error: when the store cannot be read it allows the action and
//! logs why.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::comms::{Message, MessageId, MessageType, Priority, Role, Store};
use crate::task::Task;

/// Hook event answered by default when the host does not name one.
pub const PRE_TOOL_USE: &str = "PreToolUse";

/// Name of the skill agents use to consume directives.
pub const CHECK_DIRECTIVES_SKILL: &str = "nancy-check-directives";

/// The oldest pending message, carried by a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingDirective {
    #[serde(serialize_with = "serialize_id")]
    pub id: MessageId,
    pub from: Role,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub priority: Priority,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for PendingDirective {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            from: message.from,
            msg_type: message.msg_type,
            priority: message.priority,
            body: message.body,
            created_at: message.created_at,
        }
    }
}

impl PendingDirective {
    /// Denial text shown to the agent: the message itself plus how to clear it.
    pub fn instructions(&self, gate_command: &str, task: &Task, role: Role) -> String {
        format!(
            "BLOCKED: unread {msg_type} from {from} ({priority} priority, id {id}, sent {time}).\n\
             \n\
             {body}\n\
             \n\
             Act on this message, then archive it before any further action:\n\
             \x20 {cmd} consume --task {task} --role {role} {id}\n\
             Run `{cmd} inbox --task {task} --role {role}` to see anything else pending.",
            msg_type = self.msg_type,
            from = self.from,
            priority = self.priority,
            id = self.id,
            time = self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            body = self.body,
            cmd = task.command_prefix(gate_command),
            task = task.name(),
            role = role,
        )
    }
}

/// Gate verdict for one privileged action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny(PendingDirective),
}

impl GateDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

/// Decide whether `role` may act now.
///
/// Denies while anything is pending in the role's inbox, surfacing the oldest
/// message. Store failures resolve to `Allow`.
pub fn gate_check(store: &Store, task: &Task, role: Role) -> GateDecision {
    match store.has_pending(task, role) {
        Ok(false) => return GateDecision::Allow,
        Ok(true) => {}
        Err(e) => {
            tracing::warn!(
                task = task.name(),
                role = %role,
                error = %e,
                "gate_read_failure: store unreadable, allowing action"
            );
            return GateDecision::Allow;
        }
    }

    match store.oldest_pending(task, role) {
        Ok(Some(message)) => {
            tracing::info!(
                task = task.name(),
                role = %role,
                id = %message.id,
                msg_type = %message.msg_type,
                "Denying action until message is consumed"
            );
            GateDecision::Deny(message.into())
        }
        Ok(None) => {
            tracing::warn!(
                task = task.name(),
                role = %role,
                "Inbox has entries but none could be read, allowing action"
            );
            GateDecision::Allow
        }
        Err(e) => {
            tracing::warn!(
                task = task.name(),
                role = %role,
                error = %e,
                "gate_read_failure: could not read pending message, allowing action"
            );
            GateDecision::Allow
        }
    }
}

/// Which host actions bypass the gate.
#[derive(Debug, Clone)]
pub struct GatePolicy {
    /// Binary name of this tool as the agent invokes it.
    pub gate_command: String,
    /// Host tool names that are never gated.
    pub exempt_tools: Vec<String>,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            gate_command: "nancy".to_string(),
            exempt_tools: vec!["TodoWrite".to_string()],
        }
    }
}

/// Pre-action payload the host runtime writes to the hook's stdin.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: serde_json::Value,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl HookRequest {
    pub fn from_json(input: &str) -> serde_json::Result<Self> {
        serde_json::from_str(input)
    }

    /// Actions that consume messages must stay possible while denied.
    pub fn is_exempt(&self, policy: &GatePolicy, task: &Task) -> bool {
        let Some(tool) = self.tool_name.as_deref() else {
            return false;
        };
        if policy.exempt_tools.iter().any(|t| t == tool) {
            return true;
        }

        match tool {
            "Bash" => self
                .input_str("command")
                .is_some_and(|cmd| is_gate_command(cmd, &policy.gate_command)),
            "Read" => self
                .input_str("file_path")
                .is_some_and(|path| self.is_comms_path(Path::new(path), task)),
            "Skill" => ["skill", "command", "name"]
                .iter()
                .filter_map(|key| self.input_str(key))
                .any(|skill| skill == CHECK_DIRECTIVES_SKILL),
            _ => false,
        }
    }

    fn input_str(&self, key: &str) -> Option<&str> {
        self.tool_input.get(key).and_then(|v| v.as_str())
    }

    fn is_comms_path(&self, path: &Path, task: &Task) -> bool {
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return false;
        }
        let absolute = match (path.is_absolute(), self.cwd.as_deref()) {
            (true, _) => path.to_path_buf(),
            (false, Some(cwd)) => cwd.join(path),
            (false, None) => return false,
        };
        absolute.starts_with(task.comms_dir())
    }
}

/// Subcommands that only read or consume messages.
const EXEMPT_SUBCOMMANDS: [&str; 6] = ["inbox", "read", "consume", "archive", "gate", "status"];

/// A lone invocation of one of our consuming subcommands. Anything chained
/// onto it, and every other subcommand, is gated.
fn is_gate_command(command: &str, gate_command: &str) -> bool {
    const CHAINING: [&str; 7] = [";", "&", "|", "`", "$(", "\n", ">"];
    if CHAINING.iter().any(|op| command.contains(op)) {
        return false;
    }

    let mut words = shell_words(command).into_iter();
    let is_ours = words.next().is_some_and(|program| {
        program == gate_command || program.ends_with(&format!("/{}", gate_command))
    });
    if !is_ours {
        return false;
    }

    while let Some(word) = words.next() {
        if word == "--project" {
            words.next();
        } else if word.starts_with("--project=") {
            continue;
        } else {
            return EXEMPT_SUBCOMMANDS.contains(&word.as_str());
        }
    }
    false
}

/// Split on whitespace, keeping single-quoted runs together.
fn shell_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_word = false;
    for c in command.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Structured hook answer written to stdout.
#[derive(Debug, Clone, Serialize)]
pub struct HookResponse {
    #[serde(rename = "hookSpecificOutput")]
    pub hook_specific_output: HookSpecificOutput,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSpecificOutput {
    pub hook_event_name: String,
    pub permission_decision: String,
    pub permission_decision_reason: String,
}

impl HookResponse {
    pub fn deny(event: &str, reason: String) -> Self {
        Self {
            hook_specific_output: HookSpecificOutput {
                hook_event_name: event.to_string(),
                permission_decision: "deny".to_string(),
                permission_decision_reason: reason,
            },
        }
    }
}

/// Answer one pre-action hook call. `None` means allow (print nothing).
pub fn evaluate_hook(
    store: &Store,
    task: &Task,
    role: Role,
    policy: &GatePolicy,
    input: &str,
) -> Option<HookResponse> {
    let request = match HookRequest::from_json(input) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(task = task.name(), error = %e, "Unreadable hook input, allowing action");
            return None;
        }
    };

    if request.is_exempt(policy, task) {
        tracing::debug!(tool = ?request.tool_name, "Exempt action, skipping gate");
        return None;
    }

    match gate_check(store, task, role) {
        GateDecision::Allow => None,
        GateDecision::Deny(pending) => {
            let event = request.hook_event_name.as_deref().unwrap_or(PRE_TOOL_USE);
            Some(HookResponse::deny(
                event,
                pending.instructions(&policy.gate_command, task, role),
            ))
        }
    }
}

fn serialize_id<S: serde::Serializer>(id: &MessageId, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(id)
}
