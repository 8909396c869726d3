//! Host runtime driver trait for Nancy.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::DriverKind;
use crate::comms::{Role, Store};
use crate::error::{Error, Result};
use crate::gate::GatePolicy;
use crate::task::{shell_quote, Task};

/// What a host runtime can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub supports_resume: bool,
    pub supports_export: bool,
    pub supports_hooks: bool,
    pub supports_skills: bool,
}

/// How the gate reaches the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatingMode {
    /// The runtime calls the gate before every action.
    Hook,
    /// The agent is told to run the gate itself. Degraded, not an error.
    Polling,
}

/// Persisted per-(task, role) session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub driver: DriverKind,
    pub task: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    /// Runtime session id once known; used to resume.
    pub session_id: Option<String>,
}

/// Adapter over one host agent runtime.
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> DriverKind;

    fn name(&self) -> &str {
        self.kind().as_str()
    }

    fn capabilities(&self) -> Capabilities;

    fn gating_mode(&self) -> GatingMode {
        if self.capabilities().supports_hooks {
            GatingMode::Hook
        } else {
            GatingMode::Polling
        }
    }

    /// Whether the runtime's CLI is installed.
    async fn detect(&self) -> bool;

    /// The runtime's reported version, if it can be run.
    async fn version(&self) -> Option<String>;

    fn session_dir(&self, task: &Task, role: Role) -> PathBuf {
        task.sessions_dir().join(self.name()).join(role.as_str())
    }

    fn session_file(&self, task: &Task, role: Role) -> PathBuf {
        self.session_dir(task, role).join("session.json")
    }

    /// Create the session directory and record. Returns the existing record
    /// if there is one.
    fn init_session(&self, task: &Task, role: Role) -> Result<SessionRecord> {
        let path = self.session_file(task, role);
        if let Some(record) = load_session(&path)? {
            return Ok(record);
        }

        std::fs::create_dir_all(self.session_dir(task, role))?;
        let record = SessionRecord {
            driver: self.kind(),
            task: task.name().to_string(),
            role,
            created_at: Utc::now(),
            session_id: None,
        };
        std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        tracing::debug!("Created session record {}", path.display());
        Ok(record)
    }

    /// Start the agent attached to the terminal, in the role's workspace.
    async fn run_interactive(&self, task: &Task, role: Role, prompt: &str) -> Result<ExitStatus>;

    /// Run one non-interactive prompt and return the agent's output.
    async fn run_prompt(&self, task: &Task, role: Role, prompt: &str) -> Result<String>;

    /// Install hooks, skills and settings into the role's workspace.
    /// Redeploying replaces earlier artifacts. Returns the files written.
    fn deploy(&self, task: &Task, role: Role, policy: &GatePolicy) -> Result<Vec<PathBuf>>;

    /// Undo everything `deploy` did for this role.
    fn cleanup(&self, task: &Task, role: Role) -> Result<()>;

    fn get_inbox_path(&self, store: &Store, task: &Task, role: Role) -> PathBuf {
        store.inbox_dir(task, role)
    }
}

/// Read a session record if one exists.
pub fn load_session(path: &Path) -> Result<Option<SessionRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Command line the host runtime runs as its pre-action hook.
pub fn hook_command(policy: &GatePolicy, task: &Task, role: Role) -> String {
    format!(
        "{} gate --hook --task {} --role {}",
        task.command_prefix(&policy.gate_command),
        shell_quote(task.name()),
        role
    )
}

/// Environment variable the CLI reads as its `--project` default. Set for
/// every agent we spawn.
pub const PROJECT_ENV: &str = "NANCY_PROJECT";

/// Marker identifying hook commands written by `hook_command`.
pub const HOOK_MARKER: &str = " gate --hook ";

/// Whether a CLI can be spawned at all.
pub(crate) async fn cli_available(cli_path: &str) -> bool {
    Command::new(cli_path)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok()
}

/// First line of `<cli> --version`.
pub(crate) async fn cli_version(cli_path: &str) -> Option<String> {
    let output = Command::new(cli_path)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
}

/// Run a prepared command to completion, returning stdout or a driver error.
pub(crate) async fn run_captured(mut cmd: Command) -> Result<String> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd.output().await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Driver(stderr.trim().to_string()))
    }
}

/// The role's workspace, which must exist before an agent runs in it.
pub(crate) fn existing_workspace(task: &Task, role: Role) -> Result<PathBuf> {
    let workspace = task.workspace(role);
    if workspace.is_dir() {
        Ok(workspace)
    } else {
        Err(Error::Driver(format!(
            "workspace {} does not exist",
            workspace.display()
        )))
    }
}

/// Remove a directory only if it is empty.
pub(crate) fn remove_dir_if_empty(dir: &Path) {
    if std::fs::remove_dir(dir).is_ok() {
        tracing::debug!("Removed empty directory {}", dir.display());
    }
}
