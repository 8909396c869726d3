//! Task context threaded through every comms, gate and driver call.

use std::path::{Path, PathBuf};

use crate::comms::Role;
use crate::error::{Error, Result};

/// Project-local state directory.
pub const STATE_DIR: &str = ".nancy";

/// Directory under the state dir holding one directory per task.
pub const TASKS_DIR: &str = "tasks";

/// A unit of orchestrated work and the directories it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    name: String,
    project_root: PathBuf,
    root: PathBuf,
    worktree: PathBuf,
}

impl Task {
    /// Resolve a task under `<project>/.nancy/tasks/<name>`.
    pub fn new(project_root: impl AsRef<Path>, name: &str) -> Result<Self> {
        validate_name(name)?;
        let project_root = project_root.as_ref().to_path_buf();
        let root = project_root.join(STATE_DIR).join(TASKS_DIR).join(name);
        Ok(Self {
            name: name.to_string(),
            project_root,
            worktree: root.join("worktree"),
            root,
        })
    }

    /// Use a worker workspace other than `<task>/worktree`.
    pub fn with_worktree(mut self, worktree: impl Into<PathBuf>) -> Self {
        self.worktree = worktree.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn comms_dir(&self) -> PathBuf {
        self.root.join("comms")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// `<program> --project <root>`: the start of every command an agent is
    /// told to run. Agents run from their own workspace, so the project root
    /// must be explicit.
    pub fn command_prefix(&self, program: &str) -> String {
        format!(
            "{} --project {}",
            program,
            shell_quote(&self.project_root.to_string_lossy())
        )
    }

    /// Directory the given role's agent runs in.
    pub fn workspace(&self, role: Role) -> PathBuf {
        match role {
            Role::Worker => self.worktree.clone(),
            Role::Orchestrator => self.root.join("orchestrator"),
        }
    }
}

/// Quote a value for a POSIX shell, leaving plain words alone.
pub(crate) fn shell_quote(value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@%+=".contains(c));
    if plain && !value.is_empty() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidTask("task name is empty".to_string()));
    }
    if trimmed != name
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains("..")
    {
        return Err(Error::InvalidTask(format!(
            "'{}' is not a valid task name",
            name
        )));
    }
    Ok(())
}
