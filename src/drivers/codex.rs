//! Codex CLI driver. No pre-action hook, so the agent is instructed through
//! `AGENTS.md` to poll the gate itself.

use std::fs;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use super::driver::{
    cli_available, cli_version, existing_workspace, run_captured, Capabilities, Driver,
    PROJECT_ENV,
};
use super::DriverKind;
use crate::comms::Role;
use crate::error::Result;
use crate::gate::GatePolicy;
use crate::task::Task;

const AGENTS_FILE: &str = "AGENTS.md";
const BLOCK_BEGIN: &str = "<!-- nancy:begin -->";
const BLOCK_END: &str = "<!-- nancy:end -->";

pub struct CodexDriver {
    cli_path: String,
}

impl CodexDriver {
    pub fn new() -> Self {
        Self {
            cli_path: "codex".to_string(),
        }
    }

    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    fn agents_path(&self, task: &Task, role: Role) -> PathBuf {
        task.workspace(role).join(AGENTS_FILE)
    }
}

impl Default for CodexDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for CodexDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Codex
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_resume: true,
            supports_export: false,
            supports_hooks: false,
            supports_skills: false,
        }
    }

    async fn detect(&self) -> bool {
        cli_available(&self.cli_path).await
    }

    async fn version(&self) -> Option<String> {
        cli_version(&self.cli_path).await
    }

    async fn run_interactive(&self, task: &Task, role: Role, prompt: &str) -> Result<ExitStatus> {
        let workspace = existing_workspace(task, role)?;
        let mut cmd = Command::new(&self.cli_path);
        if !prompt.is_empty() {
            cmd.arg(prompt);
        }
        cmd.current_dir(workspace)
            .env(PROJECT_ENV, task.project_root())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        tracing::info!(task = task.name(), role = %role, "Starting interactive codex session");
        Ok(cmd.status().await?)
    }

    async fn run_prompt(&self, task: &Task, role: Role, prompt: &str) -> Result<String> {
        let workspace = existing_workspace(task, role)?;
        let mut cmd = Command::new(&self.cli_path);
        cmd.arg("exec")
            .arg("--skip-git-repo-check")
            .arg(prompt)
            .current_dir(workspace)
            .env(PROJECT_ENV, task.project_root());
        run_captured(cmd).await
    }

    fn deploy(&self, task: &Task, role: Role, policy: &GatePolicy) -> Result<Vec<PathBuf>> {
        let path = self.agents_path(task, role);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let existing = if path.exists() {
            fs::read_to_string(&path)?
        } else {
            String::new()
        };

        let mut content = strip_block(&existing);
        if !content.is_empty() {
            content.push_str("\n\n");
        }
        content.push_str(&managed_block(policy, task, role));
        fs::write(&path, content)?;

        tracing::info!(
            task = task.name(),
            role = %role,
            path = %path.display(),
            "Deployed codex polling instructions"
        );
        Ok(vec![path])
    }

    fn cleanup(&self, task: &Task, role: Role) -> Result<()> {
        let path = self.agents_path(task, role);
        if !path.exists() {
            return Ok(());
        }
        let remaining = strip_block(&fs::read_to_string(&path)?);
        if remaining.is_empty() {
            fs::remove_file(&path)?;
        } else {
            fs::write(&path, format!("{}\n", remaining))?;
        }
        tracing::info!(task = task.name(), role = %role, "Cleaned up codex polling instructions");
        Ok(())
    }
}

/// Text outside our managed block, trimmed.
fn strip_block(content: &str) -> String {
    let Some(start) = content.find(BLOCK_BEGIN) else {
        return content.trim().to_string();
    };
    let end = content[start..]
        .find(BLOCK_END)
        .map(|offset| start + offset + BLOCK_END.len())
        .unwrap_or(content.len());

    let before = content[..start].trim_end();
    let after = content[end..].trim_start();
    match (before.is_empty(), after.is_empty()) {
        (true, _) => after.trim_end().to_string(),
        (false, true) => before.trim_start().to_string(),
        (false, false) => format!("{}\n\n{}", before.trim_start(), after.trim_end()),
    }
}

fn managed_block(policy: &GatePolicy, task: &Task, role: Role) -> String {
    let cmd = task.command_prefix(&policy.gate_command);
    let task = task.name();
    format!(
        "{BLOCK_BEGIN}\n\
         ## Nancy directives\n\
         \n\
         You are the {role} for task `{task}`. Before every action, run:\n\
         \n\
         ```\n\
         {cmd} gate --task {task} --role {role}\n\
         ```\n\
         \n\
         If it reports a pending message, stop. Read it with \
         `{cmd} inbox --task {task} --role {role}`, act on it, then run \
         `{cmd} consume --task {task} --role {role} <id>` before doing anything else.\n\
         {BLOCK_END}\n"
    )
}
