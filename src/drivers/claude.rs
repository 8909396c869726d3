//! Claude CLI driver. Hook-capable: the gate is installed as the runtime's
//! `PreToolUse` hook.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use super::driver::{
    cli_available, cli_version, existing_workspace, hook_command, load_session,
    remove_dir_if_empty, run_captured, Capabilities, Driver, HOOK_MARKER, PROJECT_ENV,
};
use super::DriverKind;
use crate::comms::Role;
use crate::error::{Error, Result};
use crate::gate::{GatePolicy, CHECK_DIRECTIVES_SKILL, PRE_TOOL_USE};
use crate::task::Task;

const CLAUDE_DIR: &str = ".claude";
const SETTINGS_FILE: &str = "settings.local.json";
const SKILLS_DIR: &str = "skills";

/// Left in the skill dir when deploy created the settings file, so cleanup
/// only deletes settings it owns.
const CREATED_SETTINGS_MARKER: &str = ".created-settings";

pub struct ClaudeDriver {
    cli_path: String,
}

impl ClaudeDriver {
    pub fn new() -> Self {
        Self {
            cli_path: "claude".to_string(),
        }
    }

    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    fn claude_dir(&self, task: &Task, role: Role) -> PathBuf {
        task.workspace(role).join(CLAUDE_DIR)
    }

    fn settings_path(&self, task: &Task, role: Role) -> PathBuf {
        self.claude_dir(task, role).join(SETTINGS_FILE)
    }

    fn skill_dir(&self, task: &Task, role: Role) -> PathBuf {
        self.claude_dir(task, role)
            .join(SKILLS_DIR)
            .join(CHECK_DIRECTIVES_SKILL)
    }

    fn resume_id(&self, task: &Task, role: Role) -> Result<Option<String>> {
        Ok(load_session(&self.session_file(task, role))?.and_then(|record| record.session_id))
    }
}

impl Default for ClaudeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for ClaudeDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Claude
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_resume: true,
            supports_export: true,
            supports_hooks: true,
            supports_skills: true,
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
        if let Some(session_id) = self.resume_id(task, role)? {
            cmd.arg("--resume").arg(session_id);
        }
        if !prompt.is_empty() {
            cmd.arg(prompt);
        }
        cmd.current_dir(workspace)
            .env(PROJECT_ENV, task.project_root())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        tracing::info!(task = task.name(), role = %role, "Starting interactive claude session");
        Ok(cmd.status().await?)
    }

    async fn run_prompt(&self, task: &Task, role: Role, prompt: &str) -> Result<String> {
        let workspace = existing_workspace(task, role)?;
        let mut cmd = Command::new(&self.cli_path);
        if let Some(session_id) = self.resume_id(task, role)? {
            cmd.arg("--resume").arg(session_id);
        }
        cmd.arg("-p")
            .arg(prompt)
            .current_dir(workspace)
            .env(PROJECT_ENV, task.project_root());
        run_captured(cmd).await
    }

    fn deploy(&self, task: &Task, role: Role, policy: &GatePolicy) -> Result<Vec<PathBuf>> {
        let settings_path = self.settings_path(task, role);
        let skill_dir = self.skill_dir(task, role);
        fs::create_dir_all(&skill_dir)?;

        let mut settings = match read_settings(&settings_path)? {
            Some(settings) => settings,
            None => {
                fs::write(skill_dir.join(CREATED_SETTINGS_MARKER), "")?;
                json!({})
            }
        };
        install_hook(&mut settings, &hook_command(policy, task, role), &settings_path)?;
        fs::write(&settings_path, serde_json::to_string_pretty(&settings)?)?;

        let skill_path = skill_dir.join("SKILL.md");
        fs::write(&skill_path, skill_markdown(policy, task, role))?;

        tracing::info!(
            task = task.name(),
            role = %role,
            settings = %settings_path.display(),
            "Deployed claude gate hook and skill"
        );
        Ok(vec![settings_path, skill_path])
    }

    fn cleanup(&self, task: &Task, role: Role) -> Result<()> {
        let settings_path = self.settings_path(task, role);
        let skill_dir = self.skill_dir(task, role);
        let created_settings = skill_dir.join(CREATED_SETTINGS_MARKER).exists();
        if let Some(mut settings) = read_settings(&settings_path)? {
            if remove_hook(&mut settings, &settings_path)? && created_settings {
                fs::remove_file(&settings_path)?;
                tracing::debug!("Removed {}", settings_path.display());
            } else {
                fs::write(&settings_path, serde_json::to_string_pretty(&settings)?)?;
            }
        }

        if skill_dir.exists() {
            fs::remove_dir_all(&skill_dir)?;
        }

        let claude_dir = self.claude_dir(task, role);
        remove_dir_if_empty(&claude_dir.join(SKILLS_DIR));
        remove_dir_if_empty(&claude_dir);

        tracing::info!(task = task.name(), role = %role, "Cleaned up claude gate hook and skill");
        Ok(())
    }
}

fn read_settings(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Some(json!({})));
    }
    Ok(Some(serde_json::from_str(&content)?))
}

fn object_at<'a>(value: &'a mut Value, path: &Path) -> Result<&'a mut Map<String, Value>> {
    value.as_object_mut().ok_or_else(|| {
        Error::Driver(format!("{} has an unexpected shape", path.display()))
    })
}

fn is_our_hook(hook: &Value) -> bool {
    hook.get("command")
        .and_then(|c| c.as_str())
        .is_some_and(|c| c.contains(HOOK_MARKER))
}

/// Drop our hook commands, and any matcher entry left empty by that.
fn strip_our_hooks(entries: &mut Vec<Value>) {
    entries.retain_mut(|entry| {
        let Some(hooks) = entry.get_mut("hooks").and_then(|h| h.as_array_mut()) else {
            return true;
        };
        let before = hooks.len();
        hooks.retain(|hook| !is_our_hook(hook));
        hooks.len() == before || !hooks.is_empty()
    });
}

fn install_hook(settings: &mut Value, command: &str, path: &Path) -> Result<()> {
    let root = object_at(settings, path)?;
    let hooks = root.entry("hooks").or_insert_with(|| json!({}));
    let hooks = object_at(hooks, path)?;
    let entries = hooks
        .entry(PRE_TOOL_USE)
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| Error::Driver(format!("{} has an unexpected shape", path.display())))?;

    strip_our_hooks(entries);
    entries.push(json!({
        "matcher": "*",
        "hooks": [{ "type": "command", "command": command }],
    }));
    Ok(())
}

/// Remove our hook. Returns true when nothing else is left in the file.
fn remove_hook(settings: &mut Value, path: &Path) -> Result<bool> {
    let root = object_at(settings, path)?;
    let mut hooks_empty = false;
    if let Some(hooks) = root.get_mut("hooks").and_then(|h| h.as_object_mut()) {
        let mut entries_empty = false;
        if let Some(entries) = hooks.get_mut(PRE_TOOL_USE).and_then(|e| e.as_array_mut()) {
            strip_our_hooks(entries);
            entries_empty = entries.is_empty();
        }
        if entries_empty {
            hooks.remove(PRE_TOOL_USE);
        }
        hooks_empty = hooks.is_empty();
    }
    if hooks_empty {
        root.remove("hooks");
    }
    Ok(root.is_empty())
}

fn skill_markdown(policy: &GatePolicy, task: &Task, role: Role) -> String {
    let cmd = task.command_prefix(&policy.gate_command);
    let task = task.name();
    format!(
        "---\n\
         name: {skill}\n\
         description: Read and consume pending {counterparty} messages for task {task} before continuing.\n\
         ---\n\
         \n\
         # Check directives\n\
         \n\
         You are the {role} for task `{task}`. Every action is blocked while your inbox has unread messages.\n\
         \n\
         1. List pending messages: `{cmd} inbox --task {task} --role {role}`\n\
         2. Take the oldest one and act on it.\n\
         3. Consume it: `{cmd} consume --task {task} --role {role} <id>`\n\
         4. Repeat until `{cmd} gate --task {task} --role {role}` reports the inbox is clear.\n\
         \n\
         To reply, use `{cmd} msg --task {task} --from {role} --type <type> \"<text>\"`.\n",
        skill = CHECK_DIRECTIVES_SKILL,
        counterparty = role.counterparty(),
    )
}
