//! CLI commands for Nancy using clap.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::comms::{Consumed, Mailbox, Message, MessageId, Priority, Role};
use crate::config::{get_settings_path, load_settings_or_default, Settings};
use crate::drivers::{create_driver, Driver, DriverKind, GatingMode};
use crate::gate::{evaluate_hook, gate_check, GateDecision};
use crate::task::Task;

/// Nancy - directive gating and comms between a worker and an orchestrator agent.
#[derive(Parser)]
#[command(name = "nancy")]
#[command(version)]
#[command(about = "Nancy - keep agents listening to their orchestrator", long_about = None)]
pub struct Commands {
    /// Project root holding the .nancy directory
    #[arg(long, global = true, default_value = ".", env = "NANCY_PROJECT")]
    pub project: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Which task and whose side of it.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Task name
    #[arg(long)]
    pub task: String,

    /// Role whose inbox to use
    #[arg(long, value_enum)]
    pub role: Role,
}

#[derive(Args, Debug, Clone)]
pub struct DriverTarget {
    #[command(flatten)]
    pub target: Target,

    /// Host runtime; defaults to the configured driver
    #[arg(long, value_enum)]
    pub driver: Option<DriverKind>,

    /// Worker workspace, if not <task>/worktree
    #[arg(long)]
    pub worktree: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the comms tree for a task
    Init {
        /// Task name
        #[arg(long)]
        task: String,
    },

    /// Send a message to the other role
    Msg {
        /// Task name
        #[arg(long)]
        task: String,

        /// Sending role
        #[arg(long, value_enum)]
        from: Role,

        /// Receiving role; defaults to the other role
        #[arg(long, value_enum)]
        to: Option<Role>,

        /// Message type, e.g. blocker, progress, directive
        #[arg(long = "type")]
        msg_type: String,

        /// Message priority
        #[arg(long, value_enum, default_value_t = Priority::Normal)]
        priority: Priority,

        /// Message body
        #[arg(required = true)]
        body: Vec<String>,
    },

    /// List pending messages, oldest first
    Inbox {
        #[command(flatten)]
        target: Target,

        /// Print full message bodies
        #[arg(long)]
        full: bool,
    },

    /// Print one pending message
    Read {
        #[command(flatten)]
        target: Target,

        /// Message id
        id: String,
    },

    /// Move a pending message to the archive
    Archive {
        #[command(flatten)]
        target: Target,

        /// Message id
        id: String,
    },

    /// Print a pending message and archive it
    Consume {
        #[command(flatten)]
        target: Target,

        /// Message id; defaults to the oldest pending message
        id: Option<String>,
    },

    /// Check whether the role may act
    Gate {
        #[command(flatten)]
        target: Target,

        /// Read a host hook request on stdin and answer on stdout
        #[arg(long)]
        hook: bool,
    },

    /// Show pending and archived counts
    Status {
        /// Task name
        #[arg(long)]
        task: String,
    },

    /// Install the gate into a role's workspace
    Deploy(DriverTarget),

    /// Remove what deploy installed
    Cleanup(DriverTarget),

    /// Start an interactive agent session in the role's workspace
    Start {
        #[command(flatten)]
        target: DriverTarget,

        /// Initial prompt
        #[arg(long, default_value = "")]
        prompt: String,
    },

    /// Run one non-interactive prompt in the role's workspace
    Prompt {
        #[command(flatten)]
        target: DriverTarget,

        /// Prompt text
        #[arg(required = true)]
        prompt: Vec<String>,
    },

    /// List host runtimes and whether they are installed
    Drivers,
}

impl Commands {
    pub async fn run(&self) -> Result<ExitCode> {
        let project = resolve_project(&self.project)?;

        match &self.command {
            Command::Init { task } => cmd_init(&project, task).await?,
            Command::Msg {
                task,
                from,
                to,
                msg_type,
                priority,
                body,
            } => cmd_msg(&project, task, *from, *to, msg_type, *priority, &body.join(" ")).await?,
            Command::Inbox { target, full } => cmd_inbox(&project, target, *full).await?,
            Command::Read { target, id } => cmd_read(&project, target, id).await?,
            Command::Archive { target, id } => cmd_archive(&project, target, id).await?,
            Command::Consume { target, id } => cmd_consume(&project, target, id.as_deref()).await?,
            Command::Gate { target, hook } => return cmd_gate(&project, target, *hook).await,
            Command::Status { task } => cmd_status(&project, task).await?,
            Command::Deploy(target) => cmd_deploy(&project, target).await?,
            Command::Cleanup(target) => cmd_cleanup(&project, target).await?,
            Command::Start { target, prompt } => return cmd_start(&project, target, prompt).await,
            Command::Prompt { target, prompt } => {
                cmd_prompt(&project, target, &prompt.join(" ")).await?
            }
            Command::Drivers => cmd_drivers().await?,
        }

        Ok(ExitCode::SUCCESS)
    }
}

/// Absolute project root, so hook commands and path checks agree.
fn resolve_project(project: &Path) -> Result<PathBuf> {
    project
        .canonicalize()
        .with_context(|| format!("Project directory {} not found", project.display()))
}

fn mailbox(project: &Path, settings: &Settings, task: &str) -> Result<Mailbox> {
    let task = Task::new(project, task)?;
    Ok(Mailbox::new(settings.store(), task))
}

fn parse_id(id: &str) -> Result<MessageId> {
    id.parse::<MessageId>().map_err(|e| anyhow::anyhow!(e))
}

fn print_message(message: &Message) {
    println!("Id:       {}", message.id);
    println!("Type:     {}", message.msg_type);
    println!("From:     {}", message.from);
    println!("Priority: {}", message.priority);
    println!(
        "Time:     {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();
    println!("{}", message.body);
}

fn preview(body: &str) -> String {
    let line = body.lines().next().unwrap_or("");
    if line.chars().count() > 72 {
        format!("{}...", line.chars().take(72).collect::<String>())
    } else {
        line.to_string()
    }
}

async fn cmd_init(project: &Path, task: &str) -> Result<()> {
    let settings = load_settings_or_default(project)?;
    let mailbox = Mailbox::open(settings.store(), Task::new(project, task)?)?;
    println!(
        "Initialized comms for task {} at {}",
        task,
        mailbox.task().comms_dir().display()
    );
    if !get_settings_path(project).exists() {
        println!("Using default settings (no {})", get_settings_path(project).display());
    }
    Ok(())
}

async fn cmd_msg(
    project: &Path,
    task: &str,
    from: Role,
    to: Option<Role>,
    msg_type: &str,
    priority: Priority,
    body: &str,
) -> Result<()> {
    let settings = load_settings_or_default(project)?;
    let mailbox = mailbox(project, &settings, task)?;
    let to = to.unwrap_or_else(|| from.counterparty());

    let id = mailbox.send_with_priority(from, to, msg_type, priority, body)?;
    println!("Sent {} {} -> {}: {}", msg_type, from, to, id);
    Ok(())
}

async fn cmd_inbox(project: &Path, target: &Target, full: bool) -> Result<()> {
    let settings = load_settings_or_default(project)?;
    let mailbox = mailbox(project, &settings, &target.task)?;
    let messages = mailbox.messages(target.role)?;

    if messages.is_empty() {
        println!("No pending messages for {}", target.role);
        return Ok(());
    }

    println!("Pending for {} ({}):", target.role, messages.len());
    for message in &messages {
        if full {
            println!();
            print_message(message);
        } else {
            println!(
                "  {}  [{}] {} from {}: {}",
                message.id,
                message.priority,
                message.msg_type,
                message.from,
                preview(&message.body)
            );
        }
    }
    Ok(())
}

async fn cmd_read(project: &Path, target: &Target, id: &str) -> Result<()> {
    let settings = load_settings_or_default(project)?;
    let mailbox = mailbox(project, &settings, &target.task)?;
    let message = mailbox.read(target.role, &parse_id(id)?)?;
    print_message(&message);
    Ok(())
}

async fn cmd_archive(project: &Path, target: &Target, id: &str) -> Result<()> {
    let settings = load_settings_or_default(project)?;
    let mailbox = mailbox(project, &settings, &target.task)?;
    let id = parse_id(id)?;
    mailbox.archive(target.role, &id)?;
    println!("Archived {}", id);
    Ok(())
}

async fn cmd_consume(project: &Path, target: &Target, id: Option<&str>) -> Result<()> {
    let settings = load_settings_or_default(project)?;
    let mailbox = mailbox(project, &settings, &target.task)?;

    let id = match id {
        Some(id) => parse_id(id)?,
        None => match mailbox.next_pending(target.role)? {
            Some(message) => message.id,
            None => {
                println!("No pending messages for {}", target.role);
                return Ok(());
            }
        },
    };

    match mailbox.consume(target.role, &id)? {
        Consumed::Archived(message) => {
            print_message(&message);
            println!();
            println!("Archived {}", message.id);
        }
        Consumed::AlreadyArchived(id) => println!("{} was already archived", id),
    }
    Ok(())
}

async fn cmd_gate(project: &Path, target: &Target, hook: bool) -> Result<ExitCode> {
    let settings = load_settings_or_default(project)?;
    let store = settings.store();
    let task = Task::new(project, &target.task)?;

    if hook {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("Failed to read hook input")?;

        if let Some(response) =
            evaluate_hook(&store, &task, target.role, &settings.gate_policy(), &input)
        {
            println!("{}", serde_json::to_string(&response)?);
        }
        return Ok(ExitCode::SUCCESS);
    }

    match gate_check(&store, &task, target.role) {
        GateDecision::Allow => {
            println!("allow: no pending messages for {}", target.role);
            Ok(ExitCode::SUCCESS)
        }
        GateDecision::Deny(pending) => {
            println!(
                "{}",
                pending.instructions(&settings.gate_command, &task, target.role)
            );
            Ok(ExitCode::from(2))
        }
    }
}

async fn cmd_status(project: &Path, task: &str) -> Result<()> {
    let settings = load_settings_or_default(project)?;
    let mailbox = mailbox(project, &settings, task)?;
    println!("{}", mailbox.stats()?);

    for role in Role::ALL {
        if let Some(message) = mailbox.next_pending(role)? {
            println!(
                "\nNext for {}: {} {} from {}",
                role, message.id, message.msg_type, message.from
            );
        }
    }

    println!("\nDriver: {}", settings.driver);
    Ok(())
}

struct Resolved {
    settings: Settings,
    task: Task,
    driver: std::sync::Arc<dyn Driver>,
}

fn resolve(project: &Path, target: &DriverTarget) -> Result<Resolved> {
    let settings = load_settings_or_default(project)?;
    let mut task = Task::new(project, &target.target.task)?;
    if let Some(worktree) = &target.worktree {
        task = task.with_worktree(worktree);
    }
    let driver = create_driver(target.driver.unwrap_or(settings.driver));
    Ok(Resolved {
        settings,
        task,
        driver,
    })
}

async fn cmd_deploy(project: &Path, target: &DriverTarget) -> Result<()> {
    let Resolved {
        settings,
        task,
        driver,
    } = resolve(project, target)?;
    let role = target.target.role;

    Mailbox::open(settings.store(), task.clone())?;
    std::fs::create_dir_all(task.workspace(role))?;
    driver.init_session(&task, role)?;

    let written = driver.deploy(&task, role, &settings.gate_policy())?;
    println!("Deployed {} gate for {} on task {}:", driver.name(), role, task.name());
    for path in written {
        println!("  {}", path.display());
    }
    println!(
        "Inbox: {}",
        driver
            .get_inbox_path(&settings.store(), &task, role)
            .display()
    );
    if driver.gating_mode() == GatingMode::Polling {
        println!(
            "Note: {} has no pre-action hook; the agent is instructed to run the gate itself.",
            driver.name()
        );
    }
    Ok(())
}

async fn cmd_cleanup(project: &Path, target: &DriverTarget) -> Result<()> {
    let Resolved { task, driver, .. } = resolve(project, target)?;
    driver.cleanup(&task, target.target.role)?;
    println!(
        "Removed {} gate for {} on task {}",
        driver.name(),
        target.target.role,
        task.name()
    );
    Ok(())
}

async fn cmd_start(project: &Path, target: &DriverTarget, prompt: &str) -> Result<ExitCode> {
    let Resolved { task, driver, .. } = resolve(project, target)?;
    let role = target.target.role;

    driver.init_session(&task, role)?;
    let status = driver.run_interactive(&task, role, prompt).await?;
    if status.success() {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::warn!(driver = driver.name(), %status, "Agent session exited with failure");
        Ok(ExitCode::FAILURE)
    }
}

async fn cmd_prompt(project: &Path, target: &DriverTarget, prompt: &str) -> Result<()> {
    let Resolved { task, driver, .. } = resolve(project, target)?;
    let role = target.target.role;

    driver.init_session(&task, role)?;
    let output = driver.run_prompt(&task, role, prompt).await?;
    println!("{}", output);
    Ok(())
}

async fn cmd_drivers() -> Result<()> {
    println!("Host runtimes:");
    for kind in DriverKind::ALL {
        let driver = create_driver(kind);
        let installed = if driver.detect().await {
            driver
                .version()
                .await
                .unwrap_or_else(|| "installed".to_string())
        } else {
            "not installed".to_string()
        };
        let mode = match driver.gating_mode() {
            GatingMode::Hook => "hook",
            GatingMode::Polling => "polling",
        };
        println!("  {:<8} {:<8} {}", kind, mode, installed);
    }
    Ok(())
}
