//! Message types for the worker/orchestrator comms protocol.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Timestamp part of a message id: `YYYYMMDDTHHMMSSZ`.
const ID_STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Message file extension.
pub const MESSAGE_EXT: &str = "md";

/// Which side of a task a process is acting for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Worker,
    Orchestrator,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Worker, Role::Orchestrator];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Worker => "worker",
            Role::Orchestrator => "orchestrator",
        }
    }

    /// The role on the other end of the task.
    pub fn counterparty(&self) -> Role {
        match self {
            Role::Worker => Role::Orchestrator,
            Role::Orchestrator => Role::Worker,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "worker" => Ok(Role::Worker),
            "orchestrator" => Ok(Role::Orchestrator),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// Message kinds. Which role may send which kind lives in `validator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// Worker is stuck and needs the orchestrator
    Blocker,
    /// Worker status update
    Progress,
    /// Worker asks for a review
    ReviewRequest,
    /// Orchestrator instruction to the worker
    Directive,
    /// Orchestrator advice, non-binding
    Guidance,
    /// Orchestrator tells the worker to halt
    Stop,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Blocker => "blocker",
            MessageType::Progress => "progress",
            MessageType::ReviewRequest => "review-request",
            MessageType::Directive => "directive",
            MessageType::Guidance => "guidance",
            MessageType::Stop => "stop",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "blocker" => Ok(MessageType::Blocker),
            "progress" => Ok(MessageType::Progress),
            "review-request" => Ok(MessageType::ReviewRequest),
            "directive" => Ok(MessageType::Directive),
            "guidance" => Ok(MessageType::Guidance),
            "stop" => Ok(MessageType::Stop),
            _ => Err(format!("Unknown message type: {}", s)),
        }
    }
}

/// Message priority levels.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Message id: creation second plus a per-second counter, e.g. `20260113T041544Z-001`.
///
/// Ordering compares the stamp first and the counter numerically, so ids stay
/// in creation order even once a counter outgrows three digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    stamp: String,
    counter: u32,
}

impl MessageId {
    pub fn new(at: DateTime<Utc>, counter: u32) -> Self {
        Self {
            stamp: stamp_for(at),
            counter,
        }
    }

    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// The creation second encoded in the id.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.stamp, ID_STAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Inbox filename for this id.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self, MESSAGE_EXT)
    }

    /// Parse an inbox filename (`<id>.md`). Temp files and anything else yield `None`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        name.strip_suffix(".md")?.parse().ok()
    }

    /// Parse an archive filename, which may carry a `-N` collision suffix.
    pub fn from_archive_name(name: &str) -> Option<Self> {
        let caps = archive_name_regex()?.captures(name)?;
        caps.get(1)?.as_str().parse().ok()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:03}", self.stamp, self.counter)
    }
}

impl FromStr for MessageId {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let caps = id_regex()
            .and_then(|re| re.captures(s))
            .ok_or_else(|| format!("Invalid message id: {}", s))?;
        let counter = caps[2]
            .parse::<u32>()
            .map_err(|e| format!("Invalid message id counter in {}: {}", s, e))?;
        Ok(Self {
            stamp: caps[1].to_string(),
            counter,
        })
    }
}

/// Render the id stamp for a moment in time.
pub fn stamp_for(at: DateTime<Utc>) -> String {
    at.format(ID_STAMP_FORMAT).to_string()
}

fn id_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{8}T\d{6}Z)-(\d{3,})$").ok())
        .as_ref()
}

fn archive_name_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{8}T\d{6}Z-\d{3,})(?:-\d+)?\.md$").ok())
        .as_ref()
}

/// A message as stored on disk.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(serialize_with = "serialize_display")]
    pub id: MessageId,
    pub from: Role,
    pub to: Role,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub priority: Priority,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Render the on-disk representation: four header lines, a blank line, the body.
    pub fn render(&self) -> String {
        format!(
            "**Type:** {}\n**From:** {}\n**Priority:** {}\n**Time:** {}\n\n{}\n",
            self.msg_type,
            self.from,
            self.priority,
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.body
        )
    }

    /// Parse a message file. `to` is implied by the inbox the file lives in.
    pub fn parse(id: MessageId, to: Role, content: &str, path: &Path) -> Result<Self> {
        let (header, body) = match content.split_once("\n\n") {
            Some((header, body)) => (header, body),
            None => (content.trim_end_matches('\n'), ""),
        };

        let mut msg_type = None;
        let mut from = None;
        let mut priority = None;
        let mut created_at = None;

        for line in header.lines() {
            let Some((key, value)) = parse_header_line(line) else {
                return Err(Error::malformed(path, format!("bad header line '{}'", line)));
            };
            match key {
                "Type" => {
                    msg_type = Some(
                        value
                            .parse::<MessageType>()
                            .map_err(|e| Error::malformed(path, e))?,
                    )
                }
                "From" => from = Some(value.parse::<Role>().map_err(|e| Error::malformed(path, e))?),
                "Priority" => {
                    priority = Some(value.parse::<Priority>().map_err(|e| Error::malformed(path, e))?)
                }
                "Time" => {
                    let parsed = DateTime::parse_from_rfc3339(value)
                        .map_err(|e| Error::malformed(path, format!("bad time '{}': {}", value, e)))?;
                    created_at = Some(parsed.with_timezone(&Utc));
                }
                other => {
                    tracing::debug!(path = %path.display(), header = other, "Ignoring unknown header");
                }
            }
        }

        let msg_type = msg_type.ok_or_else(|| Error::malformed(path, "missing Type header"))?;
        let from = from.ok_or_else(|| Error::malformed(path, "missing From header"))?;
        let created_at = created_at.ok_or_else(|| Error::malformed(path, "missing Time header"))?;
        let body = body.strip_suffix('\n').unwrap_or(body).to_string();

        Ok(Self {
            id,
            from,
            to,
            msg_type,
            priority: priority.unwrap_or_default(),
            body,
            created_at,
        })
    }
}

fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim().strip_prefix("**")?;
    let (key, value) = rest.split_once(":**")?;
    Some((key.trim(), value.trim()))
}

fn serialize_display<T: fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
