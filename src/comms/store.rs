//! Filesystem-backed message store.
//!
//! Layout per task:
//! - comms/worker/inbox/        : messages awaiting the worker
//! - comms/orchestrator/inbox/  : messages awaiting the orchestrator
//! - comms/<role>/outbox/       : reserved
//! - comms/archive/             : consumed messages, original filenames
//! - comms/.ids/                : one empty marker per claimed id
//!
//! Every message file has a single writer. Sends become visible through one
//! rename of a fully synced temp file; archives go through a no-clobber hard
//! link followed by removal of the inbox entry, so a message is never absent
//! from both places at once.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{stamp_for, Message, MessageId, Priority, Role};
use super::validator;
use crate::error::{Error, Result};
use crate::task::Task;

/// Comms directory names
pub const INBOX_DIR: &str = "inbox";
pub const OUTBOX_DIR: &str = "outbox";
pub const ARCHIVE_DIR: &str = "archive";
pub const IDS_DIR: &str = ".ids";

/// Suffix of in-flight message files.
const TEMP_SUFFIX: &str = ".tmp";

/// How long an id claim marker is kept. Only claims for the current second
/// matter for uniqueness; the margin covers senders with a lagging clock.
const ID_MARKER_RETENTION_SECS: i64 = 60;

/// Default age after which an abandoned temp file is swept.
pub const DEFAULT_PARTIAL_TTL: Duration = Duration::from_secs(300);

/// Message store operations. Holds no per-task state: every call goes to disk.
#[derive(Debug, Clone)]
pub struct Store {
    partial_ttl: Duration,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            partial_ttl: DEFAULT_PARTIAL_TTL,
        }
    }

    /// Set how old a leftover temp file must be before `init` removes it.
    pub fn with_partial_ttl(mut self, ttl: Duration) -> Self {
        self.partial_ttl = ttl;
        self
    }

    pub fn inbox_dir(&self, task: &Task, role: Role) -> PathBuf {
        task.comms_dir().join(role.as_str()).join(INBOX_DIR)
    }

    pub fn outbox_dir(&self, task: &Task, role: Role) -> PathBuf {
        task.comms_dir().join(role.as_str()).join(OUTBOX_DIR)
    }

    pub fn archive_dir(&self, task: &Task) -> PathBuf {
        task.comms_dir().join(ARCHIVE_DIR)
    }

    fn ids_dir(&self, task: &Task) -> PathBuf {
        task.comms_dir().join(IDS_DIR)
    }

    /// Create the comms tree for both roles. Safe to call repeatedly.
    pub fn init(&self, task: &Task) -> Result<()> {
        let mut dirs = vec![self.archive_dir(task), self.ids_dir(task)];
        for role in Role::ALL {
            dirs.push(self.inbox_dir(task, role));
            dirs.push(self.outbox_dir(task, role));
        }
        for dir in dirs {
            if !dir.is_dir() {
                fs::create_dir_all(&dir)?;
                tracing::debug!("Created comms directory: {}", dir.display());
            }
        }

        let swept = self.sweep_partials(task)?;
        if swept > 0 {
            tracing::warn!(task = task.name(), swept, "Removed abandoned partial messages");
        }
        Ok(())
    }

    /// Send a normal-priority message.
    pub fn send(
        &self,
        task: &Task,
        from: Role,
        to: Role,
        msg_type: &str,
        body: &str,
    ) -> Result<MessageId> {
        self.send_with_priority(task, from, to, msg_type, Priority::Normal, body)
    }

    pub fn send_with_priority(
        &self,
        task: &Task,
        from: Role,
        to: Role,
        msg_type: &str,
        priority: Priority,
        body: &str,
    ) -> Result<MessageId> {
        self.send_at(task, from, to, msg_type, priority, body, Utc::now())
    }

    /// Send with an explicit creation time. Validation happens before any write.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn send_at(
        &self,
        task: &Task,
        from: Role,
        to: Role,
        msg_type: &str,
        priority: Priority,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<MessageId> {
        let msg_type = validator::validate(from, msg_type)?;
        if from == to {
            return Err(Error::InvalidRecipient(format!(
                "{} cannot send to its own inbox",
                from
            )));
        }

        let inbox = self.inbox_dir(task, to);
        ensure_ready(&inbox)?;
        ensure_ready(&self.ids_dir(task))?;

        let id = self.claim_id(task, now)?;
        let message = Message {
            id: id.clone(),
            from,
            to,
            msg_type,
            priority,
            body: body.to_string(),
            created_at: now,
        };

        let final_path = inbox.join(id.file_name());
        let temp_path = inbox.join(format!(".{}{}", id.file_name(), TEMP_SUFFIX));
        if let Err(e) = write_synced(&temp_path, message.render().as_bytes()) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        fs::rename(&temp_path, &final_path)?;

        tracing::info!(
            task = task.name(),
            id = %id,
            from = %from,
            to = %to,
            msg_type = %msg_type,
            "Message sent"
        );
        Ok(id)
    }

    /// Claim the next free id for this second, task-wide.
    ///
    /// The counter starts past the highest claim already on disk for the same
    /// second; losing a race to another process just moves on to the next one.
    fn claim_id(&self, task: &Task, now: DateTime<Utc>) -> Result<MessageId> {
        let dir = self.ids_dir(task);
        let stamp = stamp_for(now);

        let mut counter = 1;
        let mut pruned = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<MessageId>().ok())
            else {
                continue;
            };
            if id.stamp() == stamp {
                if id.counter() >= counter {
                    counter = id.counter() + 1;
                }
            } else if id
                .timestamp()
                .is_some_and(|claimed| (now - claimed).num_seconds() > ID_MARKER_RETENTION_SECS)
            {
                match fs::remove_file(entry.path()) {
                    Ok(()) => pruned += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if pruned > 0 {
            tracing::debug!(task = task.name(), pruned, "Pruned expired id claims");
        }

        loop {
            let id = MessageId::new(now, counter);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(dir.join(id.to_string()))
            {
                Ok(_) => return Ok(id),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::debug!(id = %id, "Id already claimed, retrying");
                    counter += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pending message ids for `role`, oldest first.
    pub fn list_inbox(&self, task: &Task, role: Role) -> Result<Vec<MessageId>> {
        Ok(self
            .inbox(task, role)?
            .into_iter()
            .map(|message| message.id)
            .collect())
    }

    /// Pending messages for `role`, oldest first. Unparsable files are skipped.
    pub fn inbox(&self, task: &Task, role: Role) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for id in self.pending_ids(task, role)? {
            if let Some(message) = self.read_listed(task, role, &id)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Oldest parsable pending message. Only reads files up to the first one
    /// that parses.
    pub fn oldest_pending(&self, task: &Task, role: Role) -> Result<Option<Message>> {
        for id in self.pending_ids(task, role)? {
            if let Some(message) = self.read_listed(task, role, &id)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Sorted ids of every message file in the inbox, without reading them.
    fn pending_ids(&self, task: &Task, role: Role) -> Result<Vec<MessageId>> {
        let dir = self.inbox_dir(task, role);
        ensure_ready(&dir)?;

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(MessageId::from_file_name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Read a listed id, skipping files that vanished or do not parse.
    fn read_listed(&self, task: &Task, role: Role, id: &MessageId) -> Result<Option<Message>> {
        match self.read(task, role, id) {
            Ok(message) => Ok(Some(message)),
            // Archived between read_dir and the read.
            Err(Error::NotFound(_)) => Ok(None),
            Err(e @ Error::MalformedMessage { .. }) => {
                tracing::warn!(task = task.name(), role = %role, error = %e, "Skipping malformed message");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether `role` has anything pending. Reads directory entries only, and
    /// stops at the first message filename.
    pub fn has_pending(&self, task: &Task, role: Role) -> Result<bool> {
        let dir = self.inbox_dir(task, role);
        ensure_ready(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .and_then(MessageId::from_file_name)
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Read one pending message.
    pub fn read(&self, task: &Task, role: Role, id: &MessageId) -> Result<Message> {
        let path = self.inbox_dir(task, role).join(id.file_name());
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_pending(id, role)),
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(Error::malformed(&path, "not valid UTF-8"))
            }
            Err(e) => return Err(e.into()),
        };
        Message::parse(id.clone(), role, &content, &path)
    }

    /// Move a pending message into the archive. Returns the archived path.
    ///
    /// Archiving an id that is not pending (including one already archived)
    /// fails with `NotFound` and changes nothing.
    pub fn archive(&self, task: &Task, role: Role, id: &MessageId) -> Result<PathBuf> {
        let inbox = self.inbox_dir(task, role);
        let archive = self.archive_dir(task);
        ensure_ready(&inbox)?;
        ensure_ready(&archive)?;

        let src = inbox.join(id.file_name());
        if !src.is_file() {
            return Err(not_pending(id, role));
        }

        let dest = match place_in_archive(&src, &archive, id) {
            Ok(Placement::Linked(dest)) => dest,
            Ok(Placement::Moved(dest)) => {
                tracing::info!(task = task.name(), role = %role, id = %id, "Message archived");
                return Ok(dest);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_pending(id, role)),
            Err(e) => return Err(e.into()),
        };

        match fs::remove_file(&src) {
            Ok(()) => {
                tracing::info!(task = task.name(), role = %role, id = %id, "Message archived");
                Ok(dest)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // A concurrent archive of the same id got there first.
                let _ = fs::remove_file(&dest);
                Err(not_pending(id, role))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `id` has been archived.
    pub fn is_archived(&self, task: &Task, id: &MessageId) -> Result<bool> {
        let dir = self.archive_dir(task);
        ensure_ready(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .and_then(MessageId::from_archive_name)
                .is_some_and(|archived| &archived == id)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Counts of pending and archived messages.
    pub fn stats(&self, task: &Task) -> Result<CommsStats> {
        let archive_dir = self.archive_dir(task);
        ensure_ready(&archive_dir)?;

        Ok(CommsStats {
            task: task.name().to_string(),
            worker_pending: count_messages(&self.inbox_dir(task, Role::Worker))?,
            orchestrator_pending: count_messages(&self.inbox_dir(task, Role::Orchestrator))?,
            archived: fs::read_dir(&archive_dir)?
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .and_then(MessageId::from_archive_name)
                        .is_some()
                })
                .count(),
        })
    }

    /// Remove temp files left behind by senders that died mid-write.
    pub fn sweep_partials(&self, task: &Task) -> Result<usize> {
        let mut removed = 0;
        for role in Role::ALL {
            let dir = self.inbox_dir(task, role);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !(name.starts_with('.') && name.ends_with(TEMP_SUFFIX)) {
                    continue;
                }

                let age = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .unwrap_or_default();
                if age < self.partial_ttl {
                    continue;
                }

                match fs::remove_file(entry.path()) {
                    Ok(()) => {
                        tracing::debug!("Removed partial message: {}", entry.path().display());
                        removed += 1;
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }
}

/// Pending/archived counts for one task.
#[derive(Debug, Clone, Serialize)]
pub struct CommsStats {
    pub task: String,
    pub worker_pending: usize,
    pub orchestrator_pending: usize,
    pub archived: usize,
}

impl std::fmt::Display for CommsStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Comms for {}:", self.task)?;
        writeln!(f, "  Worker inbox:       {}", self.worker_pending)?;
        writeln!(f, "  Orchestrator inbox: {}", self.orchestrator_pending)?;
        write!(f, "  Archived:           {}", self.archived)
    }
}

enum Placement {
    /// Hard link created; the inbox entry still has to be removed.
    Linked(PathBuf),
    /// Renamed directly (filesystems without hard links).
    Moved(PathBuf),
}

/// Put `src` into the archive under its own name, or `<id>-N.md` if taken.
fn place_in_archive(src: &Path, archive: &Path, id: &MessageId) -> std::io::Result<Placement> {
    let mut suffix = 0u32;
    loop {
        let name = if suffix == 0 {
            id.file_name()
        } else {
            format!("{}-{}.md", id, suffix)
        };
        let dest = archive.join(name);

        match fs::hard_link(src, &dest) {
            Ok(()) => return Ok(Placement::Linked(dest)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "Hard link unavailable, falling back to rename");
                if dest.exists() {
                    suffix += 1;
                    continue;
                }
                fs::rename(src, &dest)?;
                return Ok(Placement::Moved(dest));
            }
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn count_messages(dir: &Path) -> Result<usize> {
    ensure_ready(dir)?;
    Ok(fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(MessageId::from_file_name)
                .is_some()
        })
        .count())
}

fn ensure_ready(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(Error::StoreUnavailable(format!(
            "{} does not exist; run init for this task first",
            dir.display()
        )))
    }
}

fn not_pending(id: &MessageId, role: Role) -> Error {
    Error::NotFound(format!("message {} is not pending for {}", id, role))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::comms::types::MessageType;
    use crate::comms::validator::allowed_types;

    fn setup() -> (TempDir, Store, Task) {
        let temp_dir = tempfile::tempdir().unwrap();
        let task = Task::new(temp_dir.path(), "t1").unwrap();
        let store = Store::new();
        store.init(&task).unwrap();
        (temp_dir, store, task)
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 13, 4, 15, 44).unwrap()
    }

    fn tree(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.extend(tree(&path));
            }
            out.push(path);
        }
        out.sort();
        out
    }

    fn file_count(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_init_is_idempotent() {
        let (_tmp, store, task) = setup();
        let before = tree(&task.comms_dir());
        store.init(&task).unwrap();
        store.init(&task).unwrap();
        assert_eq!(tree(&task.comms_dir()), before);

        for role in Role::ALL {
            assert!(store.inbox_dir(&task, role).is_dir());
            assert!(store.outbox_dir(&task, role).is_dir());
        }
        assert!(store.archive_dir(&task).is_dir());
    }

    #[test]
    fn test_every_valid_pair_lands_in_exactly_one_inbox() {
        let (_tmp, store, task) = setup();
        for from in Role::ALL {
            for msg_type in allowed_types(from) {
                let id = store
                    .send(&task, from, from.counterparty(), msg_type.as_str(), "hello")
                    .unwrap();
                assert!(store
                    .list_inbox(&task, from.counterparty())
                    .unwrap()
                    .contains(&id));
                assert!(!store.list_inbox(&task, from).unwrap().contains(&id));
            }
        }
        assert_eq!(store.list_inbox(&task, Role::Worker).unwrap().len(), 3);
        assert_eq!(store.list_inbox(&task, Role::Orchestrator).unwrap().len(), 3);
    }

    #[test]
    fn test_invalid_type_mutates_nothing() {
        let (_tmp, store, task) = setup();
        let before = tree(&task.comms_dir());

        let err = store
            .send(&task, Role::Worker, Role::Orchestrator, "urgent-ping", "x")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidType { .. }));

        let err = store
            .send(&task, Role::Worker, Role::Orchestrator, "directive", "x")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidType { .. }));

        assert_eq!(file_count(&store.inbox_dir(&task, Role::Orchestrator)), 0);
        assert_eq!(tree(&task.comms_dir()), before);
    }

    #[test]
    fn test_self_addressed_send_rejected() {
        let (_tmp, store, task) = setup();
        let err = store
            .send(&task, Role::Worker, Role::Worker, "progress", "x")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRecipient(_)));
        assert_eq!(file_count(&store.inbox_dir(&task, Role::Worker)), 0);
    }

    #[test]
    fn test_scenario_blocker_round_trip() {
        let (_tmp, store, task) = setup();
        let id = store
            .send_at(
                &task,
                Role::Worker,
                Role::Orchestrator,
                "blocker",
                Priority::Normal,
                "missing creds",
                fixed_time(),
            )
            .unwrap();
        assert_eq!(id.to_string(), "20260113T041544Z-001");
        assert_eq!(store.list_inbox(&task, Role::Orchestrator).unwrap(), vec![id.clone()]);

        let message = store.read(&task, Role::Orchestrator, &id).unwrap();
        assert_eq!(message.msg_type, MessageType::Blocker);
        assert_eq!(message.from, Role::Worker);
        assert_eq!(message.body, "missing creds");

        let archived = store.archive(&task, Role::Orchestrator, &id).unwrap();
        assert_eq!(
            archived.file_name().unwrap().to_str().unwrap(),
            "20260113T041544Z-001.md"
        );
        assert!(store.list_inbox(&task, Role::Orchestrator).unwrap().is_empty());
        assert!(store.is_archived(&task, &id).unwrap());
    }

    #[test]
    fn test_second_archive_is_not_found_and_harmless() {
        let (_tmp, store, task) = setup();
        let id = store
            .send(&task, Role::Orchestrator, Role::Worker, "directive", "rebase")
            .unwrap();
        store.archive(&task, Role::Worker, &id).unwrap();
        let before = tree(&task.comms_dir());

        let err = store.archive(&task, Role::Worker, &id).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(tree(&task.comms_dir()), before);
        assert!(!store.list_inbox(&task, Role::Worker).unwrap().contains(&id));
    }

    #[test]
    fn test_archive_wrong_inbox_is_not_found() {
        let (_tmp, store, task) = setup();
        let id = store
            .send(&task, Role::Worker, Role::Orchestrator, "progress", "50%")
            .unwrap();
        let err = store.archive(&task, Role::Worker, &id).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(store.has_pending(&task, Role::Orchestrator).unwrap());
    }

    #[test]
    fn test_same_second_ids_increment() {
        let (_tmp, store, task) = setup();
        let send = |from: Role, msg_type: &str| {
            store
                .send_at(
                    &task,
                    from,
                    from.counterparty(),
                    msg_type,
                    Priority::Normal,
                    "x",
                    fixed_time(),
                )
                .unwrap()
                .to_string()
        };
        assert_eq!(send(Role::Worker, "progress"), "20260113T041544Z-001");
        assert_eq!(send(Role::Orchestrator, "guidance"), "20260113T041544Z-002");
        assert_eq!(send(Role::Worker, "blocker"), "20260113T041544Z-003");
    }

    #[test]
    fn test_ids_stay_unique_after_archive() {
        let (_tmp, store, task) = setup();
        let send = || {
            store
                .send_at(
                    &task,
                    Role::Worker,
                    Role::Orchestrator,
                    "progress",
                    Priority::Normal,
                    "x",
                    fixed_time(),
                )
                .unwrap()
        };
        let first = send();
        store.archive(&task, Role::Orchestrator, &first).unwrap();
        let second = send();
        assert_ne!(first, second);
        assert_eq!(second.counter(), 2);
    }

    #[test]
    fn test_concurrent_sends_within_one_second_are_distinct() {
        let (_tmp, store, task) = setup();
        let store = Arc::new(store);
        let task = Arc::new(task);

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let store = Arc::clone(&store);
                let task = Arc::clone(&task);
                std::thread::spawn(move || {
                    store
                        .send_at(
                            &task,
                            Role::Worker,
                            Role::Orchestrator,
                            "progress",
                            Priority::Normal,
                            &format!("update {}", i),
                            fixed_time(),
                        )
                        .unwrap()
                })
            })
            .collect();

        let ids: HashSet<MessageId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 50);

        let listed = store.list_inbox(&task, Role::Orchestrator).unwrap();
        assert_eq!(listed.len(), 50);
        assert!(listed.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(listed.iter().cloned().collect::<HashSet<_>>(), ids);
    }

    #[test]
    fn test_expired_id_claims_are_pruned() {
        let (_tmp, store, task) = setup();
        let ids_dir = task.comms_dir().join(IDS_DIR);
        let stale = MessageId::new(fixed_time() - chrono::Duration::minutes(10), 1);
        let recent = MessageId::new(fixed_time() - chrono::Duration::seconds(30), 4);
        fs::write(ids_dir.join(stale.to_string()), "").unwrap();
        fs::write(ids_dir.join(recent.to_string()), "").unwrap();

        let send = || {
            store
                .send_at(
                    &task,
                    Role::Worker,
                    Role::Orchestrator,
                    "progress",
                    Priority::Normal,
                    "tick",
                    fixed_time(),
                )
                .unwrap()
        };
        let first = send();
        let second = send();
        assert_eq!(first.counter(), 1);
        assert_eq!(second.counter(), 2);

        assert!(!ids_dir.join(stale.to_string()).exists());
        assert!(ids_dir.join(recent.to_string()).exists());
        assert!(ids_dir.join(first.to_string()).exists());
        assert!(ids_dir.join(second.to_string()).exists());
        assert_eq!(file_count(&ids_dir), 3);
    }

    #[test]
    fn test_concurrent_archives_of_one_id() {
        let (_tmp, store, task) = setup();
        let id = store
            .send(&task, Role::Orchestrator, Role::Worker, "stop", "halt")
            .unwrap();
        let store = Arc::new(store);
        let task = Arc::new(task);
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let task = Arc::clone(&task);
                let barrier = Arc::clone(&barrier);
                let id = id.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.archive(&task, Role::Worker, &id)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(Error::NotFound(_)))));

        // Losers remove their own links, whichever name they got.
        assert_eq!(file_count(&store.archive_dir(&task)), 1);
        assert_eq!(file_count(&store.inbox_dir(&task, Role::Worker)), 0);
        assert!(store.is_archived(&task, &id).unwrap());
    }

    #[test]
    fn test_listing_is_ordered_by_id() {
        let (_tmp, store, task) = setup();
        let later = store
            .send_at(
                &task,
                Role::Orchestrator,
                Role::Worker,
                "stop",
                Priority::High,
                "halt",
                fixed_time() + chrono::Duration::seconds(5),
            )
            .unwrap();
        let earlier = store
            .send_at(
                &task,
                Role::Orchestrator,
                Role::Worker,
                "guidance",
                Priority::Low,
                "fyi",
                fixed_time(),
            )
            .unwrap();
        assert_eq!(store.list_inbox(&task, Role::Worker).unwrap(), vec![earlier, later]);
    }

    #[test]
    fn test_partial_files_are_invisible() {
        let (_tmp, store, task) = setup();
        let inbox = store.inbox_dir(&task, Role::Worker);
        fs::write(
            inbox.join(".20260113T041544Z-001.md.tmp"),
            "**Type:** directive\n**Fr",
        )
        .unwrap();

        assert!(!store.has_pending(&task, Role::Worker).unwrap());
        assert!(store.list_inbox(&task, Role::Worker).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_removes_stale_partials() {
        let temp_dir = tempfile::tempdir().unwrap();
        let task = Task::new(temp_dir.path(), "t1").unwrap();
        let store = Store::new().with_partial_ttl(Duration::ZERO);
        store.init(&task).unwrap();

        let partial = store
            .inbox_dir(&task, Role::Orchestrator)
            .join(".20260113T041544Z-001.md.tmp");
        fs::write(&partial, "**Type:** blo").unwrap();

        assert_eq!(store.sweep_partials(&task).unwrap(), 1);
        assert!(!partial.exists());
    }

    #[test]
    fn test_fresh_partials_survive_init() {
        let (_tmp, store, task) = setup();
        let partial = store
            .inbox_dir(&task, Role::Orchestrator)
            .join(".20260113T041544Z-001.md.tmp");
        fs::write(&partial, "**Type:** blo").unwrap();

        store.init(&task).unwrap();
        assert!(partial.exists());
    }

    #[test]
    fn test_malformed_file_skipped_not_fatal() {
        let (_tmp, store, task) = setup();
        let good = store
            .send(&task, Role::Worker, Role::Orchestrator, "blocker", "real")
            .unwrap();
        fs::write(
            store
                .inbox_dir(&task, Role::Orchestrator)
                .join("20000101T000000Z-001.md"),
            "garbage without headers",
        )
        .unwrap();

        assert_eq!(store.list_inbox(&task, Role::Orchestrator).unwrap(), vec![good]);
        assert!(matches!(
            store.read(
                &task,
                Role::Orchestrator,
                &"20000101T000000Z-001".parse().unwrap()
            ),
            Err(Error::MalformedMessage { .. })
        ));
    }

    #[test]
    fn test_oldest_pending_skips_malformed_head() {
        let (_tmp, store, task) = setup();
        assert!(store.oldest_pending(&task, Role::Worker).unwrap().is_none());

        fs::write(
            store.inbox_dir(&task, Role::Worker).join("20000101T000000Z-001.md"),
            "not a message",
        )
        .unwrap();
        let id = store
            .send(&task, Role::Orchestrator, Role::Worker, "guidance", "try X")
            .unwrap();
        store
            .send(&task, Role::Orchestrator, Role::Worker, "directive", "then Y")
            .unwrap();

        let oldest = store.oldest_pending(&task, Role::Worker).unwrap().unwrap();
        assert_eq!(oldest.id, id);
        assert_eq!(oldest.body, "try X");
    }

    #[test]
    fn test_has_pending_tracks_inbox() {
        let (_tmp, store, task) = setup();
        assert!(!store.has_pending(&task, Role::Worker).unwrap());
        let id = store
            .send(&task, Role::Orchestrator, Role::Worker, "directive", "go")
            .unwrap();
        assert!(store.has_pending(&task, Role::Worker).unwrap());
        assert!(!store.has_pending(&task, Role::Orchestrator).unwrap());
        store.archive(&task, Role::Worker, &id).unwrap();
        assert!(!store.has_pending(&task, Role::Worker).unwrap());
    }

    #[test]
    fn test_archive_collision_gets_suffix() {
        let (_tmp, store, task) = setup();
        let id = store
            .send(&task, Role::Orchestrator, Role::Worker, "guidance", "new")
            .unwrap();
        let archive = store.archive_dir(&task);
        fs::write(archive.join(id.file_name()), "older copy").unwrap();
        fs::write(archive.join(format!("{}-1.md", id)), "older copy").unwrap();

        let dest = store.archive(&task, Role::Worker, &id).unwrap();
        assert_eq!(dest, archive.join(format!("{}-2.md", id)));
        assert_eq!(fs::read_to_string(archive.join(id.file_name())).unwrap(), "older copy");
        assert!(fs::read_to_string(&dest).unwrap().contains("new"));
        assert!(store.list_inbox(&task, Role::Worker).unwrap().is_empty());
    }

    #[test]
    fn test_operations_before_init_report_store_unavailable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let task = Task::new(temp_dir.path(), "t1").unwrap();
        let store = Store::new();

        assert!(matches!(
            store.send(&task, Role::Worker, Role::Orchestrator, "blocker", "x"),
            Err(Error::StoreUnavailable(_))
        ));
        assert!(matches!(
            store.has_pending(&task, Role::Worker),
            Err(Error::StoreUnavailable(_))
        ));
        assert!(matches!(
            store.list_inbox(&task, Role::Worker),
            Err(Error::StoreUnavailable(_))
        ));
        assert!(!task.comms_dir().exists());
    }

    #[test]
    fn test_stats() {
        let (_tmp, store, task) = setup();
        let id = store
            .send(&task, Role::Worker, Role::Orchestrator, "review-request", "pr #4")
            .unwrap();
        store
            .send(&task, Role::Orchestrator, Role::Worker, "directive", "fix lint")
            .unwrap();
        store.archive(&task, Role::Orchestrator, &id).unwrap();

        let stats = store.stats(&task).unwrap();
        assert_eq!(stats.worker_pending, 1);
        assert_eq!(stats.orchestrator_pending, 0);
        assert_eq!(stats.archived, 1);
        assert!(stats.to_string().contains("Worker inbox:       1"));
    }
}
