//! Messaging API bound to a single task.

use super::store::{CommsStats, Store};
use super::types::{Message, MessageId, Priority, Role};
use crate::error::{Error, Result};
use crate::task::Task;

/// Outcome of consuming a message.
#[derive(Debug, Clone)]
pub enum Consumed {
    /// Read and moved to the archive by this call.
    Archived(Message),
    /// Someone else archived it first. Not an error for a consumer.
    AlreadyArchived(MessageId),
}

/// A task's comms, seen through one store.
#[derive(Debug, Clone)]
pub struct Mailbox {
    store: Store,
    task: Task,
}

impl Mailbox {
    pub fn new(store: Store, task: Task) -> Self {
        Self { store, task }
    }

    /// Create the comms tree if needed and return the mailbox.
    pub fn open(store: Store, task: Task) -> Result<Self> {
        store.init(&task)?;
        Ok(Self::new(store, task))
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn send(&self, from: Role, to: Role, msg_type: &str, body: &str) -> Result<MessageId> {
        self.store.send(&self.task, from, to, msg_type, body)
    }

    pub fn send_with_priority(
        &self,
        from: Role,
        to: Role,
        msg_type: &str,
        priority: Priority,
        body: &str,
    ) -> Result<MessageId> {
        self.store
            .send_with_priority(&self.task, from, to, msg_type, priority, body)
    }

    /// Pending ids for `role`, oldest first.
    pub fn list(&self, role: Role) -> Result<Vec<MessageId>> {
        self.store.list_inbox(&self.task, role)
    }

    /// Pending messages for `role`, oldest first.
    pub fn messages(&self, role: Role) -> Result<Vec<Message>> {
        self.store.inbox(&self.task, role)
    }

    pub fn has_pending(&self, role: Role) -> Result<bool> {
        self.store.has_pending(&self.task, role)
    }

    /// Oldest pending message for `role`, if any.
    pub fn next_pending(&self, role: Role) -> Result<Option<Message>> {
        self.store.oldest_pending(&self.task, role)
    }

    pub fn read(&self, role: Role, id: &MessageId) -> Result<Message> {
        self.store.read(&self.task, role, id)
    }

    pub fn archive(&self, role: Role, id: &MessageId) -> Result<()> {
        self.store.archive(&self.task, role, id).map(|_| ())
    }

    /// Read then archive. A message that is already in the archive counts as
    /// consumed; an id that was never sent is still `NotFound`.
    pub fn consume(&self, role: Role, id: &MessageId) -> Result<Consumed> {
        let message = match self.read(role, id) {
            Ok(message) => message,
            Err(Error::NotFound(reason)) => return self.already_archived(id, reason),
            Err(e) => return Err(e),
        };

        match self.store.archive(&self.task, role, id) {
            Ok(_) => Ok(Consumed::Archived(message)),
            Err(Error::NotFound(reason)) => self.already_archived(id, reason),
            Err(e) => Err(e),
        }
    }

    fn already_archived(&self, id: &MessageId, reason: String) -> Result<Consumed> {
        if self.store.is_archived(&self.task, id)? {
            tracing::debug!(task = self.task.name(), id = %id, "Message was already archived");
            Ok(Consumed::AlreadyArchived(id.clone()))
        } else {
            Err(Error::NotFound(reason))
        }
    }

    pub fn stats(&self) -> Result<CommsStats> {
        self.store.stats(&self.task)
    }
}
