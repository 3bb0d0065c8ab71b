use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{info, warn};

use crate::sluicedb::mysql::protocol::{Reply, Command, packet::payload};

/// A session command, kept so it can be replayed on servers the session connects to later.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: u32,
    pub command: Option<Command>,
    pub packet: Bytes,
    /// The reply of the server that answered the client, None until it completes
    pub outcome: Option<Reply>,
}

impl HistoryEntry {
    pub fn is_prepare(&self) -> bool {
        self.command == Some(Command::StmtPrepare)
    }
}

/// The ordered session command history of a session.
///
/// Ids are 32 bit and wrap, skipping 0 and u32::MAX which have a meaning of their own
/// as statement ids. A prepared statement's history id is also the statement id the
/// client sees.
pub struct History {
    entries: VecDeque<HistoryEntry>,
    next_id: u32,
    max_size: usize,
    prune: bool,
    disabled: bool,
    pruned: bool,
}

impl History {
    pub fn new(max_size: usize, prune: bool, disabled: bool) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            max_size,
            prune,
            disabled,
            pruned: false,
        }
    }

    /// Allocates the id of the next session command.
    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 || self.next_id == u32::MAX {
            self.next_id = 1;
        }
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item=&HistoryEntry> {
        self.entries.iter()
    }

    pub fn get(&self, id: u32) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Recording is on. Without a history a session can't reconnect to servers.
    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    /// A pruned history can't rebuild the session on a pooled connection,
    /// the session keeps its connections to itself.
    pub fn can_pool(&self) -> bool {
        !self.disabled && !self.pruned
    }

    /// Appends a session command. Pruning or disabling kicks in once the history is full.
    pub fn add(&mut self, id: u32, packet: Bytes) {
        if self.disabled {
            return;
        }
        let command = payload(&packet).first().and_then(|b| Command::from_u8(*b));
        self.entries.push_back(HistoryEntry { id, command, packet, outcome: None });
        if self.entries.len() <= self.max_size {
            return;
        }
        if self.prune {
            while self.entries.len() > self.max_size {
                self.entries.pop_front();
            }
            if !self.pruned {
                info!(max_size = self.max_size, "session command history pruned, connection pooling disabled for the session");
                self.pruned = true;
            }
        } else {
            warn!(max_size = self.max_size, "session command history exceeded the maximum size and was disabled, the session can no longer reconnect");
            self.disabled = true;
            self.entries.clear();
        }
    }

    /// Stores the reply the client got for the command.
    pub fn set_outcome(&mut self, id: u32, reply: &Reply) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            e.outcome = Some(reply.clone());
        }
    }

    pub fn outcome(&self, id: u32) -> Option<&Reply> {
        self.get(id).and_then(|e| e.outcome.as_ref())
    }

    /// COM_STMT_CLOSE, the prepare doesn't need replaying anymore.
    pub fn remove_prepare(&mut self, stmt_id: u32) -> bool {
        match self.entries.iter().position(|e| e.id == stmt_id && e.is_prepare()) {
            Some(i) => {
                self.entries.remove(i);
                true
            },
            None => false,
        }
    }

    /// COM_CHANGE_USER resets the whole session state on the servers.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
