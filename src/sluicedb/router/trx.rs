use crate::sluicedb::mysql::protocol::{Reply, Command};
use crate::sluicedb::mysql::protocol::capabilities::{SERVER_STATUS_IN_TRANS, SERVER_STATUS_IN_TRANS_READONLY, SERVER_STATUS_AUTOCOMMIT};
use crate::sluicedb::mysql::sql::*;

/// Tracks the transaction state of a session from the statements it sends
/// and the status flags in the replies.
///
/// The statement side is needed to route the statement that starts a transaction,
/// before any server has told us about it. The reply side corrects the guesses.
#[derive(Debug, Clone)]
pub struct TrxTracker {
    active: bool,
    read_only: bool,
    ending: bool,
    starting: bool,
    autocommit: bool,
    // SET TRANSACTION READ ONLY applies to the next transaction only
    next_read_only: Option<bool>,
}

impl Default for TrxTracker {
    fn default() -> Self {
        Self {
            active: false,
            read_only: false,
            ending: false,
            starting: false,
            autocommit: true,
            next_read_only: None,
        }
    }
}

impl TrxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_trx_active(&self) -> bool {
        self.active
    }

    pub fn is_trx_read_only(&self) -> bool {
        self.active && self.read_only
    }

    /// The current statement ends the transaction
    pub fn is_trx_ending(&self) -> bool {
        self.ending
    }

    /// The current statement starts the transaction
    pub fn is_trx_starting(&self) -> bool {
        self.starting
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    /// Updates the state for a statement about to be routed.
    pub fn track_query(&mut self, type_mask: u32) {
        self.starting = false;
        if self.ending {
            self.ending = false;
            self.active = false;
            self.read_only = false;
        }

        if type_mask & QUERY_TYPE_NEXT_TRX != 0 {
            if type_mask & QUERY_TYPE_READONLY != 0 {
                self.next_read_only = Some(true);
            } else if type_mask & QUERY_TYPE_READWRITE != 0 {
                self.next_read_only = Some(false);
            }
            return;
        }

        if type_mask & QUERY_TYPE_BEGIN_TRX != 0 {
            self.active = true;
            self.starting = true;
            self.read_only = if type_mask & QUERY_TYPE_READONLY != 0 {
                true
            } else if type_mask & QUERY_TYPE_READWRITE != 0 {
                false
            } else {
                self.next_read_only.unwrap_or(false)
            };
            self.next_read_only = None;
        }

        if type_mask & QUERY_TYPE_DISABLE_AUTOCOMMIT != 0 {
            self.autocommit = false;
            if !self.active {
                self.active = true;
                self.starting = true;
                self.read_only = false;
            }
        } else if type_mask & QUERY_TYPE_ENABLE_AUTOCOMMIT != 0 {
            self.autocommit = true;
            if self.active {
                self.ending = true;
            }
        }

        if type_mask & (QUERY_TYPE_COMMIT | QUERY_TYPE_ROLLBACK) != 0 && self.active {
            self.ending = true;
        }
    }

    /// Updates the state from a complete reply. Errors don't carry status flags and are ignored.
    pub fn track_reply(&mut self, reply: &Reply) {
        if !reply.is_complete() || reply.error().is_set() {
            return;
        }
        if Command::from_u8(reply.command()).map(|c| !c.will_respond()).unwrap_or(false) {
            return;
        }
        let status = reply.server_status();
        self.autocommit = status & SERVER_STATUS_AUTOCOMMIT != 0;
        if status & SERVER_STATUS_IN_TRANS != 0 {
            self.active = true;
            if status & SERVER_STATUS_IN_TRANS_READONLY != 0 {
                self.read_only = true;
            }
        } else if self.autocommit || self.ending {
            // with autocommit off a new transaction starts implicitly with the next statement
            self.active = !self.autocommit;
            self.read_only = false;
            self.ending = false;
        }
    }

    /// COM_CHANGE_USER and reconnects reset the server side session
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
