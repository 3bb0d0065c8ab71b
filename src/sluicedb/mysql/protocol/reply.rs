use strum::Display;

/// Where a backend response is in its lifecycle.
#[derive(Display, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReplyState {
    /// Waiting for the first packet of a response (or of the next resultset)
    Start,
    /// Reading column definitions
    RsetColdef,
    /// Waiting for the EOF after the column definitions
    RsetColdefEof,
    /// Reading rows
    RsetRows,
    /// Reading the parameter and column definitions of a COM_STMT_PREPARE response
    Prepare,
    /// The server asked the client to stream a file (LOAD DATA LOCAL INFILE)
    LoadData,
    /// The response is complete
    Done,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReplyError {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ReplyError {
    pub fn is_set(&self) -> bool {
        self.code != 0
    }

    /// Deadlocks and lock wait timeouts roll back the transaction
    pub fn is_rollback(&self) -> bool {
        self.sql_state == "40001" || self.code == 1213
    }

    /// Errors that mean the server closed or killed the connection, not the query failing
    pub fn is_unexpected_error(&self) -> bool {
        matches!(self.code, 1927 | 1053 | 1077 | 1078 | 1079)
    }
}

/// Reply describes the response to the command in flight on a backend connection.
#[derive(Debug, Clone)]
pub struct Reply {
    pub(crate) command: u8,
    pub(crate) state: ReplyState,
    pub(crate) field_counts: Vec<u64>,
    pub(crate) row_count: u64,
    pub(crate) size: u64,
    pub(crate) error: ReplyError,
    pub(crate) warnings: u16,
    pub(crate) affected_rows: u64,
    pub(crate) last_insert_id: u64,
    pub(crate) generated_id: u32,
    pub(crate) param_count: u16,
    pub(crate) server_status: u16,
    pub(crate) variables: Vec<(String, String)>,
    pub(crate) schema: Option<String>,
    pub(crate) last_gtid: Option<String>,
}

impl Default for Reply {
    fn default() -> Self {
        Self {
            command: 0,
            state: ReplyState::Done,
            field_counts: Vec::new(),
            row_count: 0,
            size: 0,
            error: ReplyError::default(),
            warnings: 0,
            affected_rows: 0,
            last_insert_id: 0,
            generated_id: 0,
            param_count: 0,
            server_status: 0,
            variables: Vec::new(),
            schema: None,
            last_gtid: None,
        }
    }
}

impl Reply {
    pub fn new(command: u8) -> Self {
        Reply {
            command,
            state: ReplyState::Start,
            ..Default::default()
        }
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Done
    }

    /// A complete response without a resultset and without an error
    pub fn is_ok(&self) -> bool {
        self.is_complete() && self.field_counts.is_empty() && !self.error.is_set()
    }

    pub fn is_resultset(&self) -> bool {
        !self.field_counts.is_empty()
    }

    pub fn field_counts(&self) -> &[u64] {
        &self.field_counts
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Bytes received so far, headers included
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn error(&self) -> &ReplyError {
        &self.error
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    /// The statement id of a COM_STMT_PREPARE response
    pub fn generated_id(&self) -> u32 {
        self.generated_id
    }

    pub fn param_count(&self) -> u16 {
        self.param_count
    }

    pub fn server_status(&self) -> u16 {
        self.server_status
    }

    /// System variables reported through session state tracking
    pub fn variables(&self) -> &[(String, String)] {
        &self.variables
    }

    pub fn get_variable(&self, name: &str) -> Option<&str> {
        self.variables.iter().rev().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// The default database if the server reported a change
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn last_gtid(&self) -> Option<&str> {
        self.last_gtid.as_deref()
    }

    /// True if this and other have the same outcome. Used to compare
    /// responses to the same session command from different servers.
    pub fn same_outcome(&self, other: &Reply) -> bool {
        self.is_ok() == other.is_ok() && self.error.code == other.error.code
    }
}
