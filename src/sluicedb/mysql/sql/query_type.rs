use strum::Display;

// Query type mask bits. A statement usually sets several of these.
pub const QUERY_TYPE_UNKNOWN: u32 = 0;
/// Read database data, any server will do
pub const QUERY_TYPE_READ: u32 = 1;
/// Modifies data, master only
pub const QUERY_TYPE_WRITE: u32 = 1 << 1;
/// Reads that must go to the master, e.g. LAST_INSERT_ID()
pub const QUERY_TYPE_MASTER_READ: u32 = 1 << 2;
/// Changes session state, sent to every server of the session
pub const QUERY_TYPE_SESSION_WRITE: u32 = 1 << 3;
pub const QUERY_TYPE_USERVAR_WRITE: u32 = 1 << 4;
pub const QUERY_TYPE_USERVAR_READ: u32 = 1 << 5;
pub const QUERY_TYPE_SYSVAR_READ: u32 = 1 << 6;
pub const QUERY_TYPE_GSYSVAR_READ: u32 = 1 << 7;
pub const QUERY_TYPE_GSYSVAR_WRITE: u32 = 1 << 8;
pub const QUERY_TYPE_BEGIN_TRX: u32 = 1 << 9;
pub const QUERY_TYPE_ENABLE_AUTOCOMMIT: u32 = 1 << 10;
pub const QUERY_TYPE_DISABLE_AUTOCOMMIT: u32 = 1 << 11;
pub const QUERY_TYPE_ROLLBACK: u32 = 1 << 12;
pub const QUERY_TYPE_COMMIT: u32 = 1 << 13;
/// PREPARE name FROM '...'
pub const QUERY_TYPE_PREPARE_NAMED_STMT: u32 = 1 << 14;
/// COM_STMT_PREPARE
pub const QUERY_TYPE_PREPARE_STMT: u32 = 1 << 15;
pub const QUERY_TYPE_EXEC_STMT: u32 = 1 << 16;
pub const QUERY_TYPE_CREATE_TMP_TABLE: u32 = 1 << 17;
/// Set by the router when a read uses one of the session's temporary tables
pub const QUERY_TYPE_READ_TMP_TABLE: u32 = 1 << 18;
pub const QUERY_TYPE_SHOW_DATABASES: u32 = 1 << 19;
pub const QUERY_TYPE_SHOW_TABLES: u32 = 1 << 20;
pub const QUERY_TYPE_DEALLOC_PREPARE: u32 = 1 << 21;
/// START TRANSACTION READ ONLY
pub const QUERY_TYPE_READONLY: u32 = 1 << 22;
pub const QUERY_TYPE_READWRITE: u32 = 1 << 23;
/// SET TRANSACTION, applies to the next transaction only
pub const QUERY_TYPE_NEXT_TRX: u32 = 1 << 24;

/// The statement's main operation
#[derive(Display, Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueryOperation {
    Undefined,
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
    Truncate,
    Rename,
    Call,
    Execute,
    Prepare,
    Deallocate,
    Set,
    SetTransaction,
    Show,
    Use,
    Grant,
    Revoke,
    Load,
    Begin,
    Commit,
    Rollback,
    Explain,
    Kill,
}

const TYPE_NAMES: &[(u32, &str)] = &[
    (QUERY_TYPE_READ, "QUERY_TYPE_READ"),
    (QUERY_TYPE_WRITE, "QUERY_TYPE_WRITE"),
    (QUERY_TYPE_MASTER_READ, "QUERY_TYPE_MASTER_READ"),
    (QUERY_TYPE_SESSION_WRITE, "QUERY_TYPE_SESSION_WRITE"),
    (QUERY_TYPE_USERVAR_WRITE, "QUERY_TYPE_USERVAR_WRITE"),
    (QUERY_TYPE_USERVAR_READ, "QUERY_TYPE_USERVAR_READ"),
    (QUERY_TYPE_SYSVAR_READ, "QUERY_TYPE_SYSVAR_READ"),
    (QUERY_TYPE_GSYSVAR_READ, "QUERY_TYPE_GSYSVAR_READ"),
    (QUERY_TYPE_GSYSVAR_WRITE, "QUERY_TYPE_GSYSVAR_WRITE"),
    (QUERY_TYPE_BEGIN_TRX, "QUERY_TYPE_BEGIN_TRX"),
    (QUERY_TYPE_ENABLE_AUTOCOMMIT, "QUERY_TYPE_ENABLE_AUTOCOMMIT"),
    (QUERY_TYPE_DISABLE_AUTOCOMMIT, "QUERY_TYPE_DISABLE_AUTOCOMMIT"),
    (QUERY_TYPE_ROLLBACK, "QUERY_TYPE_ROLLBACK"),
    (QUERY_TYPE_COMMIT, "QUERY_TYPE_COMMIT"),
    (QUERY_TYPE_PREPARE_NAMED_STMT, "QUERY_TYPE_PREPARE_NAMED_STMT"),
    (QUERY_TYPE_PREPARE_STMT, "QUERY_TYPE_PREPARE_STMT"),
    (QUERY_TYPE_EXEC_STMT, "QUERY_TYPE_EXEC_STMT"),
    (QUERY_TYPE_CREATE_TMP_TABLE, "QUERY_TYPE_CREATE_TMP_TABLE"),
    (QUERY_TYPE_READ_TMP_TABLE, "QUERY_TYPE_READ_TMP_TABLE"),
    (QUERY_TYPE_SHOW_DATABASES, "QUERY_TYPE_SHOW_DATABASES"),
    (QUERY_TYPE_SHOW_TABLES, "QUERY_TYPE_SHOW_TABLES"),
    (QUERY_TYPE_DEALLOC_PREPARE, "QUERY_TYPE_DEALLOC_PREPARE"),
    (QUERY_TYPE_READONLY, "QUERY_TYPE_READONLY"),
    (QUERY_TYPE_READWRITE, "QUERY_TYPE_READWRITE"),
    (QUERY_TYPE_NEXT_TRX, "QUERY_TYPE_NEXT_TRX"),
];

/// Formats a type mask as "QUERY_TYPE_READ|QUERY_TYPE_SYSVAR_READ", for logging.
pub fn type_mask_to_string(mask: u32) -> String {
    if mask == QUERY_TYPE_UNKNOWN {
        return "QUERY_TYPE_UNKNOWN".to_string();
    }
    let mut s = String::new();
    for (bit, name) in TYPE_NAMES {
        if mask & bit != 0 {
            if !s.is_empty() {
                s.push('|');
            }
            s.push_str(name);
        }
    }
    s
}
