use std::fmt::{Display, Formatter};

use tracing::trace;

use crate::sluicedb::mysql::protocol::packet::payload;
use crate::sluicedb::mysql::protocol::command::Command;
use crate::sluicedb::mysql::sql::query_type::*;

/// A table name as written in the query, optionally qualified with a database.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct TableName {
    pub db: Option<String>,
    pub table: String,
}

impl Display for TableName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.db {
            Some(db) => write!(f, "{}.{}", db, self.table),
            None => f.write_str(&self.table),
        }
    }
}

/// What the classifier learned about a statement.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    type_mask: u32,
    operation: QueryOperation,
    sql: String,
    tables: Vec<TableName>,
    databases: Vec<String>,
    multi_stmt: bool,
    sp_call: bool,
    prepare_name: Option<String>,
    prepare_type_mask: u32,
    created_tmp_tables: Vec<TableName>,
    dropped_tables: Vec<TableName>,
}

impl Default for QueryInfo {
    fn default() -> Self {
        Self {
            type_mask: QUERY_TYPE_UNKNOWN,
            operation: QueryOperation::Undefined,
            sql: String::new(),
            tables: Vec::new(),
            databases: Vec::new(),
            multi_stmt: false,
            sp_call: false,
            prepare_name: None,
            prepare_type_mask: QUERY_TYPE_UNKNOWN,
            created_tmp_tables: Vec::new(),
            dropped_tables: Vec::new(),
        }
    }
}

impl QueryInfo {
    pub fn type_mask(&self) -> u32 {
        self.type_mask
    }

    pub fn is_type(&self, mask: u32) -> bool {
        self.type_mask & mask != 0
    }

    pub fn operation(&self) -> QueryOperation {
        self.operation
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn tables(&self) -> &[TableName] {
        &self.tables
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.to_string()).collect()
    }

    /// Databases named explicitly in the statement
    pub fn database_names(&self) -> &[String] {
        &self.databases
    }

    /// More than one statement in a single COM_QUERY
    pub fn is_multi_stmt(&self) -> bool {
        self.multi_stmt
    }

    pub fn is_sp_call(&self) -> bool {
        self.sp_call
    }

    /// Name of the statement for PREPARE, EXECUTE and DEALLOCATE PREPARE
    pub fn prepare_name(&self) -> Option<&str> {
        self.prepare_name.as_deref()
    }

    /// Type mask of the statement text of a PREPARE name FROM '...'
    pub fn prepare_type_mask(&self) -> u32 {
        self.prepare_type_mask
    }

    pub fn created_tmp_tables(&self) -> &[TableName] {
        &self.created_tmp_tables
    }

    pub fn dropped_tables(&self) -> &[TableName] {
        &self.dropped_tables
    }

    pub fn add_type(&mut self, mask: u32) {
        self.type_mask |= mask;
    }
}

/// Classifies the statements the router sees. Implementations must not block.
pub trait QueryClassifier {
    /// Classifies the SQL of a COM_QUERY or COM_STMT_PREPARE packet (header included).
    fn parse(&self, packet: &[u8]) -> QueryInfo;

    /// Classifies SQL text directly
    fn parse_sql(&self, sql: &str) -> QueryInfo;
}

/// Returns the SQL text of a COM_QUERY or COM_STMT_PREPARE packet.
pub fn get_sql(packet: &[u8]) -> Option<&str> {
    let data = payload(packet);
    match data.first().and_then(|b| Command::from_u8(*b)) {
        Some(Command::Query) | Some(Command::StmtPrepare) => std::str::from_utf8(&data[1..]).ok(),
        _ => None,
    }
}

/// SimpleClassifier tokenizes the statement and classifies it from its keywords.
/// It doesn't understand the full grammar, unknown statements are treated as writes.
#[derive(Default)]
pub struct SimpleClassifier;

impl SimpleClassifier {
    pub fn new() -> Self {
        SimpleClassifier
    }
}

impl QueryClassifier for SimpleClassifier {
    fn parse(&self, packet: &[u8]) -> QueryInfo {
        let data = payload(packet);
        let is_prepare = data.first() == Some(&(Command::StmtPrepare as u8));
        let sql = match get_sql(packet) {
            Some(sql) => sql,
            None => {
                // not valid utf8, can't know what it does
                let mut info = QueryInfo::default();
                info.type_mask = QUERY_TYPE_WRITE;
                return info;
            },
        };
        let mut info = self.parse_sql(sql);
        if is_prepare {
            info.type_mask |= QUERY_TYPE_PREPARE_STMT;
        }
        info
    }

    fn parse_sql(&self, sql: &str) -> QueryInfo {
        let tokens = QueryScanner::new(sql).tokens();
        let mut info = QueryInfo::default();
        info.sql = sql.to_string();
        let mut statements = 0;
        for stmt in tokens.split(|t| *t == Token::Semicolon).filter(|s| !s.is_empty()) {
            statements += 1;
            let mut part = QueryInfo::default();
            classify_statement(stmt, &mut part);
            if statements == 1 {
                info.operation = part.operation;
                info.prepare_name = part.prepare_name.take();
                info.prepare_type_mask = part.prepare_type_mask;
            }
            info.type_mask |= part.type_mask;
            info.sp_call |= part.sp_call;
            info.tables.append(&mut part.tables);
            info.databases.append(&mut part.databases);
            info.created_tmp_tables.append(&mut part.created_tmp_tables);
            info.dropped_tables.append(&mut part.dropped_tables);
        }
        info.multi_stmt = statements > 1;
        trace!(sql, type_mask = %type_mask_to_string(info.type_mask), operation = %info.operation, "classified query");
        info
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum Token<'a> {
    Word(&'a str),
    Quoted(String),
    Str(String),
    Number(&'a str),
    UserVar(String),
    SysVar(&'a str),
    Punct(char),
    Semicolon,
}

impl<'a> Token<'a> {
    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    fn is_punct(&self, c: char) -> bool {
        *self == Token::Punct(c)
    }

    fn identifier(&self) -> Option<String> {
        match self {
            Token::Word(w) => Some(w.to_string()),
            Token::Quoted(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// QueryScanner splits SQL text into tokens, dropping comments and whitespace.
struct QueryScanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    // inside a /*! ... */ comment, which the server executes
    exec_comment: bool,
}

impl<'a> QueryScanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            exec_comment: false,
        }
    }

    fn tokens(mut self) -> Vec<Token<'a>> {
        let mut out = Vec::new();
        while let Some(tok) = self.next_token() {
            out.push(tok);
        }
        out
    }

    fn peek_at(&self, offset: usize) -> u8 {
        self.bytes.get(self.pos + offset).cloned().unwrap_or(0)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn skip_line(&mut self) {
        while !self.at_end() && self.peek_at(0) != b'\n' {
            self.pos += 1;
        }
    }

    fn next_token(&mut self) -> Option<Token<'a>> {
        loop {
            if self.at_end() {
                return None;
            }
            let c = self.peek_at(0);
            match c {
                b' ' | b'\t' | b'\r' | b'\n' | b'\x0c' => self.pos += 1,
                b'#' => self.skip_line(),
                b'-' if self.peek_at(1) == b'-' && matches!(self.peek_at(2), b' ' | b'\t' | b'\r' | b'\n' | 0) => {
                    self.skip_line()
                },
                b'/' if self.peek_at(1) == b'*' => {
                    if self.peek_at(2) == b'!' || (self.peek_at(2) == b'M' && self.peek_at(3) == b'!') {
                        self.pos += if self.peek_at(2) == b'M' { 4 } else { 3 };
                        while self.peek_at(0).is_ascii_digit() {
                            self.pos += 1;
                        }
                        self.exec_comment = true;
                    } else {
                        self.pos += 2;
                        while !self.at_end() && !(self.peek_at(0) == b'*' && self.peek_at(1) == b'/') {
                            self.pos += 1;
                        }
                        self.pos = (self.pos + 2).min(self.bytes.len());
                    }
                },
                b'*' if self.exec_comment && self.peek_at(1) == b'/' => {
                    self.pos += 2;
                    self.exec_comment = false;
                },
                b'\'' | b'"' => return Some(Token::Str(self.quoted(c))),
                b'`' => return Some(Token::Quoted(self.quoted(c))),
                b'@' => return Some(self.variable()),
                b';' => {
                    self.pos += 1;
                    return Some(Token::Semicolon);
                },
                c if c.is_ascii_digit() => {
                    let start = self.pos;
                    while self.peek_at(0).is_ascii_alphanumeric() || self.peek_at(0) == b'.' {
                        self.pos += 1;
                    }
                    return Some(Token::Number(&self.src[start..self.pos]));
                },
                c if is_word_byte(c) => return Some(Token::Word(self.word())),
                _ => {
                    self.pos += 1;
                    return Some(Token::Punct(c as char));
                },
            }
        }
    }

    fn word(&mut self) -> &'a str {
        let start = self.pos;
        while !self.at_end() && (is_word_byte(self.peek_at(0)) || self.peek_at(0).is_ascii_digit()) {
            self.pos += 1;
        }
        &self.src[start..self.pos]
    }

    /// Reads a quoted string or identifier, returning the unescaped contents.
    fn quoted(&mut self, quote: u8) -> String {
        self.pos += 1;
        let mut out = Vec::new();
        while !self.at_end() {
            let b = self.peek_at(0);
            if b == b'\\' && quote != b'`' {
                let escaped = match self.peek_at(1) {
                    b'n' => b'\n',
                    b't' => b'\t',
                    b'r' => b'\r',
                    b'0' => 0,
                    other => other,
                };
                out.push(escaped);
                self.pos = (self.pos + 2).min(self.bytes.len());
            } else if b == quote {
                if self.peek_at(1) == quote {
                    out.push(quote);
                    self.pos += 2;
                } else {
                    self.pos += 1;
                    break;
                }
            } else {
                out.push(b);
                self.pos += 1;
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    fn variable(&mut self) -> Token<'a> {
        if self.peek_at(1) == b'@' {
            self.pos += 2;
            let start = self.pos;
            while !self.at_end() && (is_word_byte(self.peek_at(0)) || self.peek_at(0).is_ascii_digit() || self.peek_at(0) == b'.') {
                self.pos += 1;
            }
            return Token::SysVar(&self.src[start..self.pos]);
        }
        self.pos += 1;
        match self.peek_at(0) {
            q @ (b'`' | b'\'' | b'"') => Token::UserVar(self.quoted(q)),
            _ => {
                let start = self.pos;
                while !self.at_end() && (is_word_byte(self.peek_at(0)) || self.peek_at(0).is_ascii_digit() || self.peek_at(0) == b'.') {
                    self.pos += 1;
                }
                Token::UserVar(self.src[start..self.pos].to_string())
            },
        }
    }
}

fn is_word_byte(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$' || c >= 0x80
}

// Keywords that end the table list of a FROM clause
const FROM_LIST_END: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "LIMIT", "HAVING", "UNION", "ON", "USING", "FOR", "LOCK", "INTO",
    "WINDOW", "PROCEDURE", "EXCEPT", "INTERSECT", "RETURNING", "SET", "VALUES", "SELECT",
];

// Functions whose result depends on state only the master has
const MASTER_READ_FUNCTIONS: &[&str] = &["LAST_INSERT_ID", "FOUND_ROWS", "ROW_COUNT", "LASTVAL"];

// Functions with side effects
const WRITE_FUNCTIONS: &[&str] = &[
    "GET_LOCK", "RELEASE_LOCK", "RELEASE_ALL_LOCKS", "IS_USED_LOCK", "IS_FREE_LOCK", "NEXTVAL", "SETVAL",
    "MASTER_POS_WAIT", "MASTER_GTID_WAIT",
];

fn first_word(tokens: &[Token]) -> Option<(usize, String)> {
    tokens.iter().enumerate().find_map(|(i, t)| match t {
        Token::Word(w) => Some((i, w.to_ascii_uppercase())),
        Token::Punct('(') => None,
        _ => Some((i, String::new())),
    })
}

fn classify_statement(tokens: &[Token], info: &mut QueryInfo) {
    let (i, first) = match first_word(tokens) {
        Some(w) => w,
        None => return,
    };
    let rest = &tokens[i + 1..];
    match first.as_str() {
        "SELECT" => classify_select(tokens, info),
        "WITH" | "VALUES" | "TABLE" => {
            if tokens.iter().any(|t| t.is_keyword("INSERT") || t.is_keyword("UPDATE") || t.is_keyword("DELETE") || t.is_keyword("REPLACE")) {
                info.type_mask |= QUERY_TYPE_WRITE;
                collect_tables(tokens, info);
            } else {
                classify_select(tokens, info);
            }
        },
        "INSERT" | "REPLACE" => {
            info.type_mask |= QUERY_TYPE_WRITE;
            info.operation = QueryOperation::Insert;
            let mut j = 0;
            while j < rest.len() && ["LOW_PRIORITY", "DELAYED", "HIGH_PRIORITY", "IGNORE", "INTO"].iter().any(|k| rest[j].is_keyword(k)) {
                j += 1;
            }
            push_table_at(rest, j, info);
            collect_tables(rest, info);
            scan_expressions(rest, info);
        },
        "UPDATE" => {
            info.type_mask |= QUERY_TYPE_WRITE;
            info.operation = QueryOperation::Update;
            let mut j = 0;
            while j < rest.len() && (rest[j].is_keyword("LOW_PRIORITY") || rest[j].is_keyword("IGNORE")) {
                j += 1;
            }
            push_table_at(rest, j, info);
            collect_tables(rest, info);
            scan_expressions(rest, info);
        },
        "DELETE" => {
            info.type_mask |= QUERY_TYPE_WRITE;
            info.operation = QueryOperation::Delete;
            collect_tables(rest, info);
        },
        "LOAD" => {
            info.type_mask |= QUERY_TYPE_WRITE;
            info.operation = QueryOperation::Load;
            if let Some(j) = rest.iter().position(|t| t.is_keyword("TABLE")) {
                push_table_at(rest, j + 1, info);
            }
        },
        "CREATE" => classify_create(rest, info),
        "DROP" => classify_drop(rest, info),
        "ALTER" => {
            info.type_mask |= QUERY_TYPE_WRITE;
            info.operation = QueryOperation::Alter;
            if rest.first().map_or(false, |t| t.is_keyword("TABLE")) {
                push_table_at(rest, 1, info);
            }
        },
        "TRUNCATE" => {
            info.type_mask |= QUERY_TYPE_WRITE;
            info.operation = QueryOperation::Truncate;
            let j = if rest.first().map_or(false, |t| t.is_keyword("TABLE")) { 1 } else { 0 };
            push_table_at(rest, j, info);
        },
        "RENAME" => {
            info.type_mask |= QUERY_TYPE_WRITE;
            info.operation = QueryOperation::Rename;
        },
        "GRANT" => {
            info.type_mask |= QUERY_TYPE_WRITE;
            info.operation = QueryOperation::Grant;
        },
        "REVOKE" => {
            info.type_mask |= QUERY_TYPE_WRITE;
            info.operation = QueryOperation::Revoke;
        },
        "CALL" => {
            info.type_mask |= QUERY_TYPE_WRITE;
            info.operation = QueryOperation::Call;
            info.sp_call = true;
        },
        "SET" => classify_set(rest, info),
        "USE" => {
            info.type_mask |= QUERY_TYPE_SESSION_WRITE;
            info.operation = QueryOperation::Use;
            if let Some(db) = rest.first().and_then(|t| t.identifier()) {
                info.databases.push(db);
            }
        },
        "SHOW" => classify_show(rest, info),
        "BEGIN" => {
            if rest.first().map_or(false, |t| t.is_keyword("NOT")) {
                // BEGIN NOT ATOMIC compound statement
                info.type_mask |= QUERY_TYPE_WRITE;
            } else {
                info.type_mask |= QUERY_TYPE_BEGIN_TRX;
                info.operation = QueryOperation::Begin;
            }
        },
        "START" => {
            if rest.first().map_or(false, |t| t.is_keyword("TRANSACTION")) {
                info.type_mask |= QUERY_TYPE_BEGIN_TRX | transaction_access_mode(rest);
                info.operation = QueryOperation::Begin;
            } else {
                info.type_mask |= QUERY_TYPE_WRITE;
            }
        },
        "COMMIT" => {
            info.type_mask |= QUERY_TYPE_COMMIT;
            info.operation = QueryOperation::Commit;
        },
        "ROLLBACK" => {
            if rest.iter().any(|t| t.is_keyword("TO")) {
                // ROLLBACK TO SAVEPOINT keeps the transaction open
                info.type_mask |= QUERY_TYPE_WRITE;
            } else {
                info.type_mask |= QUERY_TYPE_ROLLBACK;
                info.operation = QueryOperation::Rollback;
            }
        },
        "PREPARE" => {
            info.type_mask |= QUERY_TYPE_PREPARE_NAMED_STMT;
            info.operation = QueryOperation::Prepare;
            info.prepare_name = rest.first().and_then(|t| t.identifier());
            if let Some(Token::Str(text)) = rest.get(2) {
                let inner = QueryScanner::new(text).tokens();
                let mut prepared = QueryInfo::default();
                for stmt in inner.split(|t| *t == Token::Semicolon).filter(|s| !s.is_empty()) {
                    classify_statement(stmt, &mut prepared);
                }
                info.prepare_type_mask = prepared.type_mask;
            } else {
                // PREPARE name FROM @var, the text isn't known
                info.prepare_type_mask = QUERY_TYPE_WRITE;
            }
        },
        "EXECUTE" => {
            info.type_mask |= QUERY_TYPE_EXEC_STMT;
            info.operation = QueryOperation::Execute;
            info.prepare_name = rest.first().and_then(|t| t.identifier());
        },
        "DEALLOCATE" => {
            info.type_mask |= QUERY_TYPE_DEALLOC_PREPARE;
            info.operation = QueryOperation::Deallocate;
            info.prepare_name = rest.get(1).and_then(|t| t.identifier());
        },
        "EXPLAIN" | "DESCRIBE" | "DESC" | "HELP" => {
            info.type_mask |= QUERY_TYPE_READ;
            info.operation = QueryOperation::Explain;
            collect_tables(rest, info);
        },
        "KILL" => {
            info.type_mask |= QUERY_TYPE_WRITE;
            info.operation = QueryOperation::Kill;
        },
        _ => {
            // LOCK, UNLOCK, FLUSH, HANDLER, XA, SAVEPOINT, RELEASE, DO and anything unknown
            info.type_mask |= QUERY_TYPE_WRITE;
        },
    }
}

fn classify_select(tokens: &[Token], info: &mut QueryInfo) {
    info.type_mask |= QUERY_TYPE_READ;
    info.operation = QueryOperation::Select;
    for (i, tok) in tokens.iter().enumerate() {
        let next = tokens.get(i + 1);
        if tok.is_keyword("FOR") && next.map_or(false, |t| t.is_keyword("UPDATE")) {
            info.type_mask |= QUERY_TYPE_WRITE;
        } else if tok.is_keyword("LOCK") && next.map_or(false, |t| t.is_keyword("IN")) {
            info.type_mask |= QUERY_TYPE_WRITE;
        } else if tok.is_keyword("INTO") {
            match next {
                Some(Token::UserVar(_)) => info.type_mask |= QUERY_TYPE_USERVAR_WRITE,
                _ => info.type_mask |= QUERY_TYPE_WRITE,
            }
        }
    }
    collect_tables(tokens, info);
    scan_expressions(tokens, info);
}

/// Looks for variables and functions that change where a statement can go.
fn scan_expressions(tokens: &[Token], info: &mut QueryInfo) {
    for (i, tok) in tokens.iter().enumerate() {
        match tok {
            Token::UserVar(_) => {
                let assign = tokens.get(i + 1).map_or(false, |t| t.is_punct(':'))
                    && tokens.get(i + 2).map_or(false, |t| t.is_punct('='));
                let into = i > 0 && tokens[i - 1].is_keyword("INTO");
                if assign {
                    info.type_mask |= QUERY_TYPE_USERVAR_WRITE;
                } else if !into {
                    info.type_mask |= QUERY_TYPE_USERVAR_READ;
                }
            },
            Token::SysVar(name) => {
                let lower = name.to_ascii_lowercase();
                if lower == "identity" || lower == "last_insert_id" || lower == "last_gtid" {
                    info.type_mask |= QUERY_TYPE_MASTER_READ;
                } else if lower.starts_with("global.") {
                    info.type_mask |= QUERY_TYPE_GSYSVAR_READ;
                } else {
                    info.type_mask |= QUERY_TYPE_SYSVAR_READ;
                }
            },
            Token::Word(w) if tokens.get(i + 1).map_or(false, |t| t.is_punct('(')) => {
                let upper = w.to_ascii_uppercase();
                if MASTER_READ_FUNCTIONS.contains(&upper.as_str()) {
                    info.type_mask |= QUERY_TYPE_MASTER_READ;
                } else if WRITE_FUNCTIONS.contains(&upper.as_str()) {
                    info.type_mask |= QUERY_TYPE_WRITE;
                }
            },
            _ => (),
        }
    }
}

/// Reads a possibly qualified table name starting at tokens[i]
fn read_table_name(tokens: &[Token], i: usize) -> Option<(TableName, usize)> {
    let first = tokens.get(i)?.identifier()?;
    if tokens.get(i + 1).map_or(false, |t| t.is_punct('.')) {
        if let Some(table) = tokens.get(i + 2).and_then(|t| t.identifier()) {
            return Some((TableName { db: Some(first), table }, i + 3));
        }
    }
    Some((TableName { db: None, table: first }, i + 1))
}

fn push_table(name: TableName, info: &mut QueryInfo) {
    if name.table.eq_ignore_ascii_case("DUAL") {
        return;
    }
    if let Some(db) = &name.db {
        if !info.databases.contains(db) {
            info.databases.push(db.clone());
        }
    }
    if !info.tables.contains(&name) {
        info.tables.push(name);
    }
}

fn push_table_at(tokens: &[Token], i: usize, info: &mut QueryInfo) -> Option<TableName> {
    let (name, _) = read_table_name(tokens, i)?;
    push_table(name.clone(), info);
    Some(name)
}

/// Collects the tables that follow FROM and JOIN.
fn collect_tables(tokens: &[Token], info: &mut QueryInfo) {
    let mut depth = 0i32;
    let mut from_depth = None;
    let mut expect_table = false;
    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.is_punct('(') {
            depth += 1;
            expect_table = false;
        } else if tok.is_punct(')') {
            depth -= 1;
            if from_depth.map_or(false, |d| depth < d) {
                from_depth = None;
            }
        } else if tok.is_keyword("FROM") || tok.is_keyword("JOIN") || tok.is_keyword("STRAIGHT_JOIN") {
            expect_table = true;
            if tok.is_keyword("FROM") {
                from_depth = Some(depth);
            }
        } else if tok.is_punct(',') && from_depth == Some(depth) {
            expect_table = true;
        } else if FROM_LIST_END.iter().any(|k| tok.is_keyword(k)) {
            if from_depth == Some(depth) {
                from_depth = None;
            }
            expect_table = false;
        } else if expect_table {
            if tok.is_keyword("LATERAL") {
                i += 1;
                continue;
            }
            if let Some((name, next)) = read_table_name(tokens, i) {
                push_table(name, info);
                expect_table = false;
                i = next;
                continue;
            }
            expect_table = false;
        }
        i += 1;
    }
}

fn classify_create(rest: &[Token], info: &mut QueryInfo) {
    info.type_mask |= QUERY_TYPE_WRITE;
    info.operation = QueryOperation::Create;
    let mut j = 0;
    let mut temporary = false;
    while j < rest.len() {
        if rest[j].is_keyword("OR") || rest[j].is_keyword("REPLACE") {
            j += 1;
        } else if rest[j].is_keyword("TEMPORARY") {
            temporary = true;
            j += 1;
        } else {
            break;
        }
    }
    let kind = match rest.get(j) {
        Some(t) => t,
        None => return,
    };
    if kind.is_keyword("TABLE") {
        j += 1;
        if rest.get(j).map_or(false, |t| t.is_keyword("IF")) {
            j += 3; // IF NOT EXISTS
        }
        if let Some(name) = push_table_at(rest, j, info) {
            if temporary {
                info.type_mask |= QUERY_TYPE_CREATE_TMP_TABLE;
                info.created_tmp_tables.push(name);
            }
        }
        // CREATE TABLE ... SELECT reads its source tables
        collect_tables(&rest[j..], info);
    } else if kind.is_keyword("DATABASE") || kind.is_keyword("SCHEMA") {
        j += 1;
        if rest.get(j).map_or(false, |t| t.is_keyword("IF")) {
            j += 3;
        }
        if let Some(db) = rest.get(j).and_then(|t| t.identifier()) {
            info.databases.push(db);
        }
    }
}

fn classify_drop(rest: &[Token], info: &mut QueryInfo) {
    if rest.first().map_or(false, |t| t.is_keyword("PREPARE")) {
        info.type_mask |= QUERY_TYPE_DEALLOC_PREPARE;
        info.operation = QueryOperation::Deallocate;
        info.prepare_name = rest.get(1).and_then(|t| t.identifier());
        return;
    }
    info.type_mask |= QUERY_TYPE_WRITE;
    info.operation = QueryOperation::Drop;
    let mut j = 0;
    if rest.get(j).map_or(false, |t| t.is_keyword("TEMPORARY")) {
        j += 1;
    }
    match rest.get(j) {
        Some(t) if t.is_keyword("TABLE") || t.is_keyword("TABLES") => {
            j += 1;
            if rest.get(j).map_or(false, |t| t.is_keyword("IF")) {
                j += 2; // IF EXISTS
            }
            while let Some((name, next)) = read_table_name(rest, j) {
                push_table(name.clone(), info);
                info.dropped_tables.push(name);
                if rest.get(next).map_or(false, |t| t.is_punct(',')) {
                    j = next + 1;
                } else {
                    break;
                }
            }
        },
        Some(t) if t.is_keyword("DATABASE") || t.is_keyword("SCHEMA") => {
            j += 1;
            if rest.get(j).map_or(false, |t| t.is_keyword("IF")) {
                j += 2;
            }
            if let Some(db) = rest.get(j).and_then(|t| t.identifier()) {
                info.databases.push(db);
            }
        },
        _ => (),
    }
}

fn transaction_access_mode(tokens: &[Token]) -> u32 {
    let mut mask = 0;
    for (i, tok) in tokens.iter().enumerate() {
        if tok.is_keyword("READ") {
            match tokens.get(i + 1) {
                Some(t) if t.is_keyword("ONLY") => mask |= QUERY_TYPE_READONLY,
                Some(t) if t.is_keyword("WRITE") => mask |= QUERY_TYPE_READWRITE,
                _ => (),
            }
        }
    }
    mask
}

fn classify_set(rest: &[Token], info: &mut QueryInfo) {
    info.operation = QueryOperation::Set;
    let first = match rest.first() {
        Some(t) => t,
        None => {
            info.type_mask |= QUERY_TYPE_SESSION_WRITE;
            return;
        },
    };
    if first.is_keyword("STATEMENT") {
        // SET STATEMENT var=value FOR <statement>
        if let Some(j) = rest.iter().position(|t| t.is_keyword("FOR")) {
            classify_statement(&rest[j + 1..], info);
        }
        return;
    }
    if first.is_keyword("PASSWORD") {
        info.type_mask |= QUERY_TYPE_WRITE;
        return;
    }
    if first.is_keyword("TRANSACTION") {
        info.operation = QueryOperation::SetTransaction;
        info.type_mask |= QUERY_TYPE_SESSION_WRITE | QUERY_TYPE_NEXT_TRX | transaction_access_mode(rest);
        return;
    }
    if (first.is_keyword("SESSION") || first.is_keyword("LOCAL")) && rest.get(1).map_or(false, |t| t.is_keyword("TRANSACTION")) {
        info.operation = QueryOperation::SetTransaction;
        info.type_mask |= QUERY_TYPE_SESSION_WRITE;
        return;
    }
    if first.is_keyword("GLOBAL") && rest.get(1).map_or(false, |t| t.is_keyword("TRANSACTION")) {
        info.type_mask |= QUERY_TYPE_GSYSVAR_WRITE;
        return;
    }

    // a comma separated list of assignments
    let mut depth = 0;
    let mut start = 0;
    for i in 0..=rest.len() {
        let end = i == rest.len();
        if !end {
            if rest[i].is_punct('(') {
                depth += 1;
            } else if rest[i].is_punct(')') {
                depth -= 1;
            }
        }
        if end || (depth == 0 && rest[i].is_punct(',')) {
            classify_assignment(&rest[start..i], info);
            start = i + 1;
        }
    }
}

fn classify_assignment(tokens: &[Token], info: &mut QueryInfo) {
    let mut j = 0;
    let mut global = false;
    match tokens.first() {
        None => return,
        Some(t) if t.is_keyword("GLOBAL") => {
            global = true;
            j = 1;
        },
        Some(t) if t.is_keyword("SESSION") || t.is_keyword("LOCAL") => j = 1,
        _ => (),
    }
    let name = match tokens.get(j) {
        Some(Token::UserVar(_)) => {
            info.type_mask |= QUERY_TYPE_USERVAR_WRITE;
            scan_expressions(&tokens[j + 1..], info);
            return;
        },
        Some(Token::SysVar(name)) => {
            let lower = name.to_ascii_lowercase();
            if let Some(n) = lower.strip_prefix("global.") {
                global = true;
                n.to_string()
            } else {
                lower.strip_prefix("session.").or_else(|| lower.strip_prefix("local.")).unwrap_or(&lower).to_string()
            }
        },
        Some(Token::Word(w)) => w.to_ascii_lowercase(),
        _ => String::new(),
    };
    if global {
        info.type_mask |= QUERY_TYPE_GSYSVAR_WRITE;
        return;
    }
    info.type_mask |= QUERY_TYPE_SESSION_WRITE;
    if name == "autocommit" {
        // the value follows = or :=
        let value = tokens[j + 1..].iter().find_map(|t| match t {
            Token::Word(w) => Some(w.to_ascii_uppercase()),
            Token::Str(s) => Some(s.to_ascii_uppercase()),
            Token::Number(n) => Some(n.to_string()),
            _ => None,
        });
        match value.as_deref() {
            Some("ON") | Some("TRUE") | Some("1") => info.type_mask |= QUERY_TYPE_ENABLE_AUTOCOMMIT,
            Some("OFF") | Some("FALSE") | Some("0") => info.type_mask |= QUERY_TYPE_DISABLE_AUTOCOMMIT,
            _ => (),
        }
    }
    scan_expressions(&tokens[j + 1..], info);
}

fn classify_show(rest: &[Token], info: &mut QueryInfo) {
    info.type_mask |= QUERY_TYPE_READ;
    info.operation = QueryOperation::Show;
    let mut j = 0;
    while rest.get(j).map_or(false, |t| t.is_keyword("FULL") || t.is_keyword("GLOBAL") || t.is_keyword("SESSION")) {
        j += 1;
    }
    match rest.get(j) {
        Some(t) if t.is_keyword("DATABASES") || t.is_keyword("SCHEMAS") => info.type_mask |= QUERY_TYPE_SHOW_DATABASES,
        Some(t) if t.is_keyword("TABLES") => {
            info.type_mask |= QUERY_TYPE_SHOW_TABLES;
            if rest.get(j + 1).map_or(false, |t| t.is_keyword("FROM") || t.is_keyword("IN")) {
                if let Some(db) = rest.get(j + 2).and_then(|t| t.identifier()) {
                    info.databases.push(db);
                }
            }
        },
        Some(t) if t.is_keyword("MASTER") || t.is_keyword("BINLOG") => info.type_mask |= QUERY_TYPE_MASTER_READ,
        _ => (),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sluicedb::mysql::protocol::packet_builder::{query_packet, command_packet};

    fn classify(sql: &str) -> QueryInfo {
        SimpleClassifier::new().parse_sql(sql)
    }

    #[test]
    fn test_select() {
        let info = classify("SELECT a, b FROM db1.t1 JOIN t2 ON t1.id = t2.id WHERE x = 'y;z'");
        assert_eq!(info.type_mask(), QUERY_TYPE_READ);
        assert_eq!(info.operation(), QueryOperation::Select);
        assert_eq!(info.table_names(), vec!["db1.t1".to_string(), "t2".to_string()]);
        assert_eq!(info.database_names(), &["db1".to_string()]);
        assert!(!info.is_multi_stmt());
    }

    #[test]
    fn test_select_for_update() {
        assert!(classify("SELECT * FROM t WHERE id = 1 FOR UPDATE").is_type(QUERY_TYPE_WRITE));
        assert!(classify("select * from t lock in share mode").is_type(QUERY_TYPE_WRITE));
    }

    #[test]
    fn test_variables() {
        assert!(classify("SELECT @@server_id").is_type(QUERY_TYPE_SYSVAR_READ));
        assert!(classify("SELECT @@global.read_only").is_type(QUERY_TYPE_GSYSVAR_READ));
        assert!(classify("SELECT @a").is_type(QUERY_TYPE_USERVAR_READ));
        assert!(classify("SELECT LAST_INSERT_ID()").is_type(QUERY_TYPE_MASTER_READ));
        assert!(classify("SELECT GET_LOCK('a', 10)").is_type(QUERY_TYPE_WRITE));
        assert!(classify("SET @a = 1").is_type(QUERY_TYPE_USERVAR_WRITE));
        assert!(classify("SELECT 1 INTO @a").is_type(QUERY_TYPE_USERVAR_WRITE));
        assert!(classify("SET GLOBAL max_connections = 10").is_type(QUERY_TYPE_GSYSVAR_WRITE));
        assert!(classify("SET @@global.max_connections = 10").is_type(QUERY_TYPE_GSYSVAR_WRITE));
        assert_eq!(classify("SET NAMES utf8mb4").type_mask(), QUERY_TYPE_SESSION_WRITE);
        assert_eq!(classify("SET sql_mode = 'ANSI'").type_mask(), QUERY_TYPE_SESSION_WRITE);
    }

    #[test]
    fn test_autocommit() {
        assert!(classify("SET autocommit = OFF").is_type(QUERY_TYPE_DISABLE_AUTOCOMMIT));
        assert!(classify("SET @@session.autocommit = ON").is_type(QUERY_TYPE_ENABLE_AUTOCOMMIT));
        assert!(classify("set autocommit=0").is_type(QUERY_TYPE_DISABLE_AUTOCOMMIT));
        assert!(classify("set autocommit=1").is_type(QUERY_TYPE_ENABLE_AUTOCOMMIT));
    }

    #[test]
    fn test_transactions() {
        assert_eq!(classify("BEGIN").type_mask(), QUERY_TYPE_BEGIN_TRX);
        assert_eq!(classify("START TRANSACTION READ ONLY").type_mask(), QUERY_TYPE_BEGIN_TRX | QUERY_TYPE_READONLY);
        assert_eq!(classify("COMMIT").type_mask(), QUERY_TYPE_COMMIT);
        assert_eq!(classify("ROLLBACK").type_mask(), QUERY_TYPE_ROLLBACK);
        assert_eq!(classify("ROLLBACK TO SAVEPOINT a").type_mask(), QUERY_TYPE_WRITE);
        assert!(classify("SET TRANSACTION READ ONLY").is_type(QUERY_TYPE_NEXT_TRX | QUERY_TYPE_READONLY));
    }

    #[test]
    fn test_writes() {
        let info = classify("INSERT INTO db2.t3 (a) SELECT a FROM t4");
        assert!(info.is_type(QUERY_TYPE_WRITE));
        assert_eq!(info.operation(), QueryOperation::Insert);
        assert_eq!(info.table_names(), vec!["db2.t3".to_string(), "t4".to_string()]);
        assert_eq!(classify("UPDATE t SET a = 1").table_names(), vec!["t".to_string()]);
        assert_eq!(classify("DELETE FROM t WHERE a = 1").table_names(), vec!["t".to_string()]);
        assert!(classify("CALL proc()").is_sp_call());
        assert!(classify("FLUSH TABLES").is_type(QUERY_TYPE_WRITE));
    }

    #[test]
    fn test_temporary_tables() {
        let info = classify("CREATE TEMPORARY TABLE IF NOT EXISTS tmp1 (a INT)");
        assert!(info.is_type(QUERY_TYPE_CREATE_TMP_TABLE));
        assert_eq!(info.created_tmp_tables()[0].table, "tmp1");
        let info = classify("DROP TEMPORARY TABLE IF EXISTS tmp1, tmp2");
        assert_eq!(info.dropped_tables().len(), 2);
    }

    #[test]
    fn test_prepare_named() {
        let info = classify("PREPARE s1 FROM 'SELECT * FROM t WHERE a = ?'");
        assert_eq!(info.type_mask(), QUERY_TYPE_PREPARE_NAMED_STMT);
        assert_eq!(info.prepare_name(), Some("s1"));
        assert_eq!(info.prepare_type_mask(), QUERY_TYPE_READ);
        let info = classify("EXECUTE s1 USING @a");
        assert!(info.is_type(QUERY_TYPE_EXEC_STMT));
        assert_eq!(info.prepare_name(), Some("s1"));
        assert_eq!(classify("DEALLOCATE PREPARE s1").prepare_name(), Some("s1"));
        assert_eq!(classify("DROP PREPARE s1").type_mask(), QUERY_TYPE_DEALLOC_PREPARE);
    }

    #[test]
    fn test_show_and_use() {
        assert!(classify("SHOW DATABASES").is_type(QUERY_TYPE_SHOW_DATABASES));
        assert!(classify("SHOW FULL TABLES").is_type(QUERY_TYPE_SHOW_TABLES));
        let info = classify("USE `my db`");
        assert_eq!(info.type_mask(), QUERY_TYPE_SESSION_WRITE);
        assert_eq!(info.database_names(), &["my db".to_string()]);
    }

    #[test]
    fn test_multi_statement_and_comments() {
        let info = classify("SELECT 1; INSERT INTO t VALUES (1)");
        assert!(info.is_multi_stmt());
        assert!(info.is_type(QUERY_TYPE_READ) && info.is_type(QUERY_TYPE_WRITE));
        assert!(!classify("SELECT 1;").is_multi_stmt());
        assert_eq!(classify("/* INSERT */ SELECT 1 -- UPDATE\n").type_mask(), QUERY_TYPE_READ);
        assert!(classify("/*!40101 SET @saved = @@character_set_client */").is_type(QUERY_TYPE_USERVAR_WRITE));
    }

    #[test]
    fn test_packets() {
        let c = SimpleClassifier::new();
        assert_eq!(c.parse(&query_packet("SELECT 1")).type_mask(), QUERY_TYPE_READ);
        let mut prepare = vec![0x16u8];
        prepare.extend_from_slice(b"SELECT ?");
        let info = c.parse(&command_packet(&prepare));
        assert!(info.is_type(QUERY_TYPE_PREPARE_STMT) && info.is_type(QUERY_TYPE_READ));
        assert_eq!(get_sql(&query_packet("SELECT 2")), Some("SELECT 2"));
        assert_eq!(get_sql(&command_packet(&[0x0e])), None);
    }
}
