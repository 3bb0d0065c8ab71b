use std::sync::OnceLock;

use regex::Regex;
use strum::Display;

/// KILL [HARD|SOFT] [CONNECTION|QUERY] kills the whole connection unless QUERY is given.
#[derive(Display, Debug, Clone, Copy, Eq, PartialEq)]
pub enum KillType {
    Connection,
    Query,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum KillTarget {
    /// A session id as the client sees it
    Id(u64),
    /// Every session of a user
    User(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KillRequest {
    pub target: KillTarget,
    pub kill_type: KillType,
    /// None, "HARD" or "SOFT", passed on to the servers
    pub hardness: Option<&'static str>,
}

impl KillRequest {
    /// The statement to run on a server, for a backend thread id (or the user).
    pub fn backend_statement(&self, thread_id: u64) -> String {
        let mut sql = String::from("KILL ");
        if let Some(h) = self.hardness {
            sql.push_str(h);
            sql.push(' ');
        }
        sql.push_str(match self.kill_type {
            KillType::Connection => "CONNECTION ",
            KillType::Query => "QUERY ",
        });
        match &self.target {
            KillTarget::Id(_) => sql.push_str(&thread_id.to_string()),
            KillTarget::User(user) => {
                sql.push_str("USER ");
                sql.push_str(user);
            },
        }
        sql
    }
}

/// Statements the client connection handles itself instead of routing blindly.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SpecialStatement {
    Use(String),
    /// SET ROLE, None for SET ROLE NONE
    SetRole(Option<String>),
    Kill(KillRequest),
}

fn special_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:(?:USE\s+(`[^`]+`|\S+?))|(?:SET\s+ROLE\s+(`[^`]+`|\S+?))|(?:KILL\s+(HARD\s+|SOFT\s+)?(CONNECTION\s+|QUERY\s+(ID\s+)?)?(\d+|USER\s+\S+?)))\s*;?\s*$")
            .expect("special statement regex is valid")
    })
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    for q in ['`', '\'', '"'] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// Matches USE, SET ROLE and KILL statements. Returns None for anything else,
/// including KILL QUERY ID which names a server query id, not a session.
pub fn parse_special_statement(sql: &str) -> Option<SpecialStatement> {
    // cheap pre-check, almost every query fails it
    let head = sql.trim_start().as_bytes();
    if head.len() < 3 || !matches!(head[0].to_ascii_uppercase(), b'U' | b'S' | b'K') {
        return None;
    }
    let caps = special_regex().captures(sql)?;
    if let Some(db) = caps.get(1) {
        return Some(SpecialStatement::Use(unquote(db.as_str())));
    }
    if let Some(role) = caps.get(2) {
        let role = unquote(role.as_str());
        if role.eq_ignore_ascii_case("NONE") {
            return Some(SpecialStatement::SetRole(None));
        }
        return Some(SpecialStatement::SetRole(Some(role)));
    }
    if caps.get(5).is_some() {
        return None;
    }
    let target = caps.get(6)?.as_str();
    let hardness = caps.get(3).map(|h| {
        if h.as_str().trim().eq_ignore_ascii_case("HARD") { "HARD" } else { "SOFT" }
    });
    let kill_type = match caps.get(4) {
        Some(m) if m.as_str().trim().eq_ignore_ascii_case("QUERY") => KillType::Query,
        _ => KillType::Connection,
    };
    let target = if target.len() > 4 && target[..4].eq_ignore_ascii_case("USER") {
        KillTarget::User(unquote(&target[4..]))
    } else {
        KillTarget::Id(target.parse().ok()?)
    };
    Some(SpecialStatement::Kill(KillRequest { target, kill_type, hardness }))
}
