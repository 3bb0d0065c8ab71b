use serde::{Deserialize};
use strum::Display;

#[derive(Deserialize, Display, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    // Disabled do not use TLS
    Disabled,
    // Allowed clients may send an SSLRequest, but are not required to
    Allowed,
    // Required clients that don't send an SSLRequest are rejected with "Access without SSL denied"
    Required,
}

impl Default for TlsMode {
    fn default() -> Self {
        TlsMode::Disabled
    }
}

/// How read targets are scored once the candidates are narrowed down to the best priority tier.
#[derive(Deserialize, Display, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionCriteria {
    LeastCurrentConnections,
    LeastBehindMaster,
    LeastCurrentOperations,
    AdaptiveRouting,
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        SelectionCriteria::LeastCurrentOperations
    }
}

#[derive(Deserialize, Display, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MasterFailureMode {
    // FailInstantly closes the session as soon as the master is lost
    FailInstantly,
    // FailOnWrite closes the session when a write is attempted without a master
    FailOnWrite,
    // ErrorOnWrite answers writes with a read-only error and keeps the session open
    ErrorOnWrite,
}

impl Default for MasterFailureMode {
    fn default() -> Self {
        MasterFailureMode::FailInstantly
    }
}

#[derive(Deserialize, Display, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CausalReads {
    None,
    // Fast only routes reads to replicas that have replicated the session's last write
    Fast,
    // FastGlobal uses the latest write seen by any session of the service
    FastGlobal,
}

impl Default for CausalReads {
    fn default() -> Self {
        CausalReads::None
    }
}

#[derive(Deserialize, Display, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UserAccountsFileUsage {
    // AddWhenLoadOk merges the file into the accounts loaded from the servers
    AddWhenLoadOk,
    // FileOnlyAlways never queries the servers
    FileOnlyAlways,
}

impl Default for UserAccountsFileUsage {
    fn default() -> Self {
        UserAccountsFileUsage::AddWhenLoadOk
    }
}

#[derive(Deserialize, Display, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SqlVariablesIn {
    Master,
    All,
}

impl Default for SqlVariablesIn {
    fn default() -> Self {
        SqlVariablesIn::All
    }
}

/// Static server status used when no monitor is running.
#[derive(Deserialize, Display, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StaticStatus {
    Master,
    Slave,
    Down,
}
