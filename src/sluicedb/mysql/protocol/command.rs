use strum::Display;

/// The first payload byte of a client command packet.
#[derive(Display, Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    StmtBulkExecute = 0xfa,
}

impl Command {
    pub fn from_u8(b: u8) -> Option<Command> {
        use Command::*;
        Some(match b {
            0x00 => Sleep,
            0x01 => Quit,
            0x02 => InitDb,
            0x03 => Query,
            0x04 => FieldList,
            0x05 => CreateDb,
            0x06 => DropDb,
            0x07 => Refresh,
            0x08 => Shutdown,
            0x09 => Statistics,
            0x0a => ProcessInfo,
            0x0b => Connect,
            0x0c => ProcessKill,
            0x0d => Debug,
            0x0e => Ping,
            0x0f => Time,
            0x10 => DelayedInsert,
            0x11 => ChangeUser,
            0x12 => BinlogDump,
            0x13 => TableDump,
            0x14 => ConnectOut,
            0x15 => RegisterSlave,
            0x16 => StmtPrepare,
            0x17 => StmtExecute,
            0x18 => StmtSendLongData,
            0x19 => StmtClose,
            0x1a => StmtReset,
            0x1b => SetOption,
            0x1c => StmtFetch,
            0x1d => Daemon,
            0x1e => BinlogDumpGtid,
            0x1f => ResetConnection,
            0xfa => StmtBulkExecute,
            _ => return None,
        })
    }

    /// False for the commands the server never answers.
    pub fn will_respond(&self) -> bool {
        !matches!(self, Command::StmtSendLongData | Command::StmtClose | Command::Quit)
    }

    /// True for the binary protocol commands that carry a statement id in payload bytes 1..5
    pub fn has_statement_id(&self) -> bool {
        matches!(self,
            Command::StmtExecute | Command::StmtSendLongData | Command::StmtClose |
            Command::StmtReset | Command::StmtFetch | Command::StmtBulkExecute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_from_u8() {
        assert_eq!(Command::from_u8(0x03), Some(Command::Query));
        assert_eq!(Command::from_u8(0xfa), Some(Command::StmtBulkExecute));
        assert_eq!(Command::from_u8(0x40), None);
        assert!(!Command::StmtClose.will_respond());
        assert!(Command::StmtPrepare.will_respond());
        assert!(Command::StmtFetch.has_statement_id());
    }
}
