use tracing::trace;

use crate::sluicedb::mysql::protocol::capabilities::*;
use crate::sluicedb::mysql::protocol::command::Command;
use crate::sluicedb::mysql::protocol::packet::{Header, MAX_PAYLOAD_LEN, payload};
use crate::sluicedb::mysql::protocol::payload::PayloadReader;
use crate::sluicedb::mysql::protocol::reply::{Reply, ReplyState, ReplyError};
use crate::sluicedb::{Error, Result};

/// ReplyTracker follows the server packets of the command in flight and updates
/// a Reply. It only looks at the packets, they're forwarded unchanged.
pub struct ReplyTracker {
    reply: Reply,
    capabilities: u32,
    fields_left: u64,
    prepare_left: u32,
    // inside a payload split over several packets
    large: bool,
    // COM_FIELD_LIST responses are column definitions followed by an EOF, no rows
    field_list: bool,
}

impl ReplyTracker {
    /// capabilities are those negotiated with the server
    pub fn new(capabilities: u32) -> Self {
        Self {
            reply: Reply::default(),
            capabilities,
            fields_left: 0,
            prepare_left: 0,
            large: false,
            field_list: false,
        }
    }

    pub fn set_capabilities(&mut self, capabilities: u32) {
        self.capabilities = capabilities;
    }

    /// Begins tracking the response to the command packet.
    pub fn start(&mut self, packet: &[u8]) {
        let cmd = payload(packet).first().cloned().unwrap_or(0);
        self.reply = Reply::new(cmd);
        self.fields_left = 0;
        self.prepare_left = 0;
        self.large = false;
        self.field_list = false;
        match Command::from_u8(cmd) {
            Some(c) if !c.will_respond() => self.reply.state = ReplyState::Done,
            Some(Command::StmtFetch) => self.reply.state = ReplyState::RsetRows,
            Some(Command::FieldList) => {
                self.field_list = true;
                self.reply.state = ReplyState::RsetColdef;
                self.fields_left = u64::MAX;
            },
            _ => (),
        }
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn is_complete(&self) -> bool {
        self.reply.is_complete()
    }

    pub fn state(&self) -> ReplyState {
        self.reply.state
    }

    fn deprecate_eof(&self) -> bool {
        self.capabilities & CLIENT_DEPRECATE_EOF != 0
    }

    /// Processes one complete server packet, header included.
    pub fn process(&mut self, packet: &[u8]) -> Result<()> {
        let hdr = Header::parse(packet).ok_or_else(|| Error::protocol_error("truncated packet"))?;
        self.reply.size += packet.len() as u64;
        let was_large = self.large;
        self.large = hdr.len as usize == MAX_PAYLOAD_LEN;
        if was_large {
            // continuation of a row or column definition already counted
            return Ok(());
        }
        let data = payload(packet);
        let first = data.first().cloned().unwrap_or(0);

        match self.reply.state {
            ReplyState::Start | ReplyState::LoadData => self.process_first(data, first),
            ReplyState::RsetColdef => {
                if self.field_list && (first == 0xfe && data.len() < 9 || first == 0xff) {
                    return self.process_end_of_rows(data, first);
                }
                self.fields_left = self.fields_left.saturating_sub(1);
                if self.fields_left == 0 {
                    self.reply.state = if self.deprecate_eof() { ReplyState::RsetRows } else { ReplyState::RsetColdefEof };
                }
                Ok(())
            },
            ReplyState::RsetColdefEof => {
                if first != 0xfe {
                    return Err(Error::protocol_error(format!("expected EOF after column definitions, got 0x{:02x}", first)));
                }
                self.reply.state = ReplyState::RsetRows;
                Ok(())
            },
            ReplyState::RsetRows => {
                if first == 0xff || self.is_end_of_rows(data, first) {
                    self.process_end_of_rows(data, first)
                } else {
                    self.reply.row_count += 1;
                    Ok(())
                }
            },
            ReplyState::Prepare => {
                self.prepare_left = self.prepare_left.saturating_sub(1);
                if self.prepare_left == 0 {
                    self.reply.state = ReplyState::Done;
                }
                Ok(())
            },
            ReplyState::Done => {
                Err(Error::protocol_error(format!("unexpected packet from server after a complete response (0x{:02x})", first)))
            },
        }
    }

    fn is_end_of_rows(&self, data: &[u8], first: u8) -> bool {
        if first != 0xfe {
            return false;
        }
        if self.deprecate_eof() {
            data.len() < MAX_PAYLOAD_LEN
        } else {
            data.len() < 9
        }
    }

    fn process_first(&mut self, data: &[u8], first: u8) -> Result<()> {
        let cmd = Command::from_u8(self.reply.command);
        match first {
            0x00 if cmd == Some(Command::StmtPrepare) => self.process_prepare_ok(data),
            0x00 => self.process_ok(data),
            0xff => self.process_err(data),
            0xfb if cmd == Some(Command::Query) => {
                self.reply.state = ReplyState::LoadData;
                Ok(())
            },
            0xfe if data.len() < 9 => {
                // EOF answers COM_SET_OPTION and a few legacy commands
                let r = PayloadReader::new(data);
                r.skip(1);
                self.reply.warnings = r.read_u16();
                self.reply.server_status = r.read_u16();
                self.reply.state = ReplyState::Done;
                Ok(())
            },
            _ if cmd == Some(Command::Statistics) => {
                self.reply.state = ReplyState::Done;
                Ok(())
            },
            _ => {
                let r = PayloadReader::new(data);
                let n = r.read_lenenc_int();
                r.error()?;
                if n == 0 {
                    return Err(Error::protocol_error("resultset with zero columns"));
                }
                self.reply.field_counts.push(n);
                self.fields_left = n;
                self.reply.state = ReplyState::RsetColdef;
                Ok(())
            },
        }
    }

    fn process_end_of_rows(&mut self, data: &[u8], first: u8) -> Result<()> {
        if first == 0xff {
            return self.process_err(data);
        }
        if self.deprecate_eof() && !self.field_list {
            // OK packet with an EOF header
            self.process_ok(data)?;
        } else {
            let r = PayloadReader::new(data);
            r.skip(1);
            self.reply.warnings = r.read_u16();
            self.reply.server_status = r.read_u16();
            self.finish_result();
        }
        Ok(())
    }

    fn finish_result(&mut self) {
        if self.reply.server_status & SERVER_MORE_RESULTS_EXIST != 0 {
            self.reply.state = ReplyState::Start;
        } else {
            self.reply.state = ReplyState::Done;
        }
    }

    fn process_ok(&mut self, data: &[u8]) -> Result<()> {
        let r = PayloadReader::new(data);
        r.skip(1);
        self.reply.affected_rows = r.read_lenenc_int();
        self.reply.last_insert_id = r.read_lenenc_int();
        self.reply.server_status = r.read_u16();
        self.reply.warnings = r.read_u16();
        r.error()?;
        if self.capabilities & CLIENT_SESSION_TRACK != 0 && r.remaining() > 0 {
            let _info = r.read_lenenc_bytes()?;
            if self.reply.server_status & SERVER_SESSION_STATE_CHANGED != 0 && r.remaining() > 0 {
                let state = r.read_lenenc_bytes()?;
                self.process_session_state(state)?;
            }
        }
        self.finish_result();
        Ok(())
    }

    fn process_session_state(&mut self, state: &[u8]) -> Result<()> {
        let r = PayloadReader::new(state);
        while r.remaining() > 0 {
            let ty = r.read_u8();
            let data = PayloadReader::new(r.read_lenenc_bytes()?);
            match ty {
                SESSION_TRACK_SYSTEM_VARIABLES => {
                    let name = String::from_utf8_lossy(data.read_lenenc_bytes()?).into_owned();
                    let value = String::from_utf8_lossy(data.read_lenenc_bytes()?).into_owned();
                    trace!(%name, %value, "session variable changed");
                    self.reply.variables.push((name, value));
                },
                SESSION_TRACK_SCHEMA => {
                    self.reply.schema = Some(String::from_utf8_lossy(data.read_lenenc_bytes()?).into_owned());
                },
                SESSION_TRACK_GTIDS => {
                    let _encoding = data.read_u8();
                    self.reply.last_gtid = Some(String::from_utf8_lossy(data.read_lenenc_bytes()?).into_owned());
                },
                SESSION_TRACK_TRANSACTION_TYPE => {
                    let value = String::from_utf8_lossy(data.read_lenenc_bytes()?).into_owned();
                    self.reply.variables.push(("trx_state".to_string(), value));
                },
                SESSION_TRACK_TRANSACTION_CHARACTERISTICS => {
                    let value = String::from_utf8_lossy(data.read_lenenc_bytes()?).into_owned();
                    self.reply.variables.push(("trx_characteristics".to_string(), value));
                },
                _ => (), // SESSION_TRACK_STATE_CHANGE and unknown types
            }
        }
        Ok(())
    }

    fn process_err(&mut self, data: &[u8]) -> Result<()> {
        self.reply.error = parse_err_packet(data)?;
        self.reply.state = ReplyState::Done;
        Ok(())
    }

    fn process_prepare_ok(&mut self, data: &[u8]) -> Result<()> {
        let r = PayloadReader::new(data);
        r.skip(1);
        self.reply.generated_id = r.read_u32();
        let columns = r.read_u16() as u32;
        let params = r.read_u16() as u32;
        r.skip(1);
        self.reply.warnings = r.read_u16();
        r.error()?;
        self.reply.param_count = params as u16;
        let eof = if self.deprecate_eof() { 0 } else { 1 };
        let mut left = 0;
        if params > 0 {
            left += params + eof;
        }
        if columns > 0 {
            left += columns + eof;
        }
        self.prepare_left = left;
        self.reply.state = if left == 0 { ReplyState::Done } else { ReplyState::Prepare };
        Ok(())
    }
}

/// Parses the payload of an ERR packet.
pub fn parse_err_packet(data: &[u8]) -> Result<ReplyError> {
    let r = PayloadReader::new(data);
    if r.read_u8() != 0xff {
        return Err(Error::protocol_error("not an ERR packet"));
    }
    let code = r.read_u16();
    r.error()?;
    let mut sql_state = String::new();
    if r.peek() == Some(b'#') {
        r.skip(1);
        sql_state = String::from_utf8_lossy(r.read_bytes(5)?).into_owned();
    }
    let message = String::from_utf8_lossy(r.read_to_end()).into_owned();
    Ok(ReplyError { code, sql_state, message })
}

/// Returns true if the packet is an ERR packet
pub fn is_err_packet(packet: &[u8]) -> bool {
    payload(packet).first() == Some(&0xff)
}

/// Returns true if the packet is an OK packet
pub fn is_ok_packet(packet: &[u8]) -> bool {
    payload(packet).first() == Some(&0x00)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BytesMut, BufMut};
    use crate::sluicedb::mysql::protocol::packet_builder::{PacketBuilder, ok_packet, err_packet, eof_packet, query_packet, command_packet};

    fn column_def(seq: u8) -> bytes::Bytes {
        let mut b = PacketBuilder::new(seq);
        b.write_lenenc_bytes(b"def").write_lenenc_bytes(b"db").write_lenenc_bytes(b"t")
            .write_lenenc_bytes(b"t").write_lenenc_bytes(b"c").write_lenenc_bytes(b"c")
            .write_u8(0x0c).write_u16(33).write_u32(11).write_u8(3).write_u16(0).write_u8(0).write_u16(0);
        b.finish()
    }

    fn row(seq: u8, v: &[u8]) -> bytes::Bytes {
        let mut b = PacketBuilder::new(seq);
        b.write_lenenc_bytes(v);
        b.finish()
    }

    fn column_count(seq: u8, n: u64) -> bytes::Bytes {
        let mut b = PacketBuilder::new(seq);
        b.write_lenenc_int(n);
        b.finish()
    }

    #[test]
    fn test_ok_reply() {
        let mut t = ReplyTracker::new(CLIENT_PROTOCOL_41);
        t.start(&query_packet("SET autocommit=1"));
        t.process(&ok_packet(1, 0, 0, SERVER_STATUS_AUTOCOMMIT, 0, None)).unwrap();
        assert!(t.is_complete());
        assert!(t.reply().is_ok());
    }

    #[test]
    fn test_err_reply() {
        let mut t = ReplyTracker::new(CLIENT_PROTOCOL_41);
        t.start(&query_packet("SELECT * FROM nope"));
        t.process(&err_packet(1, 1146, "42S02", "Table 'test.nope' doesn't exist")).unwrap();
        assert!(t.is_complete());
        assert!(!t.reply().is_ok());
        assert_eq!(t.reply().error().code, 1146);
        assert_eq!(t.reply().error().sql_state, "42S02");
    }

    #[test]
    fn test_resultset_with_eof() {
        let mut t = ReplyTracker::new(CLIENT_PROTOCOL_41);
        t.start(&query_packet("SELECT c FROM t"));
        t.process(&column_count(1, 1)).unwrap();
        assert_eq!(t.state(), ReplyState::RsetColdef);
        t.process(&column_def(2)).unwrap();
        assert_eq!(t.state(), ReplyState::RsetColdefEof);
        t.process(&eof_packet(3, 0, 0)).unwrap();
        assert_eq!(t.state(), ReplyState::RsetRows);
        t.process(&row(4, b"a")).unwrap();
        t.process(&row(5, b"b")).unwrap();
        t.process(&eof_packet(6, 0, SERVER_STATUS_AUTOCOMMIT)).unwrap();
        assert!(t.is_complete());
        assert!(!t.reply().is_ok());
        assert_eq!(t.reply().row_count(), 2);
        assert_eq!(t.reply().field_counts(), &[1]);
    }

    #[test]
    fn test_multi_resultset_deprecate_eof() {
        let mut t = ReplyTracker::new(CLIENT_PROTOCOL_41 | CLIENT_DEPRECATE_EOF);
        t.start(&query_packet("SELECT 1; SELECT 2"));
        t.process(&column_count(1, 1)).unwrap();
        t.process(&column_def(2)).unwrap();
        assert_eq!(t.state(), ReplyState::RsetRows);
        t.process(&row(3, b"1")).unwrap();
        let mut end = BytesMut::new();
        end.put_slice(&ok_packet(4, 0, 0, SERVER_MORE_RESULTS_EXIST, 0, None));
        end[4] = 0xfe;
        t.process(&end).unwrap();
        assert_eq!(t.state(), ReplyState::Start);
        t.process(&column_count(5, 1)).unwrap();
        t.process(&column_def(6)).unwrap();
        t.process(&row(7, b"2")).unwrap();
        let mut end = BytesMut::new();
        end.put_slice(&ok_packet(8, 0, 0, 0, 0, None));
        end[4] = 0xfe;
        t.process(&end).unwrap();
        assert!(t.is_complete());
        assert_eq!(t.reply().field_counts(), &[1, 1]);
        assert_eq!(t.reply().row_count(), 2);
    }

    #[test]
    fn test_prepare_reply() {
        let mut t = ReplyTracker::new(CLIENT_PROTOCOL_41);
        t.start(&command_packet(b"\x16SELECT ? FROM t WHERE c = ?"));
        let mut b = PacketBuilder::new(1);
        b.write_u8(0).write_u32(7).write_u16(1).write_u16(2).write_u8(0).write_u16(0);
        t.process(&b.finish()).unwrap();
        assert_eq!(t.state(), ReplyState::Prepare);
        assert_eq!(t.reply().generated_id(), 7);
        assert_eq!(t.reply().param_count(), 2);
        // 2 params + EOF + 1 column + EOF
        for seq in 2..7 {
            assert!(!t.is_complete());
            t.process(&column_def(seq)).unwrap();
        }
        assert!(t.is_complete());
        assert!(t.reply().is_ok());
    }

    #[test]
    fn test_load_data_local() {
        let mut t = ReplyTracker::new(CLIENT_PROTOCOL_41);
        t.start(&query_packet("LOAD DATA LOCAL INFILE 'x' INTO TABLE t"));
        t.process(&command_packet(b"\xfbx")).unwrap();
        assert_eq!(t.state(), ReplyState::LoadData);
        t.process(&ok_packet(3, 10, 0, 0, 0, None)).unwrap();
        assert!(t.reply().is_ok());
        assert_eq!(t.reply().affected_rows(), 10);
    }

    #[test]
    fn test_session_track() {
        let mut state = BytesMut::new();
        let mut var = BytesMut::new();
        crate::sluicedb::mysql::protocol::packet_builder::put_lenenc_bytes(&mut var, b"autocommit");
        crate::sluicedb::mysql::protocol::packet_builder::put_lenenc_bytes(&mut var, b"OFF");
        state.put_u8(SESSION_TRACK_SYSTEM_VARIABLES);
        crate::sluicedb::mysql::protocol::packet_builder::put_lenenc_bytes(&mut state, &var);
        let mut gtid = BytesMut::new();
        gtid.put_u8(0);
        crate::sluicedb::mysql::protocol::packet_builder::put_lenenc_bytes(&mut gtid, b"0-1-42");
        state.put_u8(SESSION_TRACK_GTIDS);
        crate::sluicedb::mysql::protocol::packet_builder::put_lenenc_bytes(&mut state, &gtid);

        let mut t = ReplyTracker::new(CLIENT_PROTOCOL_41 | CLIENT_SESSION_TRACK);
        t.start(&query_packet("INSERT INTO t VALUES (1)"));
        t.process(&ok_packet(1, 1, 0, 0, 0, Some(&state))).unwrap();
        assert!(t.reply().is_ok());
        assert_eq!(t.reply().get_variable("autocommit"), Some("OFF"));
        assert_eq!(t.reply().last_gtid(), Some("0-1-42"));
    }

    #[test]
    fn test_no_response_commands() {
        let mut t = ReplyTracker::new(CLIENT_PROTOCOL_41);
        t.start(&command_packet(&[0x19, 1, 0, 0, 0]));
        assert!(t.is_complete());
        assert!(t.process(&ok_packet(1, 0, 0, 0, 0, None)).is_err());
    }

    #[test]
    fn test_field_list() {
        let mut t = ReplyTracker::new(CLIENT_PROTOCOL_41);
        t.start(&command_packet(b"\x04t\0"));
        t.process(&column_def(1)).unwrap();
        t.process(&column_def(2)).unwrap();
        assert!(!t.is_complete());
        t.process(&eof_packet(3, 0, 0)).unwrap();
        assert!(t.is_complete());
    }
}
