use bytes::{BytesMut, Bytes, BufMut};

use crate::sluicedb::mysql::protocol::packet::{write_header, MAX_PAYLOAD_LEN};
use crate::sluicedb::mysql::protocol::error_codes::ErrorCode;
use crate::sluicedb::mysql::protocol::capabilities::SERVER_SESSION_STATE_CHANGED;


/// PacketBuilder builds a payload and frames it as one or more packets.
pub struct PacketBuilder {
    payload: BytesMut,
    seq: u8,
}

impl PacketBuilder {
    pub fn new(seq: u8) -> Self {
        Self {
            payload: BytesMut::with_capacity(64),
            seq,
        }
    }

    pub fn write_u8(&mut self, b: u8) -> &mut Self {
        self.payload.put_u8(b);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.payload.put_u16_le(v);
        self
    }

    pub fn write_u24(&mut self, v: u32) -> &mut Self {
        self.payload.put_slice(&v.to_le_bytes()[..3]);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.payload.put_u32_le(v);
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.payload.put_u64_le(v);
        self
    }

    pub fn write_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.payload.put_slice(b);
        self
    }

    pub fn write_zeros(&mut self, n: usize) -> &mut Self {
        self.payload.put_bytes(0, n);
        self
    }

    pub fn write_null_terminated(&mut self, s: &[u8]) -> &mut Self {
        self.payload.put_slice(s);
        self.payload.put_u8(0);
        self
    }

    pub fn write_lenenc_int(&mut self, v: u64) -> &mut Self {
        put_lenenc_int(&mut self.payload, v);
        self
    }

    pub fn write_lenenc_bytes(&mut self, b: &[u8]) -> &mut Self {
        put_lenenc_int(&mut self.payload, b.len() as u64);
        self.payload.put_slice(b);
        self
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Frames the payload, splitting it into several packets if it's too large for one.
    pub fn finish(self) -> Bytes {
        frame_payload(&self.payload, self.seq).freeze()
    }
}

pub fn put_lenenc_int(buf: &mut BytesMut, v: u64) {
    if v < 251 {
        buf.put_u8(v as u8);
    } else if v < (1 << 16) {
        buf.put_u8(0xfc);
        buf.put_u16_le(v as u16);
    } else if v < (1 << 24) {
        buf.put_u8(0xfd);
        buf.put_slice(&(v as u32).to_le_bytes()[..3]);
    } else {
        buf.put_u8(0xfe);
        buf.put_u64_le(v);
    }
}

pub fn put_lenenc_bytes(buf: &mut BytesMut, b: &[u8]) {
    put_lenenc_int(buf, b.len() as u64);
    buf.put_slice(b);
}

/// Frames payload into packets starting at sequence number seq. A payload that is an
/// exact multiple of the maximum size is terminated by an empty packet.
pub fn frame_payload(payload: &[u8], mut seq: u8) -> BytesMut {
    let mut buf = BytesMut::with_capacity(payload.len() + 4 * (1 + payload.len() / MAX_PAYLOAD_LEN));
    let mut rest = payload;
    loop {
        let n = rest.len().min(MAX_PAYLOAD_LEN);
        write_header(&mut buf, n, seq);
        buf.put_slice(&rest[..n]);
        rest = &rest[n..];
        seq = seq.wrapping_add(1);
        if n < MAX_PAYLOAD_LEN {
            break;
        }
    }
    buf
}

/// Builds an OK packet. session_state is the already encoded session state
/// information, which is sent if the client negotiated CLIENT_SESSION_TRACK.
pub fn ok_packet(seq: u8, affected_rows: u64, last_insert_id: u64, mut status: u16, warnings: u16, session_state: Option<&[u8]>) -> Bytes {
    let mut b = PacketBuilder::new(seq);
    if session_state.is_some() {
        status |= SERVER_SESSION_STATE_CHANGED;
    }
    b.write_u8(0)
        .write_lenenc_int(affected_rows)
        .write_lenenc_int(last_insert_id)
        .write_u16(status)
        .write_u16(warnings);
    if let Some(state) = session_state {
        b.write_lenenc_bytes(b"").write_lenenc_bytes(state);
    }
    b.finish()
}

pub fn err_packet(seq: u8, code: u16, sql_state: &str, message: &str) -> Bytes {
    let mut b = PacketBuilder::new(seq);
    b.write_u8(0xff)
        .write_u16(code)
        .write_u8(b'#')
        .write_bytes(&sql_state.as_bytes()[..sql_state.len().min(5)])
        .write_bytes(message.as_bytes());
    b.finish()
}

pub fn error_code_packet(seq: u8, ec: &ErrorCode, message: &str) -> Bytes {
    err_packet(seq, ec.code, ec.sql_state, message)
}

pub fn eof_packet(seq: u8, warnings: u16, status: u16) -> Bytes {
    let mut b = PacketBuilder::new(seq);
    b.write_u8(0xfe).write_u16(warnings).write_u16(status);
    b.finish()
}

/// AuthSwitchRequest asking the client to authenticate with plugin using the given data.
pub fn auth_switch_request(seq: u8, plugin: &str, data: &[u8]) -> Bytes {
    let mut b = PacketBuilder::new(seq);
    b.write_u8(0xfe)
        .write_null_terminated(plugin.as_bytes())
        .write_null_terminated(data);
    b.finish()
}

/// A COM_QUERY packet for sql
pub fn query_packet(sql: &str) -> Bytes {
    let mut b = PacketBuilder::new(0);
    b.write_u8(0x03).write_bytes(sql.as_bytes());
    b.finish()
}

/// A packet with an arbitrary payload and sequence number 0
pub fn command_packet(payload: &[u8]) -> Bytes {
    frame_payload(payload, 0).freeze()
}
