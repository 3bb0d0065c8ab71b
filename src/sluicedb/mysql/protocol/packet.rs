use std::fmt::{Display, Formatter};

use bytes::{BytesMut, Bytes, BufMut};

use crate::sluicedb::{Error, Result};


pub const HEADER_LEN: usize = 4;
/// A payload of exactly this length means another packet follows with the rest of it.
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FF_FF;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// payload length, excluding the 4 byte header
    pub len: u32,
    pub seq: u8,
}

impl Header {
    /// Returns the parsed packet Header, or None if there are fewer than 4 bytes.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(Header {
            len: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            seq: bytes[3],
        })
    }

    /// Returns the length of the packet including the header
    pub fn packet_len(&self) -> usize {
        self.len as usize + HEADER_LEN
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("packet(len={}, seq={})", self.len, self.seq))
    }
}

/// True if the packet is one part of a payload split over several packets.
pub fn is_large_payload(hdr: &Header) -> bool {
    hdr.len as usize == MAX_PAYLOAD_LEN
}

/// Appends a packet header for a payload of len bytes.
pub fn write_header(buf: &mut BytesMut, len: usize, seq: u8) {
    debug_assert!(len <= MAX_PAYLOAD_LEN);
    let b = (len as u32).to_le_bytes();
    buf.put_slice(&b[..3]);
    buf.put_u8(seq);
}

/// Returns the payload of a complete packet (everything after the header).
pub fn payload(packet: &[u8]) -> &[u8] {
    if packet.len() < HEADER_LEN {
        &[]
    } else {
        &packet[HEADER_LEN..]
    }
}

/// Returns the sequence number of a complete packet
pub fn sequence(packet: &[u8]) -> u8 {
    if packet.len() < HEADER_LEN { 0 } else { packet[3] }
}

/// Returns a copy of the packet with the sequence number replaced.
pub fn with_sequence(packet: &Bytes, seq: u8) -> Bytes {
    if sequence(packet) == seq {
        return packet.clone();
    }
    let mut buf = BytesMut::from(&packet[..]);
    buf[3] = seq;
    buf.freeze()
}

/// PacketReader buffers bytes from a socket and splits them into complete packets.
pub struct PacketReader {
    data: BytesMut,
    limit: usize,
}

impl PacketReader {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            limit: 0,
        }
    }

    /// Reject packets with a payload above limit bytes. 0 disables the check.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Returns the next complete packet, including its header.
    /// Ok(None) means more data is needed. An error is only returned for a
    /// packet that can never be valid, such as one above the configured limit.
    pub fn read_packet(&mut self) -> Result<Option<Bytes>> {
        let hdr = match Header::parse(&self.data) {
            Some(hdr) => hdr,
            None => return Ok(None),
        };
        if self.limit != 0 && hdr.len as usize > self.limit {
            return Err(Error::protocol_error(format!("{} exceeds the limit of {} bytes", hdr, self.limit)));
        }
        let packet_len = hdr.packet_len();
        if self.data.len() < packet_len {
            // Make sure buffer is large enough for the rest of this packet
            self.data.reserve(packet_len - self.data.len());
            return Ok(None);
        }
        Ok(Some(self.data.split_to(packet_len).freeze()))
    }

    /// Returns a mutable reference to the underlying BytesMut buffer.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Removes and returns all buffered bytes that haven't been read as packets.
    pub fn take_remaining(&mut self) -> Bytes {
        self.data.split().freeze()
    }
}
