use bytes::Bytes;

use crate::sluicedb::{Error, Result};
use crate::sluicedb::mysql::protocol::capabilities::*;
use crate::sluicedb::mysql::protocol::packet_builder::PacketBuilder;
use crate::sluicedb::mysql::protocol::payload::PayloadReader;
use crate::sluicedb::mysql::protocol::scramble::{SCRAMBLE_LEN, NATIVE_PASSWORD_PLUGIN, Scramble};

pub const PROTOCOL_VERSION: u8 = 10;
/// The payload length of an SSLRequest: the fixed part of a HandshakeResponse41
pub const SSL_REQUEST_LEN: usize = 32;

/// The initial handshake packet (HandshakeV10) sent by a server.
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Scramble,
    pub capabilities: u32,
    pub extended_capabilities: u32,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin: String,
}

impl InitialHandshake {
    pub fn build(&self, seq: u8) -> Bytes {
        let mut b = PacketBuilder::new(seq);
        b.write_u8(PROTOCOL_VERSION)
            .write_null_terminated(self.server_version.as_bytes())
            .write_u32(self.thread_id)
            .write_bytes(&self.scramble[..8])
            .write_u8(0)
            .write_u16(self.capabilities as u16)
            .write_u8(self.charset)
            .write_u16(self.status)
            .write_u16((self.capabilities >> 16) as u16)
            .write_u8(SCRAMBLE_LEN as u8 + 1)
            .write_zeros(6);
        if self.capabilities & CLIENT_MYSQL == 0 {
            b.write_u32(self.extended_capabilities);
        } else {
            b.write_zeros(4);
        }
        b.write_bytes(&self.scramble[8..])
            .write_u8(0)
            .write_null_terminated(self.auth_plugin.as_bytes());
        b.finish()
    }

    /// Parses the handshake sent by a backend server.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let r = PayloadReader::new(payload);
        let version = r.read_u8();
        if version == 0xff {
            r.skip(2);
            let msg = String::from_utf8_lossy(r.read_to_end()).into_owned();
            return Err(Error::protocol_error(format!("server refused connection: {}", msg)));
        }
        if version != PROTOCOL_VERSION {
            return Err(Error::protocol_error(format!("unsupported protocol version {}", version)));
        }
        let server_version = r.read_str()?.to_string();
        let thread_id = r.read_u32();
        let mut scramble = [0u8; SCRAMBLE_LEN];
        scramble[..8].copy_from_slice(r.read_bytes(8)?);
        r.skip(1);
        let mut capabilities = r.read_u16() as u32;
        let charset = r.read_u8();
        let status = r.read_u16();
        capabilities |= (r.read_u16() as u32) << 16;
        let auth_data_len = r.read_u8() as usize;
        r.skip(6);
        // MariaDB servers send their extended capabilities here, MySQL servers send filler
        let extended_capabilities = r.read_u32();
        let rest_len = if auth_data_len > 8 { (auth_data_len - 8).max(13) } else { 13 };
        let rest = r.read_bytes(rest_len.min(r.remaining()))?;
        let n = rest.len().min(12);
        scramble[8..8 + n].copy_from_slice(&rest[..n]);
        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 && r.remaining() > 0 {
            r.read_str_or_eof()?.to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };
        r.error()?;
        Ok(Self {
            server_version,
            thread_id,
            scramble,
            capabilities,
            extended_capabilities: if capabilities & CLIENT_MYSQL == 0 { extended_capabilities } else { 0 },
            charset,
            status,
            auth_plugin,
        })
    }
}

/// A HandshakeResponse41 from a client, or built by the proxy for a backend.
#[derive(Debug, Clone, Default)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub extended_capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: String,
    pub auth_token: Vec<u8>,
    pub database: String,
    pub auth_plugin: String,
    /// the raw connection attributes, without the length prefix
    pub attributes: Bytes,
}

impl HandshakeResponse {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let r = PayloadReader::new(payload);
        let capabilities = r.read_u32();
        if capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::protocol_error("client does not support protocol 4.1"));
        }
        let max_packet_size = r.read_u32();
        let charset = r.read_u8();
        r.skip(19);
        let extended_capabilities = r.read_u32();
        r.error()?;
        let user = r.read_str()?.to_string();
        let auth_token = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            r.read_lenenc_bytes()?.to_vec()
        } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.read_u8() as usize;
            r.read_bytes(len)?.to_vec()
        } else {
            r.read_null_terminated_bytes()?.to_vec()
        };
        let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && r.remaining() > 0 {
            r.read_str_or_eof()?.to_string()
        } else {
            String::new()
        };
        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 && r.remaining() > 0 {
            r.read_str_or_eof()?.to_string()
        } else {
            String::new()
        };
        let attributes = if capabilities & CLIENT_CONNECT_ATTRS != 0 && r.remaining() > 0 {
            Bytes::copy_from_slice(r.read_lenenc_bytes()?)
        } else {
            Bytes::new()
        };
        r.error()?;
        Ok(Self {
            capabilities,
            extended_capabilities,
            max_packet_size,
            charset,
            user,
            auth_token,
            database,
            auth_plugin,
            attributes,
        })
    }

    pub fn build(&self, seq: u8) -> Bytes {
        let mut caps = self.capabilities | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        if self.database.is_empty() {
            caps &= !CLIENT_CONNECT_WITH_DB;
        } else {
            caps |= CLIENT_CONNECT_WITH_DB;
        }
        if self.attributes.is_empty() {
            caps &= !CLIENT_CONNECT_ATTRS;
        }
        let mut b = PacketBuilder::new(seq);
        b.write_u32(caps)
            .write_u32(self.max_packet_size)
            .write_u8(self.charset)
            .write_zeros(19)
            .write_u32(self.extended_capabilities)
            .write_null_terminated(self.user.as_bytes());
        if caps & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            b.write_lenenc_bytes(&self.auth_token);
        } else {
            b.write_u8(self.auth_token.len() as u8).write_bytes(&self.auth_token);
        }
        if caps & CLIENT_CONNECT_WITH_DB != 0 {
            b.write_null_terminated(self.database.as_bytes());
        }
        let plugin = if self.auth_plugin.is_empty() { NATIVE_PASSWORD_PLUGIN } else { &self.auth_plugin };
        b.write_null_terminated(plugin.as_bytes());
        if caps & CLIENT_CONNECT_ATTRS != 0 {
            b.write_lenenc_bytes(&self.attributes);
        }
        b.finish()
    }

    /// Decodes the connection attributes into (key, value) pairs.
    pub fn attribute_pairs(&self) -> Result<Vec<(String, String)>> {
        parse_attributes(&self.attributes)
    }
}

pub fn parse_attributes(attrs: &[u8]) -> Result<Vec<(String, String)>> {
    let r = PayloadReader::new(attrs);
    let mut pairs = Vec::new();
    while r.remaining() > 0 {
        let key = r.read_lenenc_str()?.to_string();
        let value = r.read_lenenc_str()?.to_string();
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// An SSLRequest is a truncated HandshakeResponse41 with CLIENT_SSL set.
pub fn is_ssl_request(payload: &[u8]) -> bool {
    if payload.len() != SSL_REQUEST_LEN {
        return false;
    }
    let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    caps & CLIENT_SSL != 0
}

pub fn build_ssl_request(capabilities: u32, extended_capabilities: u32, charset: u8) -> Bytes {
    let mut b = PacketBuilder::new(1);
    b.write_u32(capabilities | CLIENT_SSL | CLIENT_PROTOCOL_41)
        .write_u32(0x0100_0000)
        .write_u8(charset)
        .write_zeros(19)
        .write_u32(extended_capabilities);
    b.finish()
}

/// COM_CHANGE_USER from a client, or built by the proxy for a backend.
#[derive(Debug, Clone, Default)]
pub struct ChangeUserRequest {
    pub user: String,
    pub auth_token: Vec<u8>,
    pub database: String,
    pub charset: u16,
    pub auth_plugin: String,
    pub attributes: Bytes,
}

impl ChangeUserRequest {
    /// Parses the payload of a COM_CHANGE_USER packet, including the command byte.
    pub fn parse(payload: &[u8], client_capabilities: u32) -> Result<Self> {
        let r = PayloadReader::new(payload);
        if r.read_u8() != 0x11 {
            return Err(Error::protocol_error("not a COM_CHANGE_USER packet"));
        }
        let user = r.read_str()?.to_string();
        let auth_token = if client_capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.read_u8() as usize;
            r.read_bytes(len)?.to_vec()
        } else {
            r.read_null_terminated_bytes()?.to_vec()
        };
        let database = r.read_str_or_eof()?.to_string();
        let mut req = Self {
            user,
            auth_token,
            database,
            charset: 0,
            auth_plugin: String::new(),
            attributes: Bytes::new(),
        };
        if r.remaining() >= 2 {
            req.charset = r.read_u16();
        }
        if client_capabilities & CLIENT_PLUGIN_AUTH != 0 && r.remaining() > 0 {
            req.auth_plugin = r.read_str_or_eof()?.to_string();
        }
        if client_capabilities & CLIENT_CONNECT_ATTRS != 0 && r.remaining() > 0 {
            req.attributes = Bytes::copy_from_slice(r.read_lenenc_bytes()?);
        }
        r.error()?;
        Ok(req)
    }

    pub fn build(&self, capabilities: u32) -> Bytes {
        let mut b = PacketBuilder::new(0);
        b.write_u8(0x11)
            .write_null_terminated(self.user.as_bytes())
            .write_u8(self.auth_token.len() as u8)
            .write_bytes(&self.auth_token)
            .write_null_terminated(self.database.as_bytes())
            .write_u16(self.charset);
        let plugin = if self.auth_plugin.is_empty() { NATIVE_PASSWORD_PLUGIN } else { &self.auth_plugin };
        b.write_null_terminated(plugin.as_bytes());
        if capabilities & CLIENT_CONNECT_ATTRS != 0 {
            b.write_lenenc_bytes(&self.attributes);
        }
        b.finish()
    }
}

/// AuthSwitchRequest sent by a server: 0xfe, plugin name, plugin data.
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let r = PayloadReader::new(payload);
        if r.read_u8() != 0xfe {
            return Err(Error::protocol_error("not an AuthSwitchRequest"));
        }
        let plugin = r.read_str_or_eof()?.to_string();
        let mut data = r.read_to_end().to_vec();
        if data.last() == Some(&0) {
            data.pop();
        }
        Ok(Self { plugin, data })
    }
}
