use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::sluicedb::{Error, ErrorType, Result};
use crate::sluicedb::config::CONNECT_TIMEOUT_SECONDS;
use crate::sluicedb::mysql::protocol::{PacketReader, InitialHandshake, HandshakeResponse, AuthSwitchRequest};
use crate::sluicedb::mysql::protocol::capabilities::*;
use crate::sluicedb::mysql::protocol::packet::{payload, sequence};
use crate::sluicedb::mysql::protocol::packet_builder::PacketBuilder;
use crate::sluicedb::mysql::protocol::scramble::{scramble_phase2, scramble_password, Phase2Token, NATIVE_PASSWORD_PLUGIN};
use crate::sluicedb::mysql::protocol::tracker::parse_err_packet;

/// Capabilities the proxy asks backends for, before intersecting with what the server offers
pub const BACKEND_CAPABILITIES: u32 = CLIENT_LONG_FLAG
    | CLIENT_FOUND_ROWS
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_LOCAL_FILES
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_CONNECT_ATTRS
    | CLIENT_SESSION_TRACK;

const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// A TCP connection to a server that reads whole packets.
pub struct PacketStream {
    stream: TcpStream,
    reader: PacketReader,
}

impl PacketStream {
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = match timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS), TcpStream::connect(address)).await {
            Ok(r) => r.map_err(|e| Error::backend(ErrorType::Transient, format!("connect to {} failed: {}", address, e)))?,
            Err(_) => return Err(Error::backend(ErrorType::Transient, format!("connect to {} timed out", address))),
        };
        stream.set_nodelay(true)?;
        Ok(Self { stream, reader: PacketReader::new(16 * 1024) })
    }

    /// Returns a buffered packet without reading from the socket.
    pub fn next_buffered(&mut self) -> Result<Option<Bytes>> {
        self.reader.read_packet()
    }

    pub async fn read_packet(&mut self) -> Result<Bytes> {
        loop {
            if let Some(packet) = self.reader.read_packet()? {
                return Ok(packet);
            }
            self.fill().await?;
        }
    }

    /// Reads more data into the buffer. A closed socket is an error.
    pub async fn fill(&mut self) -> Result<()> {
        let n = self.stream.read_buf(self.reader.bytes_mut()).await?;
        if n == 0 {
            return Err(Error::closed());
        }
        Ok(())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.map_err(Error::from)
    }
}

/// How a login proves its identity.
#[derive(Clone, Copy)]
pub enum Credentials<'a> {
    Password(&'a str),
    /// SHA1(password) of a client the proxy logs in for
    Phase2(Option<&'a Phase2Token>),
}

impl<'a> Credentials<'a> {
    fn token(&self, scramble: &[u8]) -> Vec<u8> {
        match self {
            Credentials::Password(pw) => scramble_password(scramble, pw),
            Credentials::Phase2(Some(p)) => scramble_phase2(scramble, p).to_vec(),
            Credentials::Phase2(None) => Vec::new(),
        }
    }
}

pub struct LoginOptions<'a> {
    pub user: &'a str,
    pub credentials: Credentials<'a>,
    pub db: &'a str,
    pub charset: u8,
    /// Asked for on top of the proxy's own, masked by what the server supports
    pub capabilities: u32,
    pub extended_capabilities: u32,
    pub attributes: Bytes,
}

/// The outcome of a successful login
pub struct Session {
    pub greeting: InitialHandshake,
    pub capabilities: u32,
}

/// Classifies an ERR packet received while logging in.
pub fn login_error(packet: &[u8]) -> Error {
    match parse_err_packet(payload(packet)) {
        Ok(e) => {
            // wrong credentials or an unknown database won't get better by retrying
            let ty = match e.code {
                1044 | 1045 | 1049 | 1524 | 1698 => ErrorType::Permanent,
                _ => ErrorType::Transient,
            };
            Error::backend(ty, format!("#{} {}", e.code, e.message))
        },
        Err(e) => e,
    }
}

/// Builds the reply to an AuthSwitchRequest, or fails for plugins the proxy can't speak.
pub fn auth_switch_response(packet: &[u8], credentials: Credentials) -> Result<Bytes> {
    let switch = AuthSwitchRequest::parse(payload(packet))?;
    if switch.plugin != NATIVE_PASSWORD_PLUGIN {
        return Err(Error::backend(ErrorType::Permanent, format!("server asked for unsupported auth plugin {}", switch.plugin)));
    }
    let mut b = PacketBuilder::new(sequence(packet).wrapping_add(1));
    b.write_bytes(&credentials.token(&switch.data));
    Ok(b.finish())
}

/// Reads the server greeting and logs in.
pub async fn login(stream: &mut PacketStream, opts: &LoginOptions<'_>) -> Result<Session> {
    let packet = stream.read_packet().await?;
    if payload(&packet).first() == Some(&0xff) {
        return Err(login_error(&packet));
    }
    let greeting = InitialHandshake::parse(payload(&packet))
        .map_err(|e| Error::backend(ErrorType::Transient, e))?;
    let capabilities = (BACKEND_CAPABILITIES | opts.capabilities) & greeting.capabilities
        & !(CLIENT_SSL | CLIENT_COMPRESS);
    let response = HandshakeResponse {
        capabilities,
        extended_capabilities: opts.extended_capabilities & greeting.extended_capabilities,
        max_packet_size: MAX_PACKET_SIZE,
        charset: opts.charset,
        user: opts.user.to_string(),
        auth_token: opts.credentials.token(&greeting.scramble),
        database: opts.db.to_string(),
        auth_plugin: NATIVE_PASSWORD_PLUGIN.to_string(),
        attributes: opts.attributes.clone(),
    };
    stream.write_all(&response.build(sequence(&packet).wrapping_add(1))).await?;

    loop {
        let packet = stream.read_packet().await?;
        match payload(&packet).first() {
            Some(0x00) => {
                debug!(thread_id = greeting.thread_id, server_version = %greeting.server_version, "logged in to server");
                return Ok(Session { greeting, capabilities });
            },
            Some(0xff) => return Err(login_error(&packet)),
            Some(0xfe) => {
                let reply = auth_switch_response(&packet, opts.credentials)?;
                stream.write_all(&reply).await?;
            },
            Some(0x01) => {
                // extra auth data, mysql_native_password never sends it
                return Err(Error::backend(ErrorType::Permanent, "unexpected auth more data packet"));
            },
            _ => return Err(Error::backend(ErrorType::Transient, "unexpected packet during login")),
        }
    }
}
