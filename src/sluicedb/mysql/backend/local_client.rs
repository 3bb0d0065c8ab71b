use bytes::Bytes;
use tracing::debug;

use crate::sluicedb::{Error, Result};
use crate::sluicedb::mysql::backend::login::{PacketStream, LoginOptions, Credentials, login};
use crate::sluicedb::mysql::protocol::{PayloadReader, ReplyTracker, ReplyState};
use crate::sluicedb::mysql::protocol::capabilities::DEFAULT_CHARSET;
use crate::sluicedb::mysql::protocol::packet::payload;
use crate::sluicedb::mysql::protocol::packet_builder::{query_packet, command_packet};

/// The rows of a text protocol resultset. NULL is None.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// The value of column name in row i, None if the column is missing or NULL
    pub fn get(&self, i: usize, name: &str) -> Option<&str> {
        let col = self.column_index(name)?;
        self.rows.get(i)?.get(col)?.as_deref()
    }
}

/// A plain client connection the proxy uses for its own queries: loading users,
/// monitoring and KILL. Not shared with sessions.
pub struct LocalClient {
    stream: PacketStream,
    capabilities: u32,
    thread_id: u32,
    server_version: String,
}

impl LocalClient {
    pub async fn connect(address: &str, user: &str, password: &str, db: &str) -> Result<Self> {
        let mut stream = PacketStream::connect(address).await?;
        let opts = LoginOptions {
            user,
            credentials: Credentials::Password(password),
            db,
            charset: DEFAULT_CHARSET,
            capabilities: 0,
            extended_capabilities: 0,
            attributes: Bytes::new(),
        };
        let session = login(&mut stream, &opts).await?;
        debug!(address, thread_id = session.greeting.thread_id, "local client connected");
        Ok(Self {
            stream,
            capabilities: session.capabilities,
            thread_id: session.greeting.thread_id,
            server_version: session.greeting.server_version,
        })
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Runs sql and collects the rows of its first resultset. Later resultsets are read and dropped.
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet> {
        let packet = query_packet(sql);
        let mut tracker = ReplyTracker::new(self.capabilities);
        tracker.start(&packet);
        self.stream.write_all(&packet).await?;

        let mut rs = ResultSet::default();
        let mut resultsets = 0;
        loop {
            let packet = self.stream.read_packet().await?;
            let before = tracker.state();
            tracker.process(&packet)?;
            match before {
                ReplyState::Start => {
                    if tracker.state() == ReplyState::LoadData {
                        return Err(Error::new("LOAD DATA LOCAL is not supported by the local client"));
                    }
                    if tracker.reply().is_resultset() {
                        resultsets = tracker.reply().field_counts().len();
                    }
                },
                ReplyState::RsetColdef if resultsets == 1 => rs.columns.push(column_name(payload(&packet))?),
                ReplyState::RsetRows if resultsets == 1 && tracker.state() == ReplyState::RsetRows => {
                    rs.rows.push(text_row(payload(&packet), rs.columns.len())?);
                },
                _ => (),
            }
            if tracker.is_complete() {
                break;
            }
        }
        let err = tracker.reply().error();
        if err.is_set() {
            return Err(Error::new(format!("query failed: #{} {}", err.code, err.message)));
        }
        Ok(rs)
    }

    /// Runs a statement that returns no rows.
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.query(sql).await.map(|_| ())
    }

    /// Sends COM_QUIT. The server closes the connection.
    pub async fn close(mut self) {
        let _ = self.stream.write_all(&command_packet(&[0x01])).await;
    }
}

fn column_name(data: &[u8]) -> Result<String> {
    let r = PayloadReader::new(data);
    // catalog, schema, table, org_table, then name
    for _ in 0..4 {
        r.read_lenenc_bytes()?;
    }
    Ok(r.read_lenenc_str()?.to_string())
}

fn text_row(data: &[u8], columns: usize) -> Result<Vec<Option<String>>> {
    let r = PayloadReader::new(data);
    let mut row = Vec::with_capacity(columns);
    for _ in 0..columns {
        row.push(r.read_lenenc_bytes_opt()?.map(|b| String::from_utf8_lossy(b).into_owned()));
    }
    Ok(row)
}
