use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
use rustls::{Certificate, PrivateKey, ServerConfig, ServerConnection};
use tracing::info;

use crate::sluicedb::{Error, Result};
use crate::sluicedb::config::{TlsConfig, TlsMode};

/// Builds the server side TLS configuration for client connections, None if TLS is disabled.
pub fn load_tls_config(config: &TlsConfig) -> Result<Option<Arc<ServerConfig>>> {
    if config.mode == TlsMode::Disabled {
        return Ok(None);
    }
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;
    let server_config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    info!(cert_path = %config.cert_path.display(), mode = %config.mode, "client tls enabled");
    Ok(Some(Arc::new(server_config)))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(Error::new(format!("no certificates found in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);
    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::PKCS8Key(key)) | Some(rustls_pemfile::Item::RSAKey(key)) => return Ok(PrivateKey(key)),
            Some(_) => continue,
            None => return Err(Error::new(format!("no private key found in {}", path.display()))),
        }
    }
}

/// The TLS layer of a client connection, driven without owning the socket:
/// ciphertext goes in with read_tls and comes out of take_output.
pub struct TlsSession {
    conn: ServerConnection,
}

impl TlsSession {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self> {
        Ok(Self { conn: ServerConnection::new(config)? })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Decrypts data received from the socket, appending the plaintext to plain.
    pub fn read_tls(&mut self, mut data: &[u8], plain: &mut BytesMut) -> Result<()> {
        while !data.is_empty() {
            let n = self.conn.read_tls(&mut data)?;
            if n == 0 {
                break;
            }
            let state = self.conn.process_new_packets()?;
            let available = state.plaintext_bytes_to_read();
            if available > 0 {
                let start = plain.len();
                plain.resize(start + available, 0);
                self.conn.reader().read_exact(&mut plain[start..])?;
            }
            if state.peer_has_closed() {
                return Err(Error::closed());
            }
        }
        Ok(())
    }

    /// Encrypts plaintext for the client. It's sent with the next take_output.
    pub fn write_plain(&mut self, data: &[u8]) -> Result<()> {
        self.conn.writer().write_all(data)?;
        Ok(())
    }

    /// Moves the pending ciphertext, handshake messages included, to out.
    pub fn take_output(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(out)?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.conn.send_close_notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_disabled_tls_needs_no_files() {
        let config = TlsConfig::default();
        assert!(load_tls_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_missing_certificate_is_an_error() {
        let config = TlsConfig {
            mode: TlsMode::Required,
            cert_path: PathBuf::from("/nonexistent/sluicedb.crt"),
            key_path: PathBuf::from("/nonexistent/sluicedb.key"),
        };
        assert!(load_tls_config(&config).is_err());
    }
}
