use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error};

use crate::sluicedb::{Error, Result};
use crate::sluicedb::config::LISTEN_BACKLOG;


pub struct Listener {
    pub address: String,
    listener: TcpListener,
}

impl Listener {
    /// Binds address. With reuseport every worker binds its own socket to the same
    /// address and the kernel spreads the connections. Must run inside a tokio runtime.
    pub fn new(address: String, reuseport: bool) -> Result<Self> {
        let addr: SocketAddr = address.parse()?;
        let sock = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        sock.set_reuseaddr(true)?;
        #[cfg(unix)]
        {
            if reuseport {
                sock.set_reuseport(true)?;
            }
        }
        sock.bind(addr)?;
        let listener = sock.listen(LISTEN_BACKLOG)?;
        Ok(Self {
            address,
            listener,
        })
    }

    /// Wraps a listener shared between the workers.
    pub fn from_std(address: String, listener: std::net::TcpListener) -> Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            address,
            listener: TcpListener::from_std(listener)?,
        })
    }

    /// Binds the one listening socket all workers accept from when reuseport is off.
    pub fn bind_shared(address: &str) -> Result<std::net::TcpListener> {
        let listener = std::net::TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns the next connection, or None once the socket is closed.
    pub async fn accept(&self) -> Option<(TcpStream, SocketAddr)> {
        loop {
            match self.listener.accept().await {
                Ok((sock, remote_addr)) => {
                    debug!(%remote_addr, server = %self.address.as_str(), "accept connection");
                    if let Err(e) = sock.set_nodelay(true) {
                        debug!(%e, %remote_addr, "could not set TCP_NODELAY");
                    }
                    return Some((sock, remote_addr));
                },
                Err(e) => {
                    // Give up only if it's not one of several known recoverable errors.
                    match e.raw_os_error().unwrap_or(0) {
                        libc::ECONNABORTED |
                        libc::EMFILE | // process file-descriptor limit
                        libc::ENFILE | // system wide file-descriptor limit
                        libc::ENOBUFS | // out of memory
                        libc::ENOMEM | // out of memory
                        libc::EPROTO | // protocol error
                        libc::EINTR => {
                            error!(%e, "accept error");
                            if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                                // wait for descriptors to be released instead of spinning
                                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                            }
                            continue;
                        },
                        libc::EBADF => return None, // socket closed
                        _ => {
                            error!(server = %self.address.as_str(), error = %Error::from(e), "unrecoverable accept error");
                            return None;
                        },
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accept() {
        let listener = Listener::new("127.0.0.1:0".to_string(), false).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (_sock, remote) = listener.accept().await.expect("accepted connection");
        assert!(remote.ip().is_loopback());
        assert!(client.await.unwrap().is_ok());
    }
}
