//! Datagram transport adapter.
//!
//! The core makes no assumption of reliability or ordering: every datagram
//! is one self-contained frame (header plus complete payload). This module
//! wraps a UDP socket behind the small surface the engine consumes:
//! connect, listen, send one datagram, receive one datagram, cancel.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::MAX_DATAGRAM_SIZE;

/// Poll interval while waiting for connect readiness.
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default connect readiness bound.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(crate::DEFAULT_CONNECT_TIMEOUT_SECS);

/// Build a nonblocking UDP socket bound to `addr`.
fn bind_socket(addr: SocketAddrV4) -> std::io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_reuse_address(true)?;

    #[cfg(target_os = "macos")]
    socket.set_reuse_port(true)?;

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// A client-side datagram channel to one peer.
#[derive(Debug)]
pub struct Connection {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    cancel: CancellationToken,
}

impl Connection {
    /// Open a channel to `endpoint` with the default readiness bound.
    ///
    /// # Errors
    ///
    /// See [`Connection::connect_with_timeout`].
    pub async fn connect(endpoint: SocketAddr) -> Result<Self> {
        Self::connect_with_timeout(endpoint, CONNECT_TIMEOUT).await
    }

    /// Open a channel to `endpoint`, polling for readiness in 100 ms steps
    /// until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when readiness is not reached in time; the
    /// last bind/connect failure is logged.
    pub async fn connect_with_timeout(endpoint: SocketAddr, timeout: Duration) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match Self::try_connect(endpoint).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    if tokio::time::Instant::now() + CONNECT_POLL_INTERVAL > deadline {
                        tracing::warn!(%endpoint, error = %e, "Connect readiness bound elapsed");
                        return Err(Error::Timeout(timeout.as_secs()));
                    }
                    tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn try_connect(endpoint: SocketAddr) -> Result<Self> {
        let std_socket = bind_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| Error::ConnectionFailed(format!("cannot bind local socket: {e}")))?;

        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| Error::ConnectionFailed(format!("cannot register socket: {e}")))?;

        socket
            .connect(endpoint)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("cannot connect to {endpoint}: {e}")))?;

        Ok(Self {
            socket: Arc::new(socket),
            peer: endpoint,
            cancel: CancellationToken::new(),
        })
    }

    /// The remote endpoint.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send one datagram.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] when the channel is cancelled or
    /// the send fails.
    pub async fn send(&self, datagram: &[u8]) -> Result<()> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                Err(Error::ConnectionFailed("connection cancelled".to_string()))
            }
            sent = self.socket.send(datagram) => {
                sent?;
                Ok(())
            }
        }
    }

    /// Receive one datagram, blocking until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] for a zero-length datagram and
    /// [`Error::ConnectionFailed`] when the channel is cancelled.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                Err(Error::ConnectionFailed("connection cancelled".to_string()))
            }
            received = self.socket.recv(&mut buf) => {
                let n = received?;
                if n == 0 {
                    return Err(Error::InvalidPacket("zero-length datagram".to_string()));
                }
                buf.truncate(n);
                Ok(buf)
            }
        }
    }

    /// Receive one datagram, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when nothing arrives in time, otherwise as
    /// [`Connection::recv`].
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| Error::Timeout(timeout.as_secs()))?
    }

    /// Tear the channel down. Idempotent; pending sends and receives fail
    /// with a transport error.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`Connection::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A server-side datagram socket accepting frames from any peer.
#[derive(Debug)]
pub struct Listener {
    socket: Arc<UdpSocket>,
}

impl Listener {
    /// Bind the server socket on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] when the OS refuses the bind.
    pub fn bind(port: u16) -> Result<Self> {
        let std_socket = bind_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .map_err(|e| Error::ConnectionFailed(format!("cannot bind port {port}: {e}")))?;

        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| Error::ConnectionFailed(format!("cannot register socket: {e}")))?;

        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// The bound local address.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS cannot report the address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive one datagram from any peer.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the socket.
    pub async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, addr) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }

    /// Send one datagram to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the socket.
    pub async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> Result<()> {
        self.socket.send_to(datagram, addr).await?;
        Ok(())
    }

    /// A cloneable handle to the underlying socket, for reply tasks.
    #[must_use]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}
