//! Sources of connections for the server and the client.
//!
//! [crate::serve] accepts connections from a [Listener] and [crate::Client]
//! obtains a fresh connection from a [Dialer] for every call. Both are
//! implemented for plain TCP here. Other crates implement them for virtual
//! streams of a multiplexed connection.
use futures::prelude::*;

/// Source of inbound connections.
#[async_trait::async_trait]
pub trait Listener: Send + Sync {
    type Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Wait for the next inbound connection.
    ///
    /// An error means that the listener will not produce any more connections.
    async fn accept(&self) -> Result<Self::Connection, Self::Error>;
}

/// Source of outbound connections.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    type Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn dial(&self) -> Result<Self::Connection, Self::Error>;
}

#[async_trait::async_trait]
impl Listener for async_std::net::TcpListener {
    type Connection = async_std::net::TcpStream;
    type Error = std::io::Error;

    async fn accept(&self) -> Result<Self::Connection, Self::Error> {
        let (stream, peer_addr) = async_std::net::TcpListener::accept(self).await?;
        tracing::debug!(%peer_addr, "accepted connection");
        Ok(stream)
    }
}

/// [Dialer] that opens a new TCP connection to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl ToString) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    type Connection = async_std::net::TcpStream;
    type Error = std::io::Error;

    async fn dial(&self) -> Result<Self::Connection, Self::Error> {
        async_std::net::TcpStream::connect(self.addr.as_str()).await
    }
}
