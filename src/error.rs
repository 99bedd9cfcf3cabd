use std::time::Duration;
use stream_mux::SessionError;

/// Failed to obtain the physical connection of a tunnel.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Failed to connect to {addr}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Timed out connecting to {addr} after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("Failed to listen on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to accept a connection on {addr}")]
    Accept {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// The loop serving inbound calls could not accept another stream.
#[derive(Debug, thiserror::Error)]
#[error("Failed to accept stream")]
pub struct StreamAcceptError(#[source] pub SessionError);

/// Terminal failure of [crate::Tunnel::run].
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to establish connection")]
    Connect(#[from] ConnectError),
    #[error("Session failed")]
    Session(#[from] SessionError),
    #[error("Stopped serving calls")]
    StreamAccept(#[from] StreamAcceptError),
}

impl TunnelError {
    /// The reason the session failed, if the tunnel failed after the
    /// connection was established.
    pub fn session_error(&self) -> Option<&SessionError> {
        match self {
            TunnelError::Connect(_) => None,
            TunnelError::Session(error) => Some(error),
            TunnelError::StreamAccept(StreamAcceptError(error)) => Some(error),
        }
    }
}
