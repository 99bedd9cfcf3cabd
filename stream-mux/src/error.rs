use std::sync::Arc;

use crate::header::HeaderParseError;
use crate::role::Role;

/// Error establishing a session or the reason a session terminated.
///
/// The error is cloneable so that every task blocked on the session observes
/// the same termination reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Failed to write the session preface
    #[error("Failed to write the session preface")]
    PrefaceWrite(#[source] Arc<std::io::Error>),
    /// Failed to read the session preface from the peer
    #[error("Failed to read the session preface")]
    PrefaceRead(#[source] Arc<std::io::Error>),
    /// The peer did not answer the preface in time
    #[error("Timed out waiting for the session preface")]
    PrefaceTimeout,
    /// The peer does not speak the session protocol
    #[error("Invalid session preface {preface:?}")]
    InvalidPreface { preface: [u8; 4] },
    /// Both ends of the connection were configured with the same role
    #[error("Both peers are configured as {role}")]
    RoleConflict { role: Role },
    /// The peers disagree on whether the session is bidirectional
    #[error("Peers disagree on bidirectional streams (local {local}, remote {remote})")]
    ConfigMismatch { local: bool, remote: bool },
    /// The operation is not available for the session role
    #[error("Operation requires the {required} role but the session is the {actual}")]
    WrongRole { required: Role, actual: Role },
    /// Reading from or writing to the connection failed
    #[error("Connection failed")]
    Io(#[source] Arc<std::io::Error>),
    /// The peer sent an invalid frame header
    #[error("Received invalid frame header")]
    InvalidHeader(#[source] HeaderParseError),
    /// The peer violated the protocol
    #[error("Protocol violation: {0}")]
    Protocol(&'static str),
    /// The peer did not answer a keepalive ping
    #[error("Keepalive timed out")]
    KeepaliveTimeout,
    /// The peer closed the session or the connection
    #[error("Session closed by peer")]
    RemoteClosed,
    /// The session was closed locally
    #[error("Session closed")]
    Closed,
}

impl SessionError {
    pub(crate) fn io(error: std::io::Error) -> Self {
        Self::Io(Arc::new(error))
    }

    /// Convert the error for stream I/O calls that fail because the session terminated.
    pub(crate) fn to_io_error(&self) -> std::io::Error {
        let kind = match self {
            SessionError::Closed => std::io::ErrorKind::NotConnected,
            SessionError::RemoteClosed | SessionError::Io(_) => std::io::ErrorKind::ConnectionAborted,
            SessionError::KeepaliveTimeout => std::io::ErrorKind::TimedOut,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, self.clone())
    }
}
