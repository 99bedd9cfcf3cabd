use std::time::Duration;

use crate::packet_stream::NextPacketError;

/// Protocol or application error that is send between peers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, thiserror::Error)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[error("{name}: {message}")]
pub struct Error {
    pub name: String,
    pub message: String,
}

impl Error {
    pub fn new(name: impl ToString, message: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn method_not_found(method: &[String]) -> Self {
        Self::new(
            "METHOD_NOT_FOUND",
            format!("Method \"{}\" not found", method.join(".")),
        )
    }

    pub(crate) fn invalid_arguments(error: serde_json::Error) -> Self {
        Self::new(
            "ArgumentError",
            format!("Failed to deserialize arguments {}", error),
        )
    }
}

/// Error returned by the call methods of [crate::Client].
///
/// A call error only concerns the call that returned it. The client and the
/// connection source it dials are still usable afterwards.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Failed to open a connection for the call")]
    Dial(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("Call did not complete within {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("Remote peer responded with an error")]
    Remote(#[source] Error),
    #[error("Failed to send the call")]
    Io(#[source] std::io::Error),
    #[error("Failed to receive the response")]
    Receive(#[source] NextPacketError),
    #[error("Connection closed before the response was complete")]
    UnexpectedEnd,
    #[error("Received a packet that is not valid for the call")]
    UnexpectedPacket,
}

impl CallError {
    pub(crate) fn dial(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Dial(Box::new(error))
    }
}
