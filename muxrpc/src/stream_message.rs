use crate::error::Error;
use crate::packet::Body;

/// Message sent in either direction of a streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum StreamMessage {
    Data(Body),
    Error(Error),
    End,
}

impl StreamMessage {
    /// Returns true if the message ends the stream.
    ///
    /// That is if the message is [StreamMessage::Error] or [StreamMessage::End].
    pub fn is_end(&self) -> bool {
        match self {
            StreamMessage::Data(_) => false,
            StreamMessage::Error(_) => true,
            StreamMessage::End => true,
        }
    }
}

impl From<Option<Result<Body, Error>>> for StreamMessage {
    fn from(item: Option<Result<Body, Error>>) -> Self {
        match item {
            Some(Ok(body)) => StreamMessage::Data(body),
            Some(Err(error)) => StreamMessage::Error(error),
            None => StreamMessage::End,
        }
    }
}
