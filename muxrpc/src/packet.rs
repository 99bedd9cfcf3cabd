use crate::error::Error;
use crate::header::{BodyType, Header, HeaderFlags};
use crate::stream_message::StreamMessage;

/// Unit of data exchanged on an RPC connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[cfg_attr(test, proptest(no_params))]
pub enum Packet {
    /// A call request or a successful response to an `async` call.
    Message(Body),
    /// Error response to an `async` call.
    Error(Error),
    /// Message belonging to a streaming call.
    Stream(StreamMessage),
}

#[derive(Debug, thiserror::Error)]
pub enum PacketParseError {
    #[error("Failed to decode error body")]
    ErrorBody {
        body: String,
        #[source]
        error: serde_json::Error,
    },
    #[error("Invalid string payload")]
    StringPayloadEncoding {
        #[source]
        error: std::string::FromUtf8Error,
    },
    #[error("Unexpected body type {actual:?}. Expected {expected:?}")]
    UnexpectedBodyType {
        actual: BodyType,
        expected: BodyType,
    },
}

impl Packet {
    pub fn parse(header: Header, body: Vec<u8>) -> Result<Self, PacketParseError> {
        let body = Body::parse(header.body_type, body)?;
        let HeaderFlags {
            is_stream,
            is_end_or_error,
        } = header.flags;
        let packet = match (is_stream, is_end_or_error) {
            (false, false) => Packet::Message(body),
            (false, true) => Packet::Error(parse_error(&body.into_json()?)?),
            (true, false) => Packet::Stream(StreamMessage::Data(body)),
            (true, true) => {
                let json = body.into_json()?;
                if json == b"true" {
                    Packet::Stream(StreamMessage::End)
                } else {
                    Packet::Stream(StreamMessage::Error(parse_error(&json)?))
                }
            }
        };
        Ok(packet)
    }

    fn header_and_body(self) -> (Header, Vec<u8>) {
        let (is_stream, is_end_or_error, body) = match self {
            Packet::Message(body) => (false, false, body),
            Packet::Error(error) => (false, true, Body::json(&error)),
            Packet::Stream(StreamMessage::Data(body)) => (true, false, body),
            Packet::Stream(StreamMessage::Error(error)) => (true, true, Body::json(&error)),
            Packet::Stream(StreamMessage::End) => (true, true, Body::json(&true)),
        };
        let (body_type, body_data) = body.build();
        let header = Header {
            flags: HeaderFlags {
                is_stream,
                is_end_or_error,
            },
            body_type,
            body_len: body_data.len() as u32,
        };
        (header, body_data)
    }

    pub fn build(self) -> Vec<u8> {
        let (header, mut body_data) = self.header_and_body();
        let mut data = header.build().to_vec();
        data.append(&mut body_data);
        data
    }
}

fn parse_error(json: &[u8]) -> Result<Error, PacketParseError> {
    serde_json::from_slice(json).map_err(|error| PacketParseError::ErrorBody {
        body: String::from_utf8_lossy(json).into_owned(),
        error,
    })
}

/// Payload of a message.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Body {
    Blob(Vec<u8>),
    String(String),
    Json(#[cfg_attr(test, proptest(value = "b\"{}\".to_vec()"))] Vec<u8>),
}

impl Body {
    fn parse(body_type: BodyType, data: Vec<u8>) -> Result<Self, PacketParseError> {
        Ok(match body_type {
            BodyType::Binary => Body::Blob(data),
            BodyType::Utf8String => {
                let string = String::from_utf8(data)
                    .map_err(|error| PacketParseError::StringPayloadEncoding { error })?;
                Body::String(string)
            }
            BodyType::Json => Body::Json(data),
        })
    }

    /// Serialize `value` into a JSON body.
    ///
    /// Values that cannot be represented as JSON (maps with non-string keys)
    /// are encoded as `null`.
    pub fn json(value: &impl serde::Serialize) -> Self {
        Self::Json(serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec()))
    }

    /// Decode a JSON body. String bodies are decoded as JSON strings.
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Body::Json(data) => serde_json::from_slice(data),
            Body::String(string) => serde_json::from_value(serde_json::Value::String(string.clone())),
            Body::Blob(data) => serde_json::from_slice(data),
        }
    }

    pub(crate) fn into_json(self) -> Result<Vec<u8>, PacketParseError> {
        match self {
            Body::Blob(_) => Err(PacketParseError::UnexpectedBodyType {
                actual: BodyType::Binary,
                expected: BodyType::Json,
            }),
            Body::String(_) => Err(PacketParseError::UnexpectedBodyType {
                actual: BodyType::Utf8String,
                expected: BodyType::Json,
            }),
            Body::Json(data) => Ok(data),
        }
    }

    fn build(self) -> (BodyType, Vec<u8>) {
        match self {
            Self::Blob(data) => (BodyType::Binary, data),
            Self::String(string) => (BodyType::Utf8String, Vec::from(string)),
            Self::Json(data) => (BodyType::Json, data),
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blob(data) => fmt.debug_tuple("Blob").field(data).finish(),
            Self::String(string) => fmt.debug_tuple("String").field(string).finish(),
            Self::Json(data) => fmt
                .debug_tuple("Json")
                .field(&String::from_utf8_lossy(data))
                .finish(),
        }
    }
}
