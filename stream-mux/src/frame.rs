//! Frames exchanged between two sessions and reading them from a connection.

use futures::prelude::*;

use crate::error::SessionError;
use crate::header::{Flags, GoAwayCode, Header};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            body: Vec::new(),
        }
    }

    pub fn data(stream_id: u32, body: Vec<u8>) -> Self {
        Self {
            header: Header::data(stream_id, body.len() as u32),
            body,
        }
    }

    /// Empty data frame that carries only `flags`.
    pub fn control(stream_id: u32, flags: Flags) -> Self {
        Self::new(Header::data(stream_id, 0).with_flags(flags))
    }

    pub fn syn(stream_id: u32) -> Self {
        Self::control(
            stream_id,
            Flags {
                syn: true,
                ..Flags::default()
            },
        )
    }

    pub fn fin(stream_id: u32) -> Self {
        Self::control(
            stream_id,
            Flags {
                fin: true,
                ..Flags::default()
            },
        )
    }

    pub fn rst(stream_id: u32) -> Self {
        Self::control(
            stream_id,
            Flags {
                rst: true,
                ..Flags::default()
            },
        )
    }

    pub fn go_away(code: GoAwayCode) -> Self {
        Self::new(Header::go_away(code))
    }

    pub fn build(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(Header::SIZE + self.body.len());
        data.extend_from_slice(&self.header.build());
        data.extend_from_slice(&self.body);
        data
    }
}

/// Read the next frame from `reader`.
///
/// Returns `Ok(None)` if the connection ends before a header starts. Data
/// frames with a payload larger than `max_body_len` are rejected before the
/// payload is read.
pub(crate) async fn read_frame(
    reader: &mut (impl AsyncRead + Unpin),
    max_body_len: usize,
) -> Result<Option<Frame>, SessionError> {
    let mut header_data = [0u8; Header::SIZE];
    match reader.read_exact(&mut header_data).await {
        Ok(()) => (),
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(SessionError::io(error)),
    }
    let header = Header::parse(header_data).map_err(SessionError::InvalidHeader)?;
    let body_len = header.body_len();
    if body_len > max_body_len {
        return Err(SessionError::Protocol("frame payload exceeds stream window"));
    }
    let mut body = vec![0u8; body_len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(SessionError::io)?;
    Ok(Some(Frame { header, body }))
}
