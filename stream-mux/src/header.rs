#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub struct Header {
    pub frame_type: FrameType,
    pub flags: Flags,
    pub stream_id: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[repr(u8)]
pub enum FrameType {
    /// `length` bytes of stream payload follow the header.
    Data = 0,
    /// `length` is additional send credit for the stream.
    WindowUpdate = 1,
    /// `length` is an opaque value that is echoed back with [Flags::ack].
    Ping = 2,
    /// The sender is closing the session. `length` is a [GoAwayCode].
    GoAway = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

/// Reason code carried by a [FrameType::GoAway] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GoAwayCode {
    Normal = 0,
    ProtocolError = 1,
    InternalError = 2,
}

impl GoAwayCode {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::ProtocolError,
            _ => Self::InternalError,
        }
    }
}

/// Error returned from [Header::parse].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderParseError {
    #[error("Invalid frame type {value}")]
    InvalidFrameType { value: u8 },
    #[error("Unknown frame flags {value:#04x}")]
    UnknownFlags { value: u8 },
}

const SYN_MASK: u8 = 0b0001;
const ACK_MASK: u8 = 0b0010;
const FIN_MASK: u8 = 0b0100;
const RST_MASK: u8 = 0b1000;
const FLAGS_MASK: u8 = SYN_MASK | ACK_MASK | FIN_MASK | RST_MASK;

impl FrameType {
    fn from_u8(value: u8) -> Result<Self, HeaderParseError> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::WindowUpdate),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::GoAway),
            value => Err(HeaderParseError::InvalidFrameType { value }),
        }
    }
}

impl Flags {
    fn from_u8(value: u8) -> Result<Self, HeaderParseError> {
        if value & !FLAGS_MASK != 0 {
            return Err(HeaderParseError::UnknownFlags { value });
        }
        Ok(Self {
            syn: value & SYN_MASK != 0,
            ack: value & ACK_MASK != 0,
            fin: value & FIN_MASK != 0,
            rst: value & RST_MASK != 0,
        })
    }

    fn to_u8(self) -> u8 {
        let mut value = 0;
        if self.syn {
            value |= SYN_MASK;
        }
        if self.ack {
            value |= ACK_MASK;
        }
        if self.fin {
            value |= FIN_MASK;
        }
        if self.rst {
            value |= RST_MASK;
        }
        value
    }
}

impl Header {
    pub const SIZE: usize = 10;

    pub fn data(stream_id: u32, length: u32) -> Self {
        Self {
            frame_type: FrameType::Data,
            flags: Flags::default(),
            stream_id,
            length,
        }
    }

    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        Self {
            frame_type: FrameType::WindowUpdate,
            flags: Flags::default(),
            stream_id,
            length: credit,
        }
    }

    pub fn ping(value: u32, ack: bool) -> Self {
        Self {
            frame_type: FrameType::Ping,
            flags: Flags {
                ack,
                ..Flags::default()
            },
            stream_id: 0,
            length: value,
        }
    }

    pub fn go_away(code: GoAwayCode) -> Self {
        Self {
            frame_type: FrameType::GoAway,
            flags: Flags::default(),
            stream_id: 0,
            length: code as u32,
        }
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Number of payload bytes that follow the header on the wire.
    pub fn body_len(&self) -> usize {
        match self.frame_type {
            FrameType::Data => self.length as usize,
            _ => 0,
        }
    }

    pub fn parse(data: [u8; Self::SIZE]) -> Result<Self, HeaderParseError> {
        use bytes::Buf as _;

        let mut bytes = bytes::Bytes::copy_from_slice(&data);
        let frame_type = FrameType::from_u8(bytes.get_u8())?;
        let flags = Flags::from_u8(bytes.get_u8())?;
        let stream_id = bytes.get_u32();
        let length = bytes.get_u32();
        debug_assert!(!bytes.has_remaining());

        Ok(Self {
            frame_type,
            flags,
            stream_id,
            length,
        })
    }

    pub fn build(&self) -> [u8; Self::SIZE] {
        use bytes::BufMut as _;

        let mut header = [0u8; Self::SIZE];
        let cursor = &mut &mut header[..];
        cursor.put_u8(self.frame_type as u8);
        cursor.put_u8(self.flags.to_u8());
        cursor.put_u32(self.stream_id);
        cursor.put_u32(self.length);
        debug_assert!(!cursor.has_remaining_mut());
        header
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test_strategy::proptest]
    fn header_parse_build(header: Header) {
        prop_assert_eq!(Header::parse(header.build()).unwrap(), header);
    }

    #[test_strategy::proptest]
    fn header_invalid_type(header_data: [u8; Header::SIZE], #[strategy(4u8..=255u8)] frame_type: u8) {
        let mut header_data = header_data;
        header_data[0] = frame_type;
        let result = Header::parse(header_data);
        prop_assert_eq!(
            result,
            Err(HeaderParseError::InvalidFrameType { value: frame_type })
        );
    }

    #[test]
    fn header_unknown_flags() {
        let mut header_data = Header::data(1, 0).build();
        header_data[1] = 0b0001_0001;
        assert_eq!(
            Header::parse(header_data),
            Err(HeaderParseError::UnknownFlags { value: 0b0001_0001 })
        );
    }

    #[test]
    fn window_update_has_no_body() {
        let header = Header::window_update(3, 1024);
        assert_eq!(header.body_len(), 0);
        assert_eq!(Header::data(3, 1024).body_len(), 1024);
    }
}
