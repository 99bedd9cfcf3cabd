#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub struct Header {
    pub flags: HeaderFlags,
    pub body_type: BodyType,
    pub body_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub struct HeaderFlags {
    pub is_stream: bool,
    pub is_end_or_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[repr(u8)]
pub enum BodyType {
    Binary = 0,
    Utf8String = 1,
    Json = 2,
}

/// Error returned from [Header::parse].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeaderParseError {
    #[error("Invalid body type {value}")]
    InvalidBodyType { value: u8 },
    #[error("Unknown header flags {value:#04x}")]
    UnknownFlags { value: u8 },
}

const BODY_TYPE_MASK: u8 = 0b0011;
const IS_END_OR_ERROR_MASK: u8 = 0b0100;
const IS_STREAM_MASK: u8 = 0b1000;

impl BodyType {
    fn from_flags(value: u8) -> Result<Self, HeaderParseError> {
        match value & BODY_TYPE_MASK {
            0 => Ok(BodyType::Binary),
            1 => Ok(BodyType::Utf8String),
            2 => Ok(BodyType::Json),
            value => Err(HeaderParseError::InvalidBodyType { value }),
        }
    }
}

impl Header {
    pub const SIZE: usize = 5;

    pub fn parse(data: [u8; Self::SIZE]) -> Result<Self, HeaderParseError> {
        use bytes::Buf as _;

        let mut bytes = bytes::Bytes::copy_from_slice(&data);
        let flags = bytes.get_u8();
        if flags & !(BODY_TYPE_MASK | IS_END_OR_ERROR_MASK | IS_STREAM_MASK) != 0 {
            return Err(HeaderParseError::UnknownFlags { value: flags });
        }
        let body_type = BodyType::from_flags(flags)?;
        let body_len = bytes.get_u32();
        debug_assert!(!bytes.has_remaining());

        Ok(Self {
            flags: HeaderFlags {
                is_stream: flags & IS_STREAM_MASK != 0,
                is_end_or_error: flags & IS_END_OR_ERROR_MASK != 0,
            },
            body_type,
            body_len,
        })
    }

    pub fn build(&self) -> [u8; Self::SIZE] {
        use bytes::BufMut as _;

        let mut header = [0u8; Self::SIZE];
        let cursor = &mut &mut header[..];
        let mut flags = self.body_type as u8;
        if self.flags.is_stream {
            flags |= IS_STREAM_MASK;
        }
        if self.flags.is_end_or_error {
            flags |= IS_END_OR_ERROR_MASK;
        }
        cursor.put_u8(flags);
        cursor.put_u32(self.body_len);
        debug_assert!(!cursor.has_remaining_mut());
        header
    }
}
