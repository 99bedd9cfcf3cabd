//! Provides [PacketStream] for parsing RPC packets from a byte stream and
//! [packet_sink] for writing them.

use bytes::{Buf as _, BufMut as _};
use futures::prelude::*;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::header::{Header, HeaderParseError};
use crate::packet::{Packet, PacketParseError};

#[derive(Debug, thiserror::Error)]
/// Error receiving an RPC [Packet].
pub enum NextPacketError {
    #[error("Failed to read bytes")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("Failed to parse packet header")]
    InvalidHeader(
        #[source]
        #[from]
        HeaderParseError,
    ),
    #[error("Failed to parse packet")]
    PacketParse(
        #[source]
        #[from]
        PacketParseError,
    ),
    #[error("Unexpected end of stream while parsing packet")]
    UnexpectedEndOfStream,
}

/// Read packets from `reader` until it is exhausted.
pub(crate) fn read_packets(
    reader: impl AsyncRead + Unpin,
) -> PacketStream<impl Stream<Item = Result<Vec<u8>, std::io::Error>>> {
    PacketStream::new(read_to_stream(reader))
}

/// Encode packets and write them to `writer`. Closing the sink closes the writer.
pub(crate) fn packet_sink(
    writer: impl AsyncWrite + Unpin,
) -> impl Sink<Packet, Error = std::io::Error> + Unpin {
    writer
        .into_sink()
        .with(|packet: Packet| future::ready(Ok::<_, std::io::Error>(packet.build())))
}

/// Convert [AsyncRead] into a [Stream] of the chunks returned by each read.
fn read_to_stream(
    read: impl AsyncRead + Unpin,
) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> {
    const BUF_SIZE: usize = 4096;
    let mut read = read;
    let mut buf = vec![0u8; BUF_SIZE];
    futures::stream::poll_fn(move |cx| {
        let result = match futures::ready!(Pin::new(&mut read).poll_read(cx, &mut buf)) {
            Ok(0) => None,
            Ok(size) => Some(Ok(Vec::from(&buf[..size]))),
            Err(err) => Some(Err(err)),
        };
        Poll::Ready(result)
    })
}

#[pin_project::pin_project]
#[derive(Debug)]
/// [Stream] of [Packet]s parsed from underlying [Stream] of bytes.
pub struct PacketStream<Stream> {
    #[pin]
    stream: Stream,
    reader: PacketReader,
    buffer: bytes::Bytes,
}

impl<Stream> PacketStream<Stream> {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            reader: PacketReader::new(),
            buffer: bytes::Bytes::new(),
        }
    }
}

impl<Stream_> Stream for PacketStream<Stream_>
where
    Stream_: TryStream<Ok = Vec<u8>>,
    Stream_::Error: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<Packet, NextPacketError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        loop {
            let this = self.as_mut().project();

            if this.buffer.is_empty() {
                match futures::ready!(this.stream.try_poll_next(cx)) {
                    Some(Ok(data)) => *this.buffer = bytes::Bytes::from(data),
                    Some(Err(err)) => {
                        return Poll::Ready(Some(Err(NextPacketError::Source(Box::new(err)))))
                    }
                    None => {
                        if this.reader.is_empty() {
                            return Poll::Ready(None);
                        } else {
                            return Poll::Ready(Some(Err(NextPacketError::UnexpectedEndOfStream)));
                        }
                    }
                };
            }

            if let Some(packet_result) = this.reader.put(this.buffer) {
                return Poll::Ready(Some(packet_result));
            }
        }
    }
}

/// Upper bound of the body buffer allocated before any body bytes arrived.
/// Larger bodies grow the buffer as they are received.
const MAX_PREALLOCATED_BODY: usize = 64 * 1024;

/// Buffer that is fed bytes until it produces a [Packet].
#[derive(Debug)]
enum PacketReader {
    ReadingHeader { buffer: bytes::BytesMut },
    ReadingBody { header: Header, buffer: bytes::BytesMut },
}

impl PacketReader {
    fn new() -> Self {
        Self::ReadingHeader {
            buffer: bytes::BytesMut::with_capacity(Header::SIZE),
        }
    }

    /// Consume bytes from `data` until a packet is complete. Returns `None` if
    /// `data` was exhausted first.
    fn put(&mut self, data: &mut impl bytes::Buf) -> Option<Result<Packet, NextPacketError>> {
        loop {
            match self {
                Self::ReadingHeader { buffer } => {
                    if !fill(buffer, Header::SIZE, data) {
                        return None;
                    }
                    let mut header_data = [0u8; Header::SIZE];
                    header_data.copy_from_slice(buffer);
                    let header = match Header::parse(header_data) {
                        Ok(header) => header,
                        Err(err) => return Some(Err(NextPacketError::InvalidHeader(err))),
                    };
                    *self = Self::ReadingBody {
                        header,
                        buffer: bytes::BytesMut::with_capacity(
                            (header.body_len as usize).min(MAX_PREALLOCATED_BODY),
                        ),
                    };
                }
                Self::ReadingBody { header, buffer } => {
                    if !fill(buffer, header.body_len as usize, data) {
                        return None;
                    }
                    let packet_result = Packet::parse(*header, buffer.to_vec())
                        .map_err(NextPacketError::PacketParse);
                    *self = Self::new();
                    return Some(packet_result);
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            PacketReader::ReadingHeader { buffer } => buffer.is_empty(),
            PacketReader::ReadingBody { .. } => false,
        }
    }
}

/// Move bytes from `data` to `buffer` until `buffer` holds `size` bytes.
/// Returns true if `buffer` is full.
fn fill(buffer: &mut bytes::BytesMut, size: usize, data: &mut impl bytes::Buf) -> bool {
    let count = (size - buffer.len()).min(data.remaining());
    buffer.put(data.take(count));
    buffer.len() == size
}
