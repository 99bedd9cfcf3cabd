//! Application agnostic RPC protocol with support for streams.
//!
//! Every call is made on its own connection. The caller opens a connection,
//! sends a call request naming the method and the call type, and then
//! exchanges messages with the server according to the call type.
//!
//! * `async` calls receive a single response.
//! * `source` calls receive a stream of messages from the server.
//! * `sink` calls send a stream of messages to the server.
//! * `duplex` calls do both independently.
//!
//! Connections are obtained from a [Listener] on the server side and from a
//! [Dialer] on the client side. This makes it possible to run the protocol on
//! plain TCP connections as well as on the virtual streams of a multiplexed
//! connection.
//!
//! # Wire format
//!
//! Each message is a packet with a five byte header followed by the body.
//! The first header byte holds the flags `is_stream` (bit 3),
//! `is_end_or_error` (bit 2) and the body type (bits 0 and 1: binary, UTF-8
//! string or JSON). The remaining four bytes are the big endian body length.
//!
//! The call request is a JSON body `{"name": [..], "type": "async", "args": [..]}`.
//! Stream messages have `is_stream` set. The end of a stream is a message with
//! `is_end_or_error` set and the JSON body `true`. Errors are JSON bodies
//! `{"name": .., "message": ..}` with `is_end_or_error` set.
mod call;
mod client;
mod error;
mod header;
mod packet;
mod packet_stream;
mod server;
mod service;
mod stream_message;
mod transport;

#[doc(inline)]
pub use call::{CallRequest, CallType};
#[doc(inline)]
pub use client::{BoxStreamSource, Client, StreamSink};
#[doc(inline)]
pub use error::{CallError, Error};
#[doc(inline)]
pub use packet::Body;
#[doc(inline)]
pub use packet_stream::NextPacketError;
#[doc(inline)]
pub use server::{serve, serve_until};
#[doc(inline)]
pub use service::Service;
#[doc(inline)]
pub use stream_message::StreamMessage;
#[doc(inline)]
pub use transport::{Dialer, Listener, TcpDialer};
