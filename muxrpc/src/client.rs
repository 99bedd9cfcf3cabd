use futures::prelude::*;
use futures::stream::BoxStream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::call::{CallRequest, CallType};
use crate::error::{CallError, Error};
use crate::packet::{Body, Packet};
use crate::packet_stream::{packet_sink, read_packets};
use crate::stream_message::StreamMessage;
use crate::transport::Dialer;

/// Messages received from the server in a streaming call.
///
/// The stream ends after the server ended its side of the call. An error
/// item is always the last item.
pub type BoxStreamSource = BoxStream<'static, Result<Body, CallError>>;

type BoxPacketSink = Pin<Box<dyn Sink<Packet, Error = std::io::Error> + Send>>;

/// RPC client that makes each call on a new connection obtained from a [Dialer].
///
/// Cloning the client is cheap and clones share the dialer. Calls from
/// different clones or tasks are independent of each other.
///
/// ```no_run
/// # #[async_std::main]
/// # async fn main() -> Result<(), muxrpc::CallError> {
/// let client = muxrpc::Client::new(muxrpc::TcpDialer::new("127.0.0.1:8080"))
///     .with_call_timeout(std::time::Duration::from_secs(5));
/// let response = client
///     .call_async("tunnel.echo", vec![serde_json::json!("hello")])
///     .await?;
/// assert_eq!(response.decode_json::<String>().unwrap(), "Echo: hello");
/// # Ok(())
/// # }
/// ```
pub struct Client<D> {
    dialer: Arc<D>,
    call_timeout: Option<Duration>,
}

impl<D> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: Arc::clone(&self.dialer),
            call_timeout: self.call_timeout,
        }
    }
}

impl<D> std::fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl<D: Dialer> Client<D> {
    /// Create a client. Does not open any connection.
    pub fn new(dialer: D) -> Self {
        Self {
            dialer: Arc::new(dialer),
            call_timeout: None,
        }
    }

    /// Bound the duration of calls.
    ///
    /// For `async` calls the timeout covers dialing, sending the call and
    /// receiving the response. For streaming calls it covers dialing and
    /// sending the call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Call the `async` method `method` and return the response.
    ///
    /// `method` is a dotted method name like `group.method`.
    pub async fn call_async(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<Body, CallError> {
        self.with_timeout(async {
            let (mut packets, mut requests) = self.start_call(method, CallType::Async, args).await?;
            requests.close().await.map_err(CallError::Io)?;
            match packets.next().await {
                Some(Ok(Packet::Message(body))) => Ok(body),
                Some(Ok(Packet::Error(error))) => Err(CallError::Remote(error)),
                Some(Ok(Packet::Stream(_))) => Err(CallError::UnexpectedPacket),
                Some(Err(error)) => Err(CallError::Receive(error)),
                None => Err(CallError::UnexpectedEnd),
            }
        })
        .await
    }

    /// Call the `source` method `method` and return the messages sent by the server.
    pub async fn start_source(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<BoxStreamSource, CallError> {
        let (packets, requests) = self
            .with_timeout(self.start_call(method, CallType::Source, args))
            .await?;
        Ok(receive_stream(packets, Some(requests)))
    }

    /// Call the `sink` method `method` and return the sink for sending
    /// messages to the server.
    ///
    /// [StreamSink::close] waits for the server to confirm the end of the call.
    pub async fn start_sink(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<StreamSink, CallError> {
        let (packets, requests) = self
            .with_timeout(self.start_call(method, CallType::Sink, args))
            .await?;
        Ok(StreamSink {
            requests,
            response: Some(receive_stream(packets, None)),
        })
    }

    /// Call the `duplex` method `method`.
    ///
    /// Returns the messages sent by the server and the sink for sending
    /// messages to the server. Both sides end independently.
    pub async fn start_duplex(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<(BoxStreamSource, StreamSink), CallError> {
        let (packets, requests) = self
            .with_timeout(self.start_call(method, CallType::Duplex, args))
            .await?;
        Ok((
            receive_stream(packets, None),
            StreamSink {
                requests,
                response: None,
            },
        ))
    }

    /// Dial a connection and send the call request.
    async fn start_call(
        &self,
        method: &str,
        type_: CallType,
        args: Vec<serde_json::Value>,
    ) -> Result<(BoxPacketStream, BoxPacketSink), CallError> {
        let connection = self.dialer.dial().await.map_err(CallError::dial)?;
        let (reader, writer) = connection.split();
        let packets = read_packets(reader).boxed();
        let mut requests: BoxPacketSink = Box::pin(packet_sink(writer));
        tracing::trace!(method, %type_, "start call");
        requests
            .send(CallRequest::new(method, type_, args).into_packet())
            .await
            .map_err(CallError::Io)?;
        Ok((packets, requests))
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, CallError>>,
    ) -> Result<T, CallError> {
        match self.call_timeout {
            Some(timeout) => async_std::future::timeout(timeout, call)
                .await
                .map_err(|_| CallError::Timeout { timeout })?,
            None => call.await,
        }
    }
}

type BoxPacketStream =
    BoxStream<'static, Result<Packet, crate::packet_stream::NextPacketError>>;

/// Turn the packets received in a streaming call into the messages of the call.
///
/// If `requests` is given the end of the stream is acknowledged on it once the
/// server ended its side.
fn receive_stream(packets: BoxPacketStream, requests: Option<BoxPacketSink>) -> BoxStreamSource {
    futures::stream::unfold(Some((packets, requests)), |state| async move {
        let (mut packets, requests) = state?;
        let (item, done) = match packets.next().await {
            Some(Ok(Packet::Stream(StreamMessage::Data(body)))) => (Some(Ok(body)), false),
            Some(Ok(Packet::Stream(StreamMessage::End))) => (None, true),
            Some(Ok(Packet::Stream(StreamMessage::Error(error)))) => {
                (Some(Err(CallError::Remote(error))), true)
            }
            Some(Ok(_)) => (Some(Err(CallError::UnexpectedPacket)), true),
            Some(Err(error)) => (Some(Err(CallError::Receive(error))), true),
            None => (Some(Err(CallError::UnexpectedEnd)), true),
        };
        if !done {
            return item.map(|item| (item, Some((packets, requests))));
        }
        if let Some(mut requests) = requests {
            // The server is done with the call. Failing to acknowledge that is harmless.
            let _ = requests.send(Packet::Stream(StreamMessage::End)).await;
            let _ = requests.close().await;
        }
        item.map(|item| (item, None))
    })
    .boxed()
}

/// Send messages of a streaming call to the server.
///
/// The sink must be explicitly closed by calling [StreamSink::close] or
/// [StreamSink::error] to tell the server that the client will not send
/// messages anymore. Dropping the sink aborts the call.
pub struct StreamSink {
    requests: BoxPacketSink,
    /// Response of a `sink` call that is awaited when the sink is closed.
    response: Option<BoxStreamSource>,
}

impl std::fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSink")
            .field("awaits_response", &self.response.is_some())
            .finish()
    }
}

impl StreamSink {
    pub async fn send(&mut self, data: Body) -> Result<(), CallError> {
        self.requests
            .send(Packet::Stream(StreamMessage::Data(data)))
            .await
            .map_err(CallError::Io)
    }

    /// End the client side of the call.
    pub async fn close(self) -> Result<(), CallError> {
        self.finish(StreamMessage::End).await
    }

    /// End the client side of the call with an error.
    pub async fn error(self, error: Error) -> Result<(), CallError> {
        self.finish(StreamMessage::Error(error)).await
    }

    async fn finish(mut self, message: StreamMessage) -> Result<(), CallError> {
        self.requests
            .send(Packet::Stream(message))
            .await
            .map_err(CallError::Io)?;
        self.requests.close().await.map_err(CallError::Io)?;
        match self.response.take() {
            Some(mut response) => match response.next().await {
                None => Ok(()),
                Some(Err(error)) => Err(error),
                Some(Ok(_)) => Err(CallError::UnexpectedPacket),
            },
            None => Ok(()),
        }
    }
}
