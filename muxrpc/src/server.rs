use futures::prelude::*;
use std::sync::Arc;

use crate::call::{CallRequest, CallType};
use crate::error::Error;
use crate::packet::{Body, Packet};
use crate::packet_stream::{packet_sink, read_packets, NextPacketError};
use crate::service::{BoxSink, BoxSource, Service, StreamEndpoint};
use crate::stream_message::StreamMessage;
use crate::transport::Listener;

/// Serve `service` on connections accepted from `listener`.
///
/// Every connection carries one call and is handled on its own task. A call
/// that fails only affects its own connection. Returns the error of the
/// listener once it stops producing connections.
///
/// Pass an `Arc<Service>` to share one service between several listeners.
pub async fn serve<L: Listener>(
    listener: L,
    service: impl Into<Arc<Service>>,
) -> Result<(), L::Error> {
    serve_until(listener, service, future::pending::<()>()).await
}

/// Like [serve] but stop accepting connections once `stop` resolves.
///
/// Calls that are in progress when `stop` resolves are completed before
/// `Ok(())` is returned.
#[tracing::instrument(level = "debug", skip(listener, service, stop))]
pub async fn serve_until<L: Listener>(
    listener: L,
    service: impl Into<Arc<Service>>,
    stop: impl Future<Output = ()>,
) -> Result<(), L::Error> {
    let service = service.into();
    // Every call task holds a sender. The receiver ends when all are dropped.
    let (in_progress, mut calls_done) = futures::channel::mpsc::channel::<()>(0);
    futures::pin_mut!(stop);
    loop {
        let accepted = {
            let accept = listener.accept();
            futures::pin_mut!(accept);
            match future::select(accept, stop.as_mut()).await {
                future::Either::Left((accepted, _)) => Some(accepted),
                future::Either::Right(((), _)) => None,
            }
        };
        let connection = match accepted {
            Some(accepted) => accepted?,
            None => break,
        };
        let service = Arc::clone(&service);
        let in_progress = in_progress.clone();
        async_std::task::spawn(async move {
            if let Err(error) = handle_connection(connection, &service).await {
                tracing::warn!(%error, "call failed");
            }
            drop(in_progress);
        });
    }
    drop(in_progress);
    tracing::debug!("stopped accepting calls");
    while calls_done.next().await.is_some() {}
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("Failed to receive call")]
    Receive(#[from] NextPacketError),
    #[error("Failed to send response")]
    Send(#[from] std::io::Error),
    #[error("Connection closed before a call was received")]
    NoCall,
    #[error("Invalid call request")]
    InvalidCall,
}

/// What the caller did with its side of a streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerEnd {
    End,
    Error,
    /// The caller sent data to a source.
    SentData,
    /// The connection broke before the caller ended the stream.
    Broken,
}

async fn handle_connection(
    connection: impl AsyncRead + AsyncWrite + Unpin,
    service: &Service,
) -> Result<(), ConnectionError> {
    let (reader, writer) = connection.split();
    let mut packets = read_packets(reader);
    let mut responses = packet_sink(writer);

    let request = match packets.next().await.ok_or(ConnectionError::NoCall)?? {
        Packet::Message(body) => body.decode_json::<CallRequest>().map_err(|error| {
            tracing::warn!(%error, "failed to decode call request");
            ConnectionError::InvalidCall
        })?,
        packet => {
            tracing::warn!(?packet, "expected call request");
            return Err(ConnectionError::InvalidCall);
        }
    };
    let CallRequest { name, type_, args } = request;
    tracing::debug!(method = ?name.join("."), %type_, "handle call");

    match type_ {
        CallType::Async => {
            let response = match service.handle_async(&name, args).await {
                Ok(body) => Packet::Message(body),
                Err(error) => Packet::Error(error),
            };
            responses.send(response).await?;
        }
        type_ => match service.handle_stream(&name, type_, args) {
            Ok(StreamEndpoint::Source(source)) => {
                serve_source(source, &mut packets, &mut responses).await?
            }
            Ok(StreamEndpoint::Sink(sink)) => serve_sink(sink, &mut packets, &mut responses).await?,
            Ok(StreamEndpoint::Duplex(source, sink)) => {
                serve_duplex(source, sink, &mut packets, &mut responses).await?
            }
            Err(error) => {
                responses
                    .send(Packet::Stream(StreamMessage::Error(error)))
                    .await?;
                drain(&mut packets).await;
            }
        },
    }
    responses.close().await?;
    Ok(())
}

async fn serve_source(
    source: BoxSource,
    packets: &mut (impl Stream<Item = Result<Packet, NextPacketError>> + Unpin),
    responses: &mut (impl Sink<Packet, Error = std::io::Error> + Unpin),
) -> std::io::Result<()> {
    let (message, drain_after) = {
        let sending = Box::pin(send_source(source, &mut *responses));
        let peer_end = Box::pin(async {
            match next_data(&mut *packets).await {
                Ok(_) => PeerEnd::SentData,
                Err(peer_end) => peer_end,
            }
        });
        match future::select(sending, peer_end).await {
            future::Either::Left((result, peer_end)) => {
                result?;
                (None, peer_end.await == PeerEnd::SentData)
            }
            future::Either::Right((peer_end, sending)) => {
                drop(sending);
                let message = match peer_end {
                    PeerEnd::Broken => return Ok(()),
                    PeerEnd::SentData => StreamMessage::Error(Error::new(
                        "SENT_DATA_TO_SOURCE",
                        "Cannot send data to a \"source\" stream",
                    )),
                    PeerEnd::End | PeerEnd::Error => StreamMessage::End,
                };
                (Some(message), peer_end == PeerEnd::SentData)
            }
        }
    };
    if let Some(message) = message {
        responses.send(Packet::Stream(message)).await?;
    }
    if drain_after {
        drain(packets).await;
    }
    Ok(())
}

async fn serve_sink(
    sink: BoxSink,
    packets: &mut (impl Stream<Item = Result<Packet, NextPacketError>> + Unpin),
    responses: &mut (impl Sink<Packet, Error = std::io::Error> + Unpin),
) -> std::io::Result<()> {
    let (sink_result, peer_end) = receive_into_sink(sink, packets).await;
    if peer_end == PeerEnd::Broken {
        return Ok(());
    }
    let message = match sink_result {
        Ok(()) => StreamMessage::End,
        Err(error) => StreamMessage::Error(error),
    };
    responses.send(Packet::Stream(message)).await
}

async fn serve_duplex(
    source: BoxSource,
    sink: BoxSink,
    packets: &mut (impl Stream<Item = Result<Packet, NextPacketError>> + Unpin),
    responses: &mut (impl Sink<Packet, Error = std::io::Error> + Unpin),
) -> std::io::Result<()> {
    let sending = send_source(source, responses);
    futures::pin_mut!(sending);
    let receiving = receive_into_sink(sink, packets);
    futures::pin_mut!(receiving);
    match future::select(sending, receiving).await {
        future::Either::Left((result, receiving)) => {
            result?;
            let (sink_result, _) = receiving.await;
            if let Err(error) = sink_result {
                tracing::debug!(%error, "duplex sink failed");
            }
        }
        future::Either::Right(((sink_result, peer_end), sending)) => {
            if let Err(error) = sink_result {
                tracing::debug!(%error, "duplex sink failed");
            }
            if peer_end != PeerEnd::Broken {
                sending.await?;
            }
        }
    }
    Ok(())
}

/// Send all items of `source` followed by the end of the stream.
async fn send_source(
    mut source: BoxSource,
    responses: &mut (impl Sink<Packet, Error = std::io::Error> + Unpin),
) -> std::io::Result<()> {
    loop {
        let message = StreamMessage::from(source.next().await);
        let is_end = message.is_end();
        responses.send(Packet::Stream(message)).await?;
        if is_end {
            return Ok(());
        }
    }
}

/// Forward data sent by the caller to `sink` until the caller ends the stream.
///
/// Data sent after the sink failed is dropped. Returns the result of the sink
/// and how the caller ended the stream.
async fn receive_into_sink(
    mut sink: BoxSink,
    packets: &mut (impl Stream<Item = Result<Packet, NextPacketError>> + Unpin),
) -> (Result<(), Error>, PeerEnd) {
    let mut sink_result = Ok(());
    let peer_end = loop {
        match next_data(packets).await {
            Ok(body) => {
                if sink_result.is_ok() {
                    sink_result = sink.send(body).await;
                }
            }
            Err(peer_end) => break peer_end,
        }
    };
    if sink_result.is_ok() {
        sink_result = sink.close().await;
    }
    (sink_result, peer_end)
}

/// Read messages from the caller and ignore data until it ends the stream.
async fn drain(
    packets: &mut (impl Stream<Item = Result<Packet, NextPacketError>> + Unpin),
) -> PeerEnd {
    loop {
        if let Err(peer_end) = next_data(packets).await {
            return peer_end;
        }
    }
}

/// Receive the next data message of a stream. Returns how the caller ended
/// the stream if there is no more data.
async fn next_data(
    packets: &mut (impl Stream<Item = Result<Packet, NextPacketError>> + Unpin),
) -> Result<Body, PeerEnd> {
    match packets.next().await {
        Some(Ok(Packet::Stream(StreamMessage::Data(body)))) => Ok(body),
        Some(Ok(Packet::Stream(StreamMessage::End))) => Err(PeerEnd::End),
        Some(Ok(Packet::Stream(StreamMessage::Error(error)))) => {
            tracing::debug!(%error, "caller ended stream with error");
            Err(PeerEnd::Error)
        }
        Some(Ok(packet)) => {
            tracing::warn!(?packet, "unexpected packet in stream");
            Err(PeerEnd::Broken)
        }
        Some(Err(error)) => {
            tracing::debug!(%error, "failed to receive stream message");
            Err(PeerEnd::Broken)
        }
        None => Err(PeerEnd::Broken),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_service() -> Service {
        let mut service = Service::new();
        service.add_source("forever", |_: Vec<serde_json::Value>| {
            futures::stream::pending::<Result<Body, Error>>()
        });
        service.add_source("one", |_: Vec<serde_json::Value>| {
            futures::stream::iter(vec![Ok::<_, Error>(Body::json(&1u32))])
        });
        service.add_duplex("oneAndCollect", |_: Vec<serde_json::Value>| {
            let source = futures::stream::iter(vec![Ok::<_, Error>(Body::json(&1u32))]);
            let sink = futures::sink::drain::<Body>().sink_map_err(|never| -> Error { match never {} });
            (source, sink)
        });
        service
    }

    /// Start a call of `method` on a connection handled by the test service.
    /// Returns the request sink, the response stream and the serving task.
    async fn start_call(
        method: &str,
        type_: CallType,
    ) -> (
        impl Sink<Packet, Error = std::io::Error> + Unpin,
        impl Stream<Item = Result<Packet, NextPacketError>> + Unpin,
        async_std::task::JoinHandle<Result<(), ConnectionError>>,
    ) {
        let (caller, callee) = async_std::os::unix::net::UnixStream::pair().unwrap();
        let serving = async_std::task::spawn(async move {
            handle_connection(callee, &test_service()).await
        });
        let (reader, writer) = caller.split();
        let mut requests = packet_sink(writer);
        requests
            .send(CallRequest::new(method, type_, vec![]).into_packet())
            .await
            .unwrap();
        (requests, read_packets(reader), serving)
    }

    #[async_std::test]
    async fn source_rejects_data_from_caller() {
        let (mut requests, mut responses, serving) = start_call("forever", CallType::Source).await;
        requests
            .send(Packet::Stream(StreamMessage::Data(Body::json(&1u32))))
            .await
            .unwrap();
        match responses.next().await {
            Some(Ok(Packet::Stream(StreamMessage::Error(error)))) => assert_eq!(
                error,
                Error::new(
                    "SENT_DATA_TO_SOURCE",
                    "Cannot send data to a \"source\" stream"
                )
            ),
            response => panic!("Unexpected response {:?}", response),
        }

        // Further data is drained until the caller ends its side.
        requests
            .send(Packet::Stream(StreamMessage::Data(Body::json(&2u32))))
            .await
            .unwrap();
        requests
            .send(Packet::Stream(StreamMessage::End))
            .await
            .unwrap();
        serving.await.unwrap();
        assert!(responses.next().await.is_none());
    }

    #[async_std::test]
    async fn source_ended_by_caller() {
        let (mut requests, mut responses, serving) = start_call("forever", CallType::Source).await;
        requests
            .send(Packet::Stream(StreamMessage::End))
            .await
            .unwrap();
        match responses.next().await {
            Some(Ok(Packet::Stream(StreamMessage::End))) => (),
            response => panic!("Unexpected response {:?}", response),
        }
        serving.await.unwrap();
        assert!(responses.next().await.is_none());
    }

    #[async_std::test]
    async fn source_completes_before_caller_ends() {
        let (mut requests, mut responses, serving) = start_call("one", CallType::Source).await;
        let received = (&mut responses).take(2).try_collect::<Vec<_>>().await.unwrap();
        assert_eq!(
            received,
            vec![
                Packet::Stream(StreamMessage::Data(Body::json(&1u32))),
                Packet::Stream(StreamMessage::End),
            ]
        );
        requests
            .send(Packet::Stream(StreamMessage::End))
            .await
            .unwrap();
        serving.await.unwrap();
        assert!(responses.next().await.is_none());
    }

    #[async_std::test]
    async fn duplex_source_ends_before_caller() {
        let (mut requests, mut responses, serving) =
            start_call("oneAndCollect", CallType::Duplex).await;
        let received = (&mut responses).take(2).try_collect::<Vec<_>>().await.unwrap();
        assert_eq!(
            received,
            vec![
                Packet::Stream(StreamMessage::Data(Body::json(&1u32))),
                Packet::Stream(StreamMessage::End),
            ]
        );
        // The caller keeps sending after the source ended.
        requests
            .send(Packet::Stream(StreamMessage::Data(Body::json(&2u32))))
            .await
            .unwrap();
        requests
            .send(Packet::Stream(StreamMessage::End))
            .await
            .unwrap();
        serving.await.unwrap();
        assert!(responses.next().await.is_none());
    }
}
