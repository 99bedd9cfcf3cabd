//! Use a multiplexed [Session] as the source of connections for RPC.
//!
//! [StreamListener] hands every stream opened by the peer to [muxrpc::serve]
//! and [StreamDialer] opens a new stream for every call of a
//! [muxrpc::Client]. Which of the two a peer can use depends only on the
//! role of its session.
use stream_mux::{Session, SessionError, Stream};

/// [muxrpc::Listener] that accepts the streams opened by the peer.
#[derive(Debug, Clone)]
pub struct StreamListener {
    session: Session,
}

impl StreamListener {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[async_trait::async_trait]
impl muxrpc::Listener for StreamListener {
    type Connection = Stream;
    type Error = SessionError;

    async fn accept(&self) -> Result<Stream, SessionError> {
        let stream = self.session.accept_stream().await?;
        tracing::trace!(stream_id = stream.id(), "accepted stream");
        Ok(stream)
    }
}

/// [muxrpc::Dialer] that opens a new stream to the peer.
#[derive(Debug, Clone)]
pub struct StreamDialer {
    session: Session,
}

impl StreamDialer {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[async_trait::async_trait]
impl muxrpc::Dialer for StreamDialer {
    type Connection = Stream;
    type Error = SessionError;

    async fn dial(&self) -> Result<Stream, SessionError> {
        self.session.open_stream()
    }
}
