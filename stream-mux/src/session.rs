use chashmap::CHashMap;
use futures::channel::{mpsc, oneshot};
use futures::future::{self, Either};
use futures::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Config, STREAM_WINDOW};
use crate::error::SessionError;
use crate::frame::{read_frame, Frame};
use crate::header::{FrameType, GoAwayCode, Header};
use crate::preface::{self, Preface};
use crate::role::Role;
use crate::stream::{Stream, StreamState};
use crate::utils::lock;

/// A multiplexed session over a single connection.
///
/// The session is cheap to clone and every clone refers to the same session.
/// All operations may be called concurrently from independent tasks. Dropping
/// the last handle closes the session.
///
/// ```no_run
/// # use futures::prelude::*;
/// # #[async_std::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let connection = async_std::net::TcpStream::connect("localhost:3001").await?;
/// let session = stream_mux::Session::new(
///     connection,
///     stream_mux::Role::Opener,
///     stream_mux::Config::default(),
/// )
/// .await?;
/// let mut stream = session.open_stream()?;
/// stream.write_all(b"hello").await?;
/// stream.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    role: Role,
    config: Config,
    state: Arc<SessionState>,
    next_stream_id: AtomicU32,
    incoming: async_std::sync::Mutex<mpsc::Receiver<Stream>>,
    writer_task: Mutex<Option<async_std::task::JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.state.termination().is_none() {
            let _ = self.state.send(Frame::go_away(GoAwayCode::Normal));
            self.state.terminate(SessionError::Closed);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("config", &self.inner.config)
            .field("streams", &self.inner.state.streams.len())
            .field("termination", &self.inner.state.termination())
            .finish()
    }
}

impl Session {
    /// Establish a session over `connection`.
    ///
    /// Exchanges the session preface with the peer and fails with
    /// [SessionError::RoleConflict] if the peer was configured with the same
    /// role. Spawns the tasks that read and write frames.
    pub async fn new<T>(mut connection: T, role: Role, config: Config) -> Result<Self, SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        preface::exchange(
            &mut connection,
            Preface {
                role,
                bidirectional: config.bidirectional,
            },
            config.handshake_timeout,
        )
        .await?;
        tracing::debug!(%role, bidirectional = config.bidirectional, "session established");

        let (reader, writer) = connection.split();
        let (frame_sender, frame_receiver) = mpsc::unbounded();
        let (incoming_sender, incoming_receiver) = mpsc::channel(config.accept_backlog);
        let state = Arc::new(SessionState::new(frame_sender));

        let dispatcher = FrameDispatcher {
            session: Arc::clone(&state),
            incoming: incoming_sender,
            role,
            accepts_streams: role == Role::Acceptor || config.bidirectional,
        };
        async_std::task::spawn(read_frames(dispatcher, reader));

        let writer_state = Arc::clone(&state);
        let writer_task = async_std::task::spawn(async move {
            if let Err(error) = write_frames(writer, frame_receiver).await {
                writer_state.terminate(SessionError::io(error));
            }
        });

        if let Some(interval) = config.keepalive_interval {
            async_std::task::spawn(keepalive(Arc::clone(&state), interval));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                role,
                next_stream_id: AtomicU32::new(role.first_stream_id()),
                config,
                state,
                incoming: async_std::sync::Mutex::new(incoming_receiver),
                writer_task: Mutex::new(Some(writer_task)),
            }),
        })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns true if [Session::open_stream] is available for this session.
    pub fn can_open(&self) -> bool {
        self.inner.role == Role::Opener || self.inner.config.bidirectional
    }

    /// Returns true if [Session::accept_stream] is available for this session.
    pub fn can_accept(&self) -> bool {
        self.inner.role == Role::Acceptor || self.inner.config.bidirectional
    }

    /// Open a new stream to the peer.
    ///
    /// The peer receives the stream from [Session::accept_stream]. Fails with
    /// [SessionError::WrongRole] if the session is not allowed to open
    /// streams and with the termination reason if the session terminated.
    pub fn open_stream(&self) -> Result<Stream, SessionError> {
        if !self.can_open() {
            return Err(SessionError::WrongRole {
                required: Role::Opener,
                actual: self.inner.role,
            });
        }
        if let Some(reason) = self.inner.state.termination() {
            return Err(reason);
        }

        let stream_id = self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let stream_state = Arc::new(Mutex::new(StreamState::new()));
        self.inner
            .state
            .streams
            .insert(stream_id, Arc::clone(&stream_state));
        // Dropping the stream on error removes it from the stream table.
        let stream = Stream::new(stream_id, stream_state, Arc::clone(&self.inner.state));
        self.inner.state.send(Frame::syn(stream_id))?;
        tracing::trace!(stream_id, "opened stream");
        Ok(stream)
    }

    /// Wait for the next stream opened by the peer.
    ///
    /// Returns the termination reason once the session terminated.
    pub async fn accept_stream(&self) -> Result<Stream, SessionError> {
        if !self.can_accept() {
            return Err(SessionError::WrongRole {
                required: Role::Acceptor,
                actual: self.inner.role,
            });
        }
        let mut incoming = self.inner.incoming.lock().await;
        let terminated = self.inner.state.terminated();
        futures::pin_mut!(terminated);
        match future::select(incoming.next(), terminated).await {
            Either::Left((Some(stream), _)) => Ok(stream),
            _ => Err(self.termination_reason()),
        }
    }

    /// Close the session.
    ///
    /// Tells the peer that the session is going away, terminates all streams
    /// and waits until queued frames are written and the connection is closed.
    pub async fn close(&self) {
        if self.inner.state.termination().is_none() {
            let _ = self.inner.state.send(Frame::go_away(GoAwayCode::Normal));
            self.inner.state.terminate(SessionError::Closed);
        }
        let writer_task = lock(&self.inner.writer_task).take();
        if let Some(writer_task) = writer_task {
            writer_task.await
        }
    }

    /// Wait until the session terminates and return the reason.
    pub async fn closed(&self) -> SessionError {
        self.inner.state.terminated().await;
        self.termination_reason()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.termination().is_some()
    }

    /// The reason the session terminated, if it did.
    pub fn termination(&self) -> Option<SessionError> {
        self.inner.state.termination()
    }

    /// Number of streams that have not been dropped yet.
    pub fn stream_count(&self) -> usize {
        self.inner.state.streams.len()
    }

    fn termination_reason(&self) -> SessionError {
        self.inner
            .state
            .termination()
            .unwrap_or(SessionError::Closed)
    }
}

/// State shared by the session handles, the streams and the session tasks.
pub(crate) struct SessionState {
    pub streams: CHashMap<u32, Arc<Mutex<StreamState>>>,
    frames: mpsc::UnboundedSender<Frame>,
    termination: Mutex<Option<SessionError>>,
    termination_sender: Mutex<Option<oneshot::Sender<()>>>,
    terminated: future::Shared<oneshot::Receiver<()>>,
    pending_ping: Mutex<Option<u32>>,
}

impl SessionState {
    fn new(frames: mpsc::UnboundedSender<Frame>) -> Self {
        let (termination_sender, termination_receiver) = oneshot::channel();
        Self {
            streams: CHashMap::new(),
            frames,
            termination: Mutex::new(None),
            termination_sender: Mutex::new(Some(termination_sender)),
            terminated: termination_receiver.shared(),
            pending_ping: Mutex::new(None),
        }
    }

    /// Queue `frame` for sending. Fails with the termination reason if the
    /// session terminated.
    pub fn send(&self, frame: Frame) -> Result<(), SessionError> {
        self.frames
            .unbounded_send(frame)
            .map_err(|_| self.termination().unwrap_or(SessionError::Closed))
    }

    pub fn termination(&self) -> Option<SessionError> {
        lock(&self.termination).clone()
    }

    /// Resolves once [SessionState::terminate] has been called.
    pub fn terminated(&self) -> impl Future<Output = ()> + Send + 'static {
        self.terminated.clone().map(|_| ())
    }

    /// Record the termination reason, stop the writer after it sent all queued
    /// frames and wake every task waiting on a stream. Only the first reason
    /// is kept.
    pub fn terminate(&self, reason: SessionError) {
        {
            let mut termination = lock(&self.termination);
            if termination.is_some() {
                return;
            }
            tracing::debug!(%reason, "session terminated");
            *termination = Some(reason);
        }
        self.frames.close_channel();
        if let Some(sender) = lock(&self.termination_sender).take() {
            let _ = sender.send(());
        }
        self.streams.retain(|_, stream_state| {
            lock(stream_state).wake();
            true
        });
    }

    fn start_ping(&self, value: u32) -> Option<u32> {
        lock(&self.pending_ping).replace(value)
    }

    fn pong(&self, value: u32) {
        let mut pending_ping = lock(&self.pending_ping);
        if *pending_ping == Some(value) {
            *pending_ping = None;
        }
    }
}

/// Read frames until the connection ends, the peer misbehaves or the session terminates.
#[tracing::instrument(level = "debug", skip(dispatcher, reader))]
async fn read_frames<R: AsyncRead + Unpin>(dispatcher: FrameDispatcher, reader: R) {
    let session = Arc::clone(&dispatcher.session);
    let reading = dispatcher.run(reader);
    futures::pin_mut!(reading);
    let terminated = session.terminated();
    futures::pin_mut!(terminated);
    match future::select(reading, terminated).await {
        Either::Left((Ok(()), _)) => session.terminate(SessionError::RemoteClosed),
        Either::Left((Err(error), _)) => {
            if let SessionError::Protocol(_) | SessionError::InvalidHeader(_) = error {
                let _ = session.send(Frame::go_away(GoAwayCode::ProtocolError));
            }
            session.terminate(error)
        }
        Either::Right(_) => (),
    }
}

async fn write_frames(
    writer: impl AsyncWrite + Unpin,
    frames: mpsc::UnboundedReceiver<Frame>,
) -> std::io::Result<()> {
    frames
        .map(|frame| {
            tracing::trace!(header = ?frame.header, "send frame");
            Ok(frame.build())
        })
        .forward(writer.into_sink())
        .await
}

/// Ping the peer every `interval` and terminate the session if a ping is not
/// answered before the next one is due.
async fn keepalive(session: Arc<SessionState>, interval: Duration) {
    let mut ping = 0u32;
    loop {
        if async_std::future::timeout(interval, session.terminated())
            .await
            .is_ok()
        {
            return;
        }
        ping = ping.wrapping_add(1);
        if let Some(unanswered) = session.start_ping(ping) {
            tracing::warn!(ping = unanswered, "keepalive ping was not answered");
            session.terminate(SessionError::KeepaliveTimeout);
            return;
        }
        if session.send(Frame::new(Header::ping(ping, false))).is_err() {
            return;
        }
    }
}

/// Applies frames received from the peer to the session.
struct FrameDispatcher {
    session: Arc<SessionState>,
    incoming: mpsc::Sender<Stream>,
    role: Role,
    accepts_streams: bool,
}

impl FrameDispatcher {
    /// Returns `Ok(())` if the peer closed the connection or sent `GoAway`.
    async fn run(mut self, mut reader: impl AsyncRead + Unpin) -> Result<(), SessionError> {
        loop {
            let frame = match read_frame(&mut reader, STREAM_WINDOW as usize).await? {
                Some(frame) => frame,
                None => {
                    tracing::debug!("connection closed by peer");
                    return Ok(());
                }
            };
            tracing::trace!(header = ?frame.header, "received frame");
            match frame.header.frame_type {
                FrameType::Ping => self.handle_ping(frame.header),
                FrameType::GoAway => {
                    let code = GoAwayCode::from_u32(frame.header.length);
                    tracing::debug!(?code, "peer is going away");
                    return Ok(());
                }
                FrameType::Data | FrameType::WindowUpdate => self.handle_stream_frame(frame)?,
            }
        }
    }

    fn handle_ping(&self, header: Header) {
        if header.flags.ack {
            self.session.pong(header.length)
        } else {
            let _ = self
                .session
                .send(Frame::new(Header::ping(header.length, true)));
        }
    }

    fn handle_stream_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        let Frame { header, body } = frame;
        if header.flags.syn && !self.open_incoming(header.stream_id)? {
            return Ok(());
        }

        let stream_state = match self.session.streams.get(&header.stream_id) {
            Some(stream_state) => Arc::clone(&*stream_state),
            None => {
                // The stream was dropped locally. Tell the peer to stop sending.
                if !body.is_empty() && !header.flags.rst {
                    let _ = self.session.send(Frame::rst(header.stream_id));
                }
                return Ok(());
            }
        };
        let mut stream_state = lock(&stream_state);
        if header.frame_type == FrameType::WindowUpdate {
            stream_state.grant(header.length);
        } else if !stream_state.receive(&body) {
            return Err(SessionError::Protocol("peer exceeded the stream window"));
        }
        if header.flags.fin {
            stream_state.remote_fin();
        }
        if header.flags.rst {
            stream_state.reset();
        }
        Ok(())
    }

    /// Register a stream opened by the peer and queue it for [Session::accept_stream].
    ///
    /// Returns `false` if the stream was reset because it cannot be accepted.
    fn open_incoming(&mut self, stream_id: u32) -> Result<bool, SessionError> {
        if !self.accepts_streams || stream_id == 0 || self.role.owns_stream_id(stream_id) {
            return Err(SessionError::Protocol(
                "peer opened a stream it is not allowed to open",
            ));
        }
        if self.session.streams.contains_key(&stream_id) {
            return Err(SessionError::Protocol("peer reused a stream id"));
        }

        let stream_state = Arc::new(Mutex::new(StreamState::new()));
        self.session
            .streams
            .insert(stream_id, Arc::clone(&stream_state));
        let stream = Stream::new(stream_id, stream_state, Arc::clone(&self.session));
        match self.incoming.try_send(stream) {
            Ok(()) => {
                tracing::trace!(stream_id, "accepted stream");
                Ok(true)
            }
            Err(error) => {
                if error.is_full() {
                    tracing::warn!(stream_id, "accept backlog is full, resetting stream");
                }
                drop(error.into_inner());
                Ok(false)
            }
        }
    }
}
