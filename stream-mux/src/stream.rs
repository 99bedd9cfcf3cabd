use futures::prelude::*;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::config::{MAX_FRAME_PAYLOAD, STREAM_WINDOW};
use crate::frame::Frame;
use crate::header::Header;
use crate::session::SessionState;
use crate::utils::lock;

/// State of one stream shared between the [Stream] handle and the frame reader.
#[derive(Debug)]
pub(crate) struct StreamState {
    recv_buffer: VecDeque<u8>,
    /// Credit the peer has left for sending to us.
    recv_window: u32,
    /// Bytes read since the last window update.
    consumed: u32,
    send_window: u32,
    local_fin: bool,
    remote_fin: bool,
    reset: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            recv_buffer: VecDeque::new(),
            recv_window: STREAM_WINDOW,
            consumed: 0,
            send_window: STREAM_WINDOW,
            local_fin: false,
            remote_fin: false,
            reset: false,
            read_waker: None,
            write_waker: None,
        }
    }

    /// Buffer data received from the peer.
    ///
    /// Returns `false` if the peer exceeded the window it was granted.
    pub fn receive(&mut self, data: &[u8]) -> bool {
        let len = data.len() as u32;
        if len > self.recv_window {
            return false;
        }
        self.recv_window -= len;
        if !self.remote_fin {
            self.recv_buffer.extend(data);
        }
        self.wake_reader();
        true
    }

    pub fn grant(&mut self, credit: u32) {
        self.send_window = self.send_window.saturating_add(credit);
        self.wake_writer();
    }

    pub fn remote_fin(&mut self) {
        self.remote_fin = true;
        self.wake_reader();
    }

    pub fn reset(&mut self) {
        self.reset = true;
        self.wake_reader();
        self.wake_writer();
    }

    pub fn wake(&mut self) {
        self.wake_reader();
        self.wake_writer();
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake()
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake()
        }
    }
}

/// A virtual stream inside a [crate::Session].
///
/// The stream is ordered and reliable and implements [AsyncRead] and
/// [AsyncWrite]. [AsyncWriteExt::close] half-closes the stream: the peer reads
/// the end of the stream once it consumed all buffered data and may continue
/// to write. Dropping a stream before both directions are closed resets it.
pub struct Stream {
    id: u32,
    state: Arc<Mutex<StreamState>>,
    session: Arc<SessionState>,
}

impl Stream {
    pub(crate) fn new(id: u32, state: Arc<Mutex<StreamState>>, session: Arc<SessionState>) -> Self {
        Self { id, state, session }
    }

    /// Identifier of the stream that is unique within its session.
    pub fn id(&self) -> u32 {
        self.id
    }

    fn session_error(&self) -> Option<std::io::Error> {
        self.session
            .termination()
            .map(|reason| reason.to_io_error())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        let mut state = lock(&this.state);

        if !state.recv_buffer.is_empty() {
            let count = std::cmp::min(buf.len(), state.recv_buffer.len());
            for (target, byte) in buf.iter_mut().zip(state.recv_buffer.drain(..count)) {
                *target = byte;
            }
            state.consumed += count as u32;
            if state.consumed >= STREAM_WINDOW / 2 && !state.remote_fin {
                let credit = std::mem::replace(&mut state.consumed, 0);
                state.recv_window += credit;
                drop(state);
                // Fails only if the session terminated. The next read reports that.
                let _ = this
                    .session
                    .send(Frame::new(Header::window_update(this.id, credit)));
            }
            return Poll::Ready(Ok(count));
        }

        if state.remote_fin {
            return Poll::Ready(Ok(0));
        }
        if state.reset {
            return Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()));
        }
        if let Some(error) = this.session_error() {
            return Poll::Ready(Err(error));
        }
        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        let mut state = lock(&this.state);

        if state.local_fin {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stream is closed for writing",
            )));
        }
        if state.reset {
            return Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()));
        }
        if let Some(error) = this.session_error() {
            return Poll::Ready(Err(error));
        }
        if state.send_window == 0 {
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let count = buf
            .len()
            .min(state.send_window as usize)
            .min(MAX_FRAME_PAYLOAD);
        state.send_window -= count as u32;
        drop(state);
        match this.session.send(Frame::data(this.id, buf[..count].to_vec())) {
            Ok(()) => Poll::Ready(Ok(count)),
            Err(reason) => Poll::Ready(Err(reason.to_io_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let mut state = lock(&this.state);
        if state.local_fin || state.reset {
            return Poll::Ready(Ok(()));
        }
        state.local_fin = true;
        drop(state);
        match this.session.send(Frame::fin(this.id)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(reason) => Poll::Ready(Err(reason.to_io_error())),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let finished = {
            let state = lock(&self.state);
            (state.local_fin && state.remote_fin) || state.reset
        };
        if !finished {
            tracing::trace!(stream_id = self.id, "resetting dropped stream");
            let _ = self.session.send(Frame::rst(self.id));
        }
        self.session.streams.remove(&self.id);
    }
}
