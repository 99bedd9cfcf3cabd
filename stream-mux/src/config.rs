use std::time::Duration;

/// Receive window of every stream, in each direction.
///
/// The window is part of the protocol: both peers start every stream with
/// this much credit.
pub const STREAM_WINDOW: u32 = 256 * 1024;

/// Largest payload carried by a single data frame.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Session settings.
///
/// Both peers of a connection must agree on [Config::bidirectional]. The
/// remaining settings only affect the local side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Allow the acceptor to open streams and the opener to accept them.
    pub bidirectional: bool,
    /// Number of inbound streams that may wait for [crate::Session::accept_stream].
    /// Streams beyond this limit are reset.
    pub accept_backlog: usize,
    /// Interval between keepalive pings. `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,
    /// Upper bound for exchanging the session preface.
    pub handshake_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bidirectional: false,
            accept_backlog: 256,
            keepalive_interval: Some(Duration::from_secs(30)),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
