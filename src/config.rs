use std::time::Duration;
use stream_mux::Role;

/// Settings of a [crate::Tunnel].
///
/// Both peers of a tunnel need complementary [TunnelConfig::role]s and the
/// same value for `session.bidirectional`.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// How the physical connection is obtained.
    pub connect: Connect,
    /// Role of the multiplexed session. Independent of [TunnelConfig::connect].
    pub role: Role,
    pub session: stream_mux::Config,
    /// Call that is issued periodically when the session can open streams.
    pub call: Option<OutboundCall>,
    pub call_interval: Duration,
    /// Upper bound for a single outbound call.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    /// Establish a new connection when an established session fails.
    pub reconnect: bool,
}

impl TunnelConfig {
    pub fn new(connect: Connect, role: Role) -> Self {
        Self {
            connect,
            role,
            session: stream_mux::Config::default(),
            call: None,
            call_interval: Duration::from_secs(2),
            call_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            reconnect: false,
        }
    }

    /// Configuration of the peer behind a NAT: dial `addr` and accept streams.
    pub fn dial(addr: impl ToString) -> Self {
        Self::new(
            Connect::Dial {
                addr: addr.to_string(),
                timeout: Duration::from_secs(10),
            },
            Role::Acceptor,
        )
    }

    /// Configuration of the reachable peer: accept one connection on `addr`
    /// and open streams.
    pub fn listen(addr: impl ToString) -> Self {
        Self::new(
            Connect::Listen {
                addr: addr.to_string(),
            },
            Role::Opener,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connect {
    /// Connect to the rendezvous peer at `addr`.
    Dial { addr: String, timeout: Duration },
    /// Bind to `addr` and accept exactly one connection.
    Listen { addr: String },
}

impl std::fmt::Display for Connect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connect::Dial { addr, .. } => write!(f, "dial {}", addr),
            Connect::Listen { addr } => write!(f, "listen on {}", addr),
        }
    }
}

/// Outbound call with a dotted method name like `tunnel.echo`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCall {
    pub method: String,
    pub args: Vec<serde_json::Value>,
}

impl OutboundCall {
    pub fn new(method: impl ToString, args: Vec<serde_json::Value>) -> Self {
        Self {
            method: method.to_string(),
            args,
        }
    }
}

/// How often and how long to wait before establishing a connection again
/// after a failed attempt.
///
/// The delay starts at `initial_backoff` and doubles with every attempt up
/// to `max_backoff`. The default policy does not retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (starting at zero). Returns `None`
    /// when no retries are left.
    pub fn backoff(&self, retry: u32) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        let backoff = self
            .initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff);
        Some(backoff.min(self.max_backoff))
    }
}
