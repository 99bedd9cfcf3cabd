//! Run a tunnel: establish the connection and the session, serve inbound
//! calls and issue outbound calls until shutdown or failure.
use futures::future::{self, Either};
use futures::prelude::*;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::adapter::{StreamDialer, StreamListener};
use crate::config::{Connect, OutboundCall, TunnelConfig};
use crate::error::{ConnectError, StreamAcceptError, TunnelError};
use crate::shutdown::ShutdownSignal;
use stream_mux::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Establishing the physical connection
    Connecting,
    /// Connection established, exchanging the session preface
    SessionEstablished,
    /// Serving inbound calls and issuing outbound calls
    Serving,
    /// Establishing a new connection after the session failed
    Reconnecting,
    /// The tunnel stopped and will not be used again
    Closed,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TunnelState::Connecting => "connecting",
            TunnelState::SessionEstablished => "session established",
            TunnelState::Serving => "serving",
            TunnelState::Reconnecting => "reconnecting",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Outcomes of the outbound calls of a tunnel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallStats {
    pub succeeded: u64,
    pub failed: u64,
    pub last_response: Option<muxrpc::Body>,
}

/// One end of a tunnel.
///
/// The tunnel is cheap to clone and clones observe the same state.
///
/// ```no_run
/// # #[async_std::main]
/// # async fn main() -> Result<(), nat_tunnel::TunnelError> {
/// let mut config = nat_tunnel::TunnelConfig::dial("rendezvous.example.com:7000");
/// config.call = Some(nat_tunnel::OutboundCall::new(
///     "tunnel.echo",
///     vec![serde_json::json!("hello")],
/// ));
/// let tunnel = nat_tunnel::Tunnel::new(config, nat_tunnel::echo::root_service());
/// let (_shutdown, signal) = nat_tunnel::shutdown::channel();
/// tunnel.run(signal).await
/// # }
/// ```
#[derive(Clone)]
pub struct Tunnel {
    config: Arc<TunnelConfig>,
    service: Arc<muxrpc::Service>,
    state: Arc<Mutex<TunnelState>>,
    stats: Arc<Mutex<CallStats>>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl Tunnel {
    /// Create a tunnel that hosts `service` for calls from the peer.
    ///
    /// Pass an `Arc<Service>` to share one service between several tunnels.
    pub fn new(config: TunnelConfig, service: impl Into<Arc<muxrpc::Service>>) -> Self {
        Self {
            config: Arc::new(config),
            service: service.into(),
            state: Arc::new(Mutex::new(TunnelState::Connecting)),
            stats: Arc::new(Mutex::new(CallStats::default())),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> TunnelState {
        *lock(&self.state)
    }

    pub fn call_stats(&self) -> CallStats {
        lock(&self.stats).clone()
    }

    /// Run the tunnel until `shutdown` is triggered or the tunnel fails.
    ///
    /// Returns `Ok(())` after shutdown. Connection failures are retried
    /// according to [TunnelConfig::retry]. A failed session ends the tunnel
    /// unless [TunnelConfig::reconnect] is set. Failed outbound calls are
    /// logged and never end the tunnel.
    #[tracing::instrument(level = "info", skip(self, shutdown))]
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<(), TunnelError> {
        tracing::info!(connect = %self.config.connect, role = %self.config.role, "starting tunnel");
        let result = self.run_sessions(&shutdown).await;
        self.finish(result)
    }

    /// Run the tunnel over a connection that is already established.
    ///
    /// [TunnelConfig::connect], [TunnelConfig::retry] and
    /// [TunnelConfig::reconnect] are ignored. The tunnel ends with the
    /// session.
    #[tracing::instrument(level = "info", skip(self, connection, shutdown))]
    pub async fn run_connection<T>(&self, connection: T, shutdown: ShutdownSignal) -> Result<(), TunnelError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let result = match self.establish(connection, &shutdown).await {
            Ok(Some(session)) => self.serve(&session, &shutdown).await,
            Ok(None) => Ok(()),
            Err(error) => Err(error),
        };
        self.finish(result)
    }

    fn finish(&self, result: Result<(), TunnelError>) -> Result<(), TunnelError> {
        self.set_state(TunnelState::Closed);
        if let Err(error) = &result {
            tracing::error!(%error, "tunnel failed");
        }
        result
    }

    async fn run_sessions(&self, shutdown: &ShutdownSignal) -> Result<(), TunnelError> {
        loop {
            let connection = match until_shutdown(shutdown, self.connect()).await {
                Some(connection) => connection?,
                None => return Ok(()),
            };

            let session = match self.establish(connection, shutdown).await? {
                Some(session) => session,
                None => return Ok(()),
            };

            match self.serve(&session, shutdown).await {
                Ok(()) => return Ok(()),
                Err(error) if self.config.reconnect => {
                    tracing::warn!(%error, "session failed");
                    self.set_state(TunnelState::Reconnecting);
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Exchange the session preface on `connection`. Returns `None` on
    /// shutdown.
    async fn establish<T>(
        &self,
        connection: T,
        shutdown: &ShutdownSignal,
    ) -> Result<Option<Session>, TunnelError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.set_state(TunnelState::SessionEstablished);
        let session = Session::new(connection, self.config.role, self.config.session.clone());
        match until_shutdown(shutdown, session).await {
            Some(session) => {
                self.set_state(TunnelState::Serving);
                Ok(Some(session?))
            }
            None => Ok(None),
        }
    }

    /// Obtain the physical connection, retrying failed attempts.
    async fn connect(&self) -> Result<async_std::net::TcpStream, ConnectError> {
        let mut retry = 0;
        loop {
            match connect_once(&self.config.connect).await {
                Ok(connection) => return Ok(connection),
                Err(error) => match self.config.retry.backoff(retry) {
                    Some(backoff) => {
                        tracing::warn!(%error, ?backoff, retry, "failed to connect");
                        async_std::task::sleep(backoff).await;
                        retry += 1;
                    }
                    None => return Err(error),
                },
            }
        }
    }

    /// Serve calls on `session` until shutdown or until the session terminates.
    ///
    /// On shutdown no new calls are started but calls in progress complete
    /// before the session is closed. Serving inbound calls gets at most
    /// [TunnelConfig::call_timeout] to finish.
    async fn serve(&self, session: &Session, shutdown: &ShutdownSignal) -> Result<(), TunnelError> {
        let serving = if session.can_accept() {
            let listener = StreamListener::new(session.clone());
            let service = Arc::clone(&self.service);
            let stop = shutdown.clone();
            Some(async_std::task::spawn(async move {
                muxrpc::serve_until(listener, service, async move { stop.wait().await })
                    .await
                    .map_err(StreamAcceptError)
            }))
        } else {
            None
        };

        let calling = match (&self.config.call, session.can_open()) {
            (Some(call), true) => {
                let client = muxrpc::Client::new(StreamDialer::new(session.clone()))
                    .with_call_timeout(self.config.call_timeout);
                Some(async_std::task::spawn(call_loop(
                    client,
                    call.clone(),
                    self.config.call_interval,
                    shutdown.clone(),
                    Arc::clone(&self.stats),
                )))
            }
            (Some(call), false) => {
                tracing::warn!(method = %call.method, role = %session.role(), "session cannot open streams, not calling");
                None
            }
            (None, _) => None,
        };

        let termination = until_shutdown(shutdown, session.closed()).await;
        if termination.is_none() {
            tracing::info!("shutting down");
        }

        let serving_result = match serving {
            Some(serving) if termination.is_none() => {
                match async_std::future::timeout(self.config.call_timeout, serving).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!("calls in progress did not finish before shutdown");
                        Ok(())
                    }
                }
            }
            Some(serving) => serving.await,
            None => Ok(()),
        };
        if let Some(calling) = calling {
            calling.await;
        }
        session.close().await;

        match termination {
            None => Ok(()),
            Some(reason) => {
                serving_result?;
                Err(TunnelError::Session(reason))
            }
        }
    }

    fn set_state(&self, state: TunnelState) {
        let mut current = lock(&self.state);
        if *current != state {
            tracing::info!(from = %*current, to = %state, "tunnel state changed");
            *current = state;
        }
    }
}

async fn connect_once(connect: &Connect) -> Result<async_std::net::TcpStream, ConnectError> {
    match connect {
        Connect::Dial { addr, timeout } => {
            let connecting = async_std::net::TcpStream::connect(addr.as_str());
            let connection = async_std::future::timeout(*timeout, connecting)
                .await
                .map_err(|_| ConnectError::Timeout {
                    addr: addr.clone(),
                    timeout: *timeout,
                })?
                .map_err(|source| ConnectError::Dial {
                    addr: addr.clone(),
                    source,
                })?;
            tracing::info!(%addr, "connected");
            Ok(connection)
        }
        Connect::Listen { addr } => {
            let listener = async_std::net::TcpListener::bind(addr.as_str())
                .await
                .map_err(|source| ConnectError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            tracing::info!(%addr, "waiting for connection");
            let (connection, peer_addr) =
                listener
                    .accept()
                    .await
                    .map_err(|source| ConnectError::Accept {
                        addr: addr.clone(),
                        source,
                    })?;
            tracing::info!(%peer_addr, "accepted connection");
            Ok(connection)
        }
    }
}

/// Issue `call` every `interval` until the session of `client` terminates
/// or `shutdown` is triggered. A call in progress on shutdown completes.
#[tracing::instrument(level = "debug", skip(client, call, shutdown, stats), fields(method = %call.method))]
async fn call_loop(
    client: muxrpc::Client<StreamDialer>,
    call: OutboundCall,
    interval: std::time::Duration,
    shutdown: ShutdownSignal,
    stats: Arc<Mutex<CallStats>>,
) {
    let session = client.dialer().session().clone();
    while !session.is_closed() && !shutdown.is_triggered() {
        match client.call_async(&call.method, call.args.clone()).await {
            Ok(response) => {
                tracing::info!(request = ?call.args, ?response, "call succeeded");
                let mut stats = lock(&stats);
                stats.succeeded += 1;
                stats.last_response = Some(response);
            }
            Err(error) => {
                if session.is_closed() {
                    break;
                }
                tracing::warn!(request = ?call.args, %error, "call failed");
                lock(&stats).failed += 1;
            }
        }
        let wait = future::select(session.closed().map(drop).boxed(), shutdown.wait().boxed());
        future::select(async_std::task::sleep(interval).boxed(), wait).await;
    }
}

/// Run `future` to completion unless `shutdown` is triggered first.
pub(crate) async fn until_shutdown<T>(shutdown: &ShutdownSignal, future: impl Future<Output = T>) -> Option<T> {
    let stop = shutdown.wait();
    futures::pin_mut!(future);
    futures::pin_mut!(stop);
    match future::select(future, stop).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(((), _)) => None,
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shutdown;
    use std::time::Duration;

    fn unused_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[async_std::test]
    async fn connect_refused_without_retry() {
        let config = TunnelConfig::dial(unused_addr());
        let tunnel = Tunnel::new(config, muxrpc::Service::new());
        let (_shutdown, signal) = shutdown::channel();
        match tunnel.run(signal).await {
            Err(TunnelError::Connect(ConnectError::Dial { .. })) => (),
            result => panic!("Unexpected result {:?}", result),
        }
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }

    #[async_std::test]
    async fn connect_retries() {
        let mut config = TunnelConfig::dial(unused_addr());
        config.retry = crate::RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        };
        let tunnel = Tunnel::new(config, muxrpc::Service::new());
        let (_shutdown, signal) = shutdown::channel();
        let start = std::time::Instant::now();
        let result = tunnel.run(signal).await;
        assert!(matches!(result, Err(TunnelError::Connect(_))));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[async_std::test]
    async fn shutdown_while_listening() {
        let tunnel = Tunnel::new(TunnelConfig::listen(unused_addr()), muxrpc::Service::new());
        let (shutdown, signal) = shutdown::channel();
        let running = async_std::task::spawn({
            let tunnel = tunnel.clone();
            async move { tunnel.run(signal).await }
        });
        async_std::task::sleep(Duration::from_millis(20)).await;
        assert_eq!(tunnel.state(), TunnelState::Connecting);
        shutdown.trigger();
        running.await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }

    #[test]
    fn state_names() {
        assert_eq!(TunnelState::SessionEstablished.to_string(), "session established");
    }
}
