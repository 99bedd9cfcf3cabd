//! Accept many peers on one address and run a tunnel for each of them.
use futures::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Connect, TunnelConfig};
use crate::error::ConnectError;
use crate::shutdown::ShutdownSignal;
use crate::tunnel::{lock, until_shutdown, Tunnel};

/// Pause after a failed `accept` so that a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Rendezvous peer that hosts any number of tunnels.
///
/// Every accepted connection gets its own [Tunnel] built from the same
/// configuration and sharing the same service. The peers are independent: a
/// failing session only ends its own tunnel.
#[derive(Clone)]
pub struct Rendezvous {
    addr: String,
    config: Arc<TunnelConfig>,
    service: Arc<muxrpc::Service>,
    max_peers: Option<usize>,
    peers: Arc<Mutex<Vec<(u64, Tunnel)>>>,
}

impl std::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rendezvous")
            .field("addr", &self.addr)
            .field("max_peers", &self.max_peers)
            .field("peers", &lock(&self.peers).len())
            .finish()
    }
}

impl Rendezvous {
    /// Listen on `addr`. [TunnelConfig::connect], [TunnelConfig::retry] and
    /// [TunnelConfig::reconnect] of `config` have no effect.
    pub fn new(
        addr: impl ToString,
        mut config: TunnelConfig,
        service: impl Into<Arc<muxrpc::Service>>,
    ) -> Self {
        let addr = addr.to_string();
        config.connect = Connect::Listen { addr: addr.clone() };
        Self {
            addr,
            config: Arc::new(config),
            service: service.into(),
            max_peers: None,
            peers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reject connections while `max_peers` tunnels are running.
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = Some(max_peers);
        self
    }

    /// Tunnels of the peers that are currently connected.
    pub fn peers(&self) -> Vec<Tunnel> {
        lock(&self.peers)
            .iter()
            .map(|(_, tunnel)| tunnel.clone())
            .collect()
    }

    /// Accept peers until `shutdown` is triggered.
    ///
    /// The tunnels of all peers observe the same shutdown signal. Returns
    /// after every tunnel has stopped.
    #[tracing::instrument(level = "info", skip(self, shutdown), fields(addr = %self.addr))]
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<(), ConnectError> {
        let listener = async_std::net::TcpListener::bind(self.addr.as_str())
            .await
            .map_err(|source| ConnectError::Bind {
                addr: self.addr.clone(),
                source,
            })?;
        tracing::info!(role = %self.config.role, "waiting for peers");

        // Every peer task holds a sender. The receiver ends when all are dropped.
        let (running, mut peers_done) = futures::channel::mpsc::channel::<()>(0);
        let mut next_peer = 0u64;
        while let Some(accepted) = until_shutdown(&shutdown, listener.accept()).await {
            let (connection, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(%error, "failed to accept connection");
                    async_std::task::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };
            if let Some(max_peers) = self.max_peers {
                if lock(&self.peers).len() >= max_peers {
                    tracing::warn!(%peer_addr, max_peers, "too many peers, rejecting connection");
                    continue;
                }
            }

            next_peer += 1;
            let peer = next_peer;
            let tunnel = Tunnel::new(TunnelConfig::clone(&self.config), Arc::clone(&self.service));
            lock(&self.peers).push((peer, tunnel.clone()));
            tracing::info!(%peer_addr, peer, "peer connected");

            let peers = Arc::clone(&self.peers);
            let signal = shutdown.clone();
            let running = running.clone();
            async_std::task::spawn(async move {
                let _ = tunnel.run_connection(connection, signal).await;
                lock(&peers).retain(|(id, _)| *id != peer);
                tracing::info!(peer, "peer disconnected");
                drop(running);
            });
        }

        drop(listener);
        drop(running);
        tracing::info!("shutting down, waiting for peers");
        while peers_done.next().await.is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shutdown;

    #[async_std::test]
    async fn bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let rendezvous = Rendezvous::new(&addr, TunnelConfig::listen(&addr), muxrpc::Service::new());
        let (_shutdown, signal) = shutdown::channel();
        match rendezvous.run(signal).await {
            Err(ConnectError::Bind { addr: error_addr, .. }) => assert_eq!(error_addr, addr),
            result => panic!("Unexpected result {:?}", result),
        }
    }

    #[async_std::test]
    async fn shutdown_without_peers() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let rendezvous = Rendezvous::new(&addr, TunnelConfig::listen(&addr), muxrpc::Service::new());
        let (shutdown, signal) = shutdown::channel();
        let running = async_std::task::spawn({
            let rendezvous = rendezvous.clone();
            async move { rendezvous.run(signal).await }
        });
        async_std::task::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        running.await.unwrap();
        assert!(rendezvous.peers().is_empty());
    }
}
