//! Run both ends of a tunnel over loopback TCP.
use futures::prelude::*;
use muxrpc::{Body, CallError, Client, Error, Service};
use nat_tunnel::adapter::{StreamDialer, StreamListener};
use nat_tunnel::{
    echo, shutdown, OutboundCall, Rendezvous, RetryPolicy, Tunnel, TunnelConfig, TunnelError,
    TunnelState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_mux::{Role, Session, SessionError};

const TIMEOUT: Duration = Duration::from_secs(5);

fn session_config() -> stream_mux::Config {
    stream_mux::Config {
        keepalive_interval: None,
        ..stream_mux::Config::default()
    }
}

fn unused_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Connect over loopback TCP. Returns the listening and the dialing side
/// together with a handle of the dialing side's socket for severing the
/// connection.
async fn tcp_connection() -> (
    async_std::net::TcpStream,
    async_std::net::TcpStream,
    async_std::net::TcpStream,
) {
    let listener = async_std::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted, dialed) = future::join(listener.accept(), async_std::net::TcpStream::connect(addr)).await;
    let dialed = dialed.unwrap();
    (accepted.unwrap().0, dialed.clone(), dialed)
}

/// Wait until `condition` holds, panicking after [TIMEOUT].
async fn wait_for(mut condition: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !condition() {
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for condition");
        async_std::task::sleep(Duration::from_millis(5)).await;
    }
}

fn dial_config(addr: &str, role: Role) -> TunnelConfig {
    let mut config = TunnelConfig::dial(addr);
    config.role = role;
    config.session = session_config();
    config.retry = RetryPolicy {
        max_retries: 100,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(50),
    };
    config
}

fn listen_config(addr: &str, role: Role) -> TunnelConfig {
    let mut config = TunnelConfig::listen(addr);
    config.role = role;
    config.session = session_config();
    config
}

#[async_std::test]
async fn echo_through_role_adapters() {
    let _ = tracing_subscriber::fmt::try_init();
    // X listens and hosts the service, Y dialed and calls it.
    let (x_connection, y_connection, _) = tcp_connection().await;
    let (x, y) = future::join(
        Session::new(x_connection, Role::Acceptor, session_config()),
        Session::new(y_connection, Role::Opener, session_config()),
    )
    .await;
    let (x, y) = (x.unwrap(), y.unwrap());

    async_std::task::spawn(muxrpc::serve(StreamListener::new(x), echo::root_service()));
    let client = Client::new(StreamDialer::new(y)).with_call_timeout(TIMEOUT);
    let response = client
        .call_async("tunnel.echo", vec![serde_json::json!("hello")])
        .await
        .unwrap();
    assert_eq!(response.decode_json::<String>().unwrap(), "Echo: hello");
}

#[async_std::test]
async fn duplex_through_role_adapters() {
    let (x_connection, y_connection, _) = tcp_connection().await;
    let (x, y) = future::join(
        Session::new(x_connection, Role::Opener, session_config()),
        Session::new(y_connection, Role::Acceptor, session_config()),
    )
    .await;
    let (x, y) = (x.unwrap(), y.unwrap());

    async_std::task::spawn(muxrpc::serve(StreamListener::new(y), echo::root_service()));
    let client = Client::new(StreamDialer::new(x));
    let (responses, mut sink) = client.start_duplex("tunnel.stream", vec![]).await.unwrap();
    sink.send(Body::json(&"a")).await.unwrap();
    sink.send(Body::json(&"b")).await.unwrap();
    sink.close().await.unwrap();
    let responses = responses
        .map_ok(|body| body.decode_json::<String>().unwrap())
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert_eq!(responses, vec!["a more text", "b more text"]);
}

#[async_std::test]
async fn severed_connection_unblocks_accept_and_call() {
    let (x_connection, y_connection, y_socket) = tcp_connection().await;
    let (x, y) = future::join(
        Session::new(x_connection, Role::Acceptor, session_config()),
        Session::new(y_connection, Role::Opener, session_config()),
    )
    .await;
    let (x, y) = (x.unwrap(), y.unwrap());

    let (called_sender, called) = futures::channel::oneshot::channel::<()>();
    let called_sender = std::sync::Mutex::new(Some(called_sender));
    let mut service = Service::new();
    service.add_async("hang", move |_: Vec<serde_json::Value>| {
        if let Some(sender) = called_sender.lock().unwrap().take() {
            let _ = sender.send(());
        }
        future::pending::<Result<Body, Error>>()
    });
    let serving = async_std::task::spawn(muxrpc::serve(StreamListener::new(x), service));

    let client = Client::new(StreamDialer::new(y));
    let calling = async_std::task::spawn(async move { client.call_async("hang", vec![]).await });
    called.await.unwrap();

    y_socket.shutdown(std::net::Shutdown::Both).unwrap();

    let accept_error = async_std::future::timeout(TIMEOUT, serving)
        .await
        .expect("accept did not unblock")
        .unwrap_err();
    assert!(!matches!(accept_error, SessionError::Closed));
    let call_result = async_std::future::timeout(TIMEOUT, calling)
        .await
        .expect("call did not unblock");
    assert!(call_result.is_err());
}

#[async_std::test]
async fn call_timeout_keeps_session() {
    let (x_connection, y_connection, _) = tcp_connection().await;
    let (x, y) = future::join(
        Session::new(x_connection, Role::Acceptor, session_config()),
        Session::new(y_connection, Role::Opener, session_config()),
    )
    .await;
    let (x, y) = (x.unwrap(), y.unwrap());

    let mut service = Service::new();
    service.add_async("hang", |_: Vec<serde_json::Value>| {
        future::pending::<Result<Body, Error>>()
    });
    service.add_service(echo::GROUP, echo::service());
    async_std::task::spawn(muxrpc::serve(StreamListener::new(x), service));

    let client = Client::new(StreamDialer::new(y.clone())).with_call_timeout(Duration::from_millis(50));
    match client.call_async("hang", vec![]).await {
        Err(CallError::Timeout { .. }) => (),
        result => panic!("Unexpected result {:?}", result),
    }
    assert!(!y.is_closed());
    let response = client
        .call_async("tunnel.echo", vec![serde_json::json!("again")])
        .await
        .unwrap();
    assert_eq!(response.decode_json::<String>().unwrap(), "Echo: again");
}

#[async_std::test]
async fn tunnel_echo() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = unused_addr();

    let x = Tunnel::new(listen_config(&addr, Role::Acceptor), echo::root_service());
    let (x_shutdown, x_signal) = shutdown::channel();
    let x_running = async_std::task::spawn({
        let x = x.clone();
        async move { x.run(x_signal).await }
    });

    let mut y_config = dial_config(&addr, Role::Opener);
    y_config.call = Some(OutboundCall::new("tunnel.echo", vec![serde_json::json!("hello")]));
    y_config.call_interval = Duration::from_millis(20);
    let y = Tunnel::new(y_config, Service::new());
    let (y_shutdown, y_signal) = shutdown::channel();
    let y_running = async_std::task::spawn({
        let y = y.clone();
        async move { y.run(y_signal).await }
    });

    wait_for(|| y.call_stats().succeeded >= 2).await;
    assert_eq!(x.state(), TunnelState::Serving);
    assert_eq!(y.state(), TunnelState::Serving);
    let stats = y.call_stats();
    assert_eq!(stats.failed, 0);
    let response = stats.last_response.unwrap();
    assert_eq!(response.decode_json::<String>().unwrap(), "Echo: hello");

    y_shutdown.trigger();
    y_running.await.unwrap();
    assert_eq!(y.state(), TunnelState::Closed);

    let x_error = x_running.await.unwrap_err();
    assert!(matches!(x_error.session_error(), Some(SessionError::RemoteClosed)));
    assert_eq!(x.state(), TunnelState::Closed);
    drop(x_shutdown);
}

#[async_std::test]
async fn call_error_does_not_stop_calls() {
    let addr = unused_addr();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut service = Service::new();
    service.add_async("flaky", {
        let calls = Arc::clone(&calls);
        move |_: Vec<serde_json::Value>| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(Error::new("FLAKY", "first call fails"))
                } else {
                    Ok(Body::json(&call))
                }
            }
        }
    });
    let x = Tunnel::new(listen_config(&addr, Role::Acceptor), service);
    let (_x_shutdown, x_signal) = shutdown::channel();
    async_std::task::spawn({
        let x = x.clone();
        async move { x.run(x_signal).await }
    });

    let mut y_config = dial_config(&addr, Role::Opener);
    y_config.call = Some(OutboundCall::new("flaky", vec![]));
    y_config.call_interval = Duration::from_millis(10);
    let y = Tunnel::new(y_config, Service::new());
    let (_y_shutdown, y_signal) = shutdown::channel();
    async_std::task::spawn({
        let y = y.clone();
        async move { y.run(y_signal).await }
    });

    wait_for(|| y.call_stats().succeeded >= 1).await;
    let stats = y.call_stats();
    assert_eq!(stats.failed, 1);
    assert!(stats.last_response.unwrap().decode_json::<usize>().unwrap() >= 1);
    assert_eq!(y.state(), TunnelState::Serving);
}

#[async_std::test]
async fn same_roles_fail_fast() {
    for role in vec![Role::Opener, Role::Acceptor] {
        let addr = unused_addr();
        let x = Tunnel::new(listen_config(&addr, role), Service::new());
        let y = Tunnel::new(dial_config(&addr, role), Service::new());
        let (_x_shutdown, x_signal) = shutdown::channel();
        let (_y_shutdown, y_signal) = shutdown::channel();

        let (x_result, y_result) = async_std::future::timeout(
            TIMEOUT,
            future::join(x.run(x_signal), y.run(y_signal)),
        )
        .await
        .expect("tunnels did not fail");
        for result in vec![x_result, y_result] {
            match result {
                Err(TunnelError::Session(SessionError::RoleConflict { role: conflict })) => {
                    assert_eq!(conflict, role)
                }
                result => panic!("Unexpected result {:?}", result),
            }
        }
        assert_eq!(x.state(), TunnelState::Closed);
        assert_eq!(y.state(), TunnelState::Closed);
    }
}

#[async_std::test]
async fn reconnect_after_peer_restart() {
    let addr = unused_addr();

    let mut y_config = dial_config(&addr, Role::Opener);
    y_config.call = Some(OutboundCall::new("tunnel.echo", vec![serde_json::json!("hello")]));
    y_config.call_interval = Duration::from_millis(10);
    y_config.reconnect = true;
    let y = Tunnel::new(y_config, Service::new());
    let (_y_shutdown, y_signal) = shutdown::channel();
    async_std::task::spawn({
        let y = y.clone();
        async move { y.run(y_signal).await }
    });

    for _ in 0..2 {
        let before = y.call_stats().succeeded;
        let x = Tunnel::new(listen_config(&addr, Role::Acceptor), echo::root_service());
        let (x_shutdown, x_signal) = shutdown::channel();
        let x_running = async_std::task::spawn({
            let x = x.clone();
            async move { x.run(x_signal).await }
        });
        // Calls succeed again only through the new session.
        wait_for(|| y.call_stats().succeeded > before).await;
        assert_eq!(y.state(), TunnelState::Serving);
        x_shutdown.trigger();
        x_running.await.unwrap();
        wait_for(|| y.state() == TunnelState::Reconnecting).await;
    }
}

/// Service with a `slow` method that reports when it was called and responds
/// after a delay.
fn slow_service() -> (Service, futures::channel::mpsc::UnboundedReceiver<()>) {
    let (started_sender, started) = futures::channel::mpsc::unbounded();
    let mut service = Service::new();
    service.add_async("slow", move |_: Vec<serde_json::Value>| {
        let _ = started_sender.unbounded_send(());
        async move {
            async_std::task::sleep(Duration::from_millis(300)).await;
            Ok(Body::json(&"done"))
        }
    });
    (service, started)
}

#[async_std::test]
async fn shutdown_completes_outbound_call_in_progress() {
    let addr = unused_addr();
    let (service, mut started) = slow_service();
    let x = Tunnel::new(listen_config(&addr, Role::Acceptor), service);
    let (_x_shutdown, x_signal) = shutdown::channel();
    async_std::task::spawn({
        let x = x.clone();
        async move { x.run(x_signal).await }
    });

    let mut y_config = dial_config(&addr, Role::Opener);
    y_config.call = Some(OutboundCall::new("slow", vec![]));
    y_config.call_interval = Duration::from_millis(10);
    let y = Tunnel::new(y_config, Service::new());
    let (y_shutdown, y_signal) = shutdown::channel();
    let y_running = async_std::task::spawn({
        let y = y.clone();
        async move { y.run(y_signal).await }
    });

    started.next().await;
    y_shutdown.trigger();
    async_std::future::timeout(TIMEOUT, y_running)
        .await
        .expect("shutdown did not finish")
        .unwrap();
    let stats = y.call_stats();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.last_response.unwrap().decode_json::<String>().unwrap(), "done");
    assert_eq!(y.state(), TunnelState::Closed);
}

#[async_std::test]
async fn shutdown_completes_inbound_call_in_progress() {
    let addr = unused_addr();
    let (service, mut started) = slow_service();
    let x = Tunnel::new(listen_config(&addr, Role::Acceptor), service);
    let (x_shutdown, x_signal) = shutdown::channel();
    let x_running = async_std::task::spawn({
        let x = x.clone();
        async move { x.run(x_signal).await }
    });

    let mut y_config = dial_config(&addr, Role::Opener);
    y_config.call = Some(OutboundCall::new("slow", vec![]));
    y_config.call_interval = Duration::from_millis(10);
    let y = Tunnel::new(y_config, Service::new());
    let (_y_shutdown, y_signal) = shutdown::channel();
    let y_running = async_std::task::spawn({
        let y = y.clone();
        async move { y.run(y_signal).await }
    });

    started.next().await;
    x_shutdown.trigger();
    async_std::future::timeout(TIMEOUT, x_running)
        .await
        .expect("shutdown did not finish")
        .unwrap();
    assert_eq!(x.state(), TunnelState::Closed);

    // The peer got the response before the session was closed.
    let y_error = y_running.await.unwrap_err();
    assert!(matches!(y_error.session_error(), Some(SessionError::RemoteClosed)));
    let stats = y.call_stats();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.last_response.unwrap().decode_json::<String>().unwrap(), "done");
}

#[async_std::test]
async fn rendezvous_hosts_many_peers() {
    let _ = tracing_subscriber::fmt::try_init();
    let addr = unused_addr();
    let mut config = listen_config(&addr, Role::Opener);
    config.call = Some(OutboundCall::new("tunnel.echo", vec![serde_json::json!("hello")]));
    config.call_interval = Duration::from_millis(10);
    let rendezvous = Rendezvous::new(&addr, config, Service::new());
    let (rendezvous_shutdown, rendezvous_signal) = shutdown::channel();
    let rendezvous_running = async_std::task::spawn({
        let rendezvous = rendezvous.clone();
        async move { rendezvous.run(rendezvous_signal).await }
    });

    let mut peers = Vec::new();
    for _ in 0..2 {
        let peer = Tunnel::new(dial_config(&addr, Role::Acceptor), echo::root_service());
        let (peer_shutdown, peer_signal) = shutdown::channel();
        let running = async_std::task::spawn({
            let peer = peer.clone();
            async move { peer.run(peer_signal).await }
        });
        peers.push((peer, peer_shutdown, running));
    }

    wait_for(|| {
        let tunnels = rendezvous.peers();
        tunnels.len() == 2 && tunnels.iter().all(|tunnel| tunnel.call_stats().succeeded >= 2)
    })
    .await;
    for tunnel in rendezvous.peers() {
        assert_eq!(tunnel.state(), TunnelState::Serving);
        let response = tunnel.call_stats().last_response.unwrap();
        assert_eq!(response.decode_json::<String>().unwrap(), "Echo: hello");
    }

    // A peer leaving does not affect the other peer.
    let (first, first_shutdown, first_running) = peers.remove(0);
    first_shutdown.trigger();
    first_running.await.unwrap();
    assert_eq!(first.state(), TunnelState::Closed);
    wait_for(|| rendezvous.peers().len() == 1).await;
    let remaining = rendezvous.peers().remove(0);
    let before = remaining.call_stats().succeeded;
    wait_for(|| remaining.call_stats().succeeded > before).await;

    rendezvous_shutdown.trigger();
    rendezvous_running.await.unwrap();
    assert!(rendezvous.peers().is_empty());
    assert_eq!(remaining.state(), TunnelState::Closed);
    for (peer, _peer_shutdown, running) in peers {
        let error = running.await.unwrap_err();
        assert!(matches!(error.session_error(), Some(SessionError::RemoteClosed)));
        assert_eq!(peer.state(), TunnelState::Closed);
    }
}

#[async_std::test]
async fn rendezvous_rejects_peers_beyond_limit() {
    let addr = unused_addr();
    let rendezvous =
        Rendezvous::new(&addr, listen_config(&addr, Role::Opener), Service::new()).with_max_peers(1);
    let (_rendezvous_shutdown, rendezvous_signal) = shutdown::channel();
    async_std::task::spawn({
        let rendezvous = rendezvous.clone();
        async move { rendezvous.run(rendezvous_signal).await }
    });

    let first = Tunnel::new(dial_config(&addr, Role::Acceptor), echo::root_service());
    let (_first_shutdown, first_signal) = shutdown::channel();
    async_std::task::spawn({
        let first = first.clone();
        async move { first.run(first_signal).await }
    });
    wait_for(|| rendezvous.peers().len() == 1 && first.state() == TunnelState::Serving).await;

    let second = Tunnel::new(dial_config(&addr, Role::Acceptor), echo::root_service());
    let (_second_shutdown, second_signal) = shutdown::channel();
    let result = async_std::future::timeout(TIMEOUT, second.run(second_signal))
        .await
        .expect("rejected peer did not fail");
    match result {
        Err(TunnelError::Session(_)) => (),
        result => panic!("Unexpected result {:?}", result),
    }
    assert_eq!(rendezvous.peers().len(), 1);
    assert_eq!(first.state(), TunnelState::Serving);
}
