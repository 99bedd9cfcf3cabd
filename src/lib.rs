//! Call services on a peer behind a NAT over a single outbound connection.
//!
//! The peer behind the NAT dials the reachable rendezvous peer. Both wrap the
//! connection in a [stream_mux::Session] with complementary roles that are
//! independent of who dialed. By default the dialing peer is the
//! [stream_mux::Role::Acceptor] and hosts services, and the listening peer is
//! the [stream_mux::Role::Opener] and calls them through new streams.
//!
//! [Tunnel] runs one end of such a tunnel and [adapter] connects sessions to
//! the [muxrpc] server and client. [Rendezvous] accepts many peers and runs
//! a tunnel for each of them.
pub mod adapter;
mod config;
pub mod echo;
mod error;
mod rendezvous;
pub mod shutdown;
mod tunnel;

pub use config::{Connect, OutboundCall, RetryPolicy, TunnelConfig};
pub use error::{ConnectError, StreamAcceptError, TunnelError};
pub use rendezvous::Rendezvous;
pub use tunnel::{CallStats, Tunnel, TunnelState};
