use anyhow::Context as _;
use futures::prelude::*;
use nat_tunnel::{
    echo, shutdown, Connect, OutboundCall, Rendezvous, RetryPolicy, Tunnel, TunnelConfig,
};
use std::time::Duration;
use stream_mux::Role;
use structopt::StructOpt;

pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Cli::from_args();
    args.command.run().await
}

/// Call services on a peer behind a NAT
#[derive(StructOpt)]
#[structopt(name = "nat-tunnel", max_term_width = 100)]
struct Cli {
    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    Dial(Dial),
    Listen(Listen),
    Serve(Serve),
    Call(Call),
}

impl Command {
    async fn run(&self) -> anyhow::Result<()> {
        match self {
            Self::Dial(cmd) => cmd.run().await,
            Self::Listen(cmd) => cmd.run().await,
            Self::Serve(cmd) => cmd.run().await,
            Self::Call(cmd) => cmd.run().await,
        }
    }
}

#[derive(StructOpt)]
/// Dial the rendezvous peer and run the tunnel
struct Dial {
    /// Address of the rendezvous peer
    #[structopt(long)]
    addr: String,

    #[structopt(long, default_value = "acceptor")]
    role: Role,

    /// Seconds to wait for the connection to be established
    #[structopt(long, default_value = "10", parse(try_from_str = parse_secs))]
    connect_timeout: Duration,

    #[structopt(flatten)]
    tunnel: TunnelOptions,
}

impl Dial {
    async fn run(&self) -> anyhow::Result<()> {
        let connect = Connect::Dial {
            addr: self.addr.clone(),
            timeout: self.connect_timeout,
        };
        self.tunnel.run(connect, self.role).await
    }
}

#[derive(StructOpt)]
/// Accept a connection from a peer and run the tunnel
struct Listen {
    /// Address to listen on
    #[structopt(long)]
    addr: String,

    #[structopt(long, default_value = "opener")]
    role: Role,

    /// Keep accepting peers and run a tunnel for each, with at most this many
    /// peers at a time
    #[structopt(long)]
    max_peers: Option<usize>,

    #[structopt(flatten)]
    tunnel: TunnelOptions,
}

impl Listen {
    async fn run(&self) -> anyhow::Result<()> {
        let connect = Connect::Listen {
            addr: self.addr.clone(),
        };
        match self.max_peers {
            Some(max_peers) => {
                let config = self.tunnel.config(connect, self.role);
                let rendezvous = Rendezvous::new(&self.addr, config, echo::root_service())
                    .with_max_peers(max_peers);
                let (_shutdown, signal) = shutdown::channel();
                rendezvous.run(signal).await.context("Rendezvous failed")?;
                Ok(())
            }
            None => self.tunnel.run(connect, self.role).await,
        }
    }
}

#[derive(StructOpt)]
struct TunnelOptions {
    /// Allow both peers to open streams. Both peers need the same setting.
    #[structopt(long)]
    bidirectional: bool,

    /// Method to call periodically. Defaults to `tunnel.echo` if the session
    /// can open streams.
    #[structopt(long)]
    call: Option<String>,

    /// Argument of the periodic call
    #[structopt(long, default_value = "hello")]
    message: String,

    /// Seconds between periodic calls
    #[structopt(long, default_value = "2", parse(try_from_str = parse_secs))]
    interval: Duration,

    /// Seconds after which a call fails
    #[structopt(long, default_value = "5", parse(try_from_str = parse_secs))]
    call_timeout: Duration,

    /// Number of times a failed connection attempt is retried
    #[structopt(long, default_value = "0")]
    retries: u32,

    /// Establish a new connection when the session fails
    #[structopt(long)]
    reconnect: bool,

    /// Seconds between keepalive pings. Zero disables keepalive.
    #[structopt(long, default_value = "30", parse(try_from_str = parse_secs))]
    keepalive: Duration,
}

impl TunnelOptions {
    fn config(&self, connect: Connect, role: Role) -> TunnelConfig {
        let mut config = TunnelConfig::new(connect, role);
        config.session.bidirectional = self.bidirectional;
        config.session.keepalive_interval = if self.keepalive == Duration::from_secs(0) {
            None
        } else {
            Some(self.keepalive)
        };
        let can_open = role == Role::Opener || self.bidirectional;
        let method = match &self.call {
            Some(method) => Some(method.clone()),
            None if can_open => Some(format!("{}.echo", echo::GROUP)),
            None => None,
        };
        config.call = method.map(|method| {
            OutboundCall::new(method, vec![serde_json::Value::String(self.message.clone())])
        });
        config.call_interval = self.interval;
        config.call_timeout = self.call_timeout;
        config.retry = RetryPolicy::retries(self.retries);
        config.reconnect = self.reconnect;
        config
    }

    async fn run(&self, connect: Connect, role: Role) -> anyhow::Result<()> {
        let tunnel = Tunnel::new(self.config(connect, role), echo::root_service());
        let (_shutdown, signal) = shutdown::channel();
        tunnel.run(signal).await.context("Tunnel failed")?;
        Ok(())
    }
}

#[derive(StructOpt)]
/// Host the demo services on a plain TCP port
struct Serve {
    /// Address to listen on
    #[structopt(long, default_value = "localhost:7000")]
    addr: String,
}

impl Serve {
    async fn run(&self) -> anyhow::Result<()> {
        let listener = async_std::net::TcpListener::bind(self.addr.as_str())
            .await
            .context(format!("Failed to listen on {}", &self.addr))?;
        tracing::info!(addr = %self.addr, "serving");
        muxrpc::serve(listener, echo::root_service())
            .await
            .context("Failed to accept connection")?;
        Ok(())
    }
}

#[derive(StructOpt)]
/// Call a method of a plain TCP server and print the response
struct Call {
    /// Address of the server
    #[structopt(long, default_value = "localhost:7000")]
    addr: String,

    /// Method path delimited with a dot (.)
    method: String,

    #[structopt(long, default_value = "hello")]
    message: String,

    /// Make a duplex call that sends the message as a stream
    #[structopt(long)]
    stream: bool,

    /// Seconds after which the call fails
    #[structopt(long, default_value = "5", parse(try_from_str = parse_secs))]
    timeout: Duration,
}

impl Call {
    async fn run(&self) -> anyhow::Result<()> {
        let client = muxrpc::Client::new(muxrpc::TcpDialer::new(&self.addr))
            .with_call_timeout(self.timeout);
        let message = serde_json::Value::String(self.message.clone());
        if self.stream {
            let (mut responses, mut sink) = client
                .start_duplex(&self.method, vec![])
                .await
                .context("Failed to start call")?;
            sink.send(muxrpc::Body::json(&message)).await?;
            sink.close().await?;
            while let Some(response) = responses.next().await {
                println!("{}", format_body(response?)?);
            }
        } else {
            let response = client
                .call_async(&self.method, vec![message])
                .await
                .context("Call failed")?;
            println!("{}", format_body(response)?);
        }
        Ok(())
    }
}

fn format_body(body: muxrpc::Body) -> anyhow::Result<String> {
    Ok(match body {
        muxrpc::Body::String(string) => string,
        body @ muxrpc::Body::Json(_) => {
            let value = body
                .decode_json::<serde_json::Value>()
                .context("Failed to decode response")?;
            serde_json::to_string_pretty(&value)?
        }
        muxrpc::Body::Blob(_) => "Refusing to print binary data".to_string(),
    })
}

fn parse_secs(value: &str) -> anyhow::Result<Duration> {
    let secs = value.parse::<f64>()?;
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("invalid number of seconds {}", value))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_secs_rejects_out_of_range() {
        assert_eq!(parse_secs("0.5").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_secs("0").unwrap(), Duration::from_secs(0));
        for value in &["1e30", "-1", "inf", "NaN", "soon"] {
            assert!(parse_secs(value).is_err(), "accepted {}", value);
        }
    }
}
