/*!
Multiplex many independent, ordered and reliable streams over one connection.

A [Session] wraps a single connection (usually a TCP stream) and is created
with a [Role]. The [Role::Opener] opens streams with [Session::open_stream],
the [Role::Acceptor] receives them from [Session::accept_stream]. The role
is a property of the session and does not depend on which side dialed the
connection, so a peer behind a NAT can dial out and still accept streams.

Both peers exchange a short preface before any data is sent. The preface
carries the role, so two peers that were configured with the same role fail
with [SessionError::RoleConflict] instead of waiting for each other forever.

## Usage

The peer that dialed the connection accepts streams.

```no_run
# use futures::prelude::*;
# #[async_std::main]
# async fn main() -> Result<(), Box<dyn std::error::Error>> {
let connection = async_std::net::TcpStream::connect("localhost:5555").await?;
let session = stream_mux::Session::new(
    connection,
    stream_mux::Role::Acceptor,
    stream_mux::Config::default(),
)
.await?;

while let Ok(mut stream) = session.accept_stream().await {
    async_std::task::spawn(async move {
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        stream.write_all(&data).await?;
        stream.close().await
    });
}
# Ok(())
# }
```

The listening peer opens streams.

```no_run
# use futures::prelude::*;
# #[async_std::main]
# async fn main() -> Result<(), Box<dyn std::error::Error>> {
let listener = async_std::net::TcpListener::bind("localhost:5555").await?;
let (connection, _) = listener.accept().await?;
let session = stream_mux::Session::new(
    connection,
    stream_mux::Role::Opener,
    stream_mux::Config::default(),
)
.await?;

let mut stream = session.open_stream()?;
stream.write_all(b"hello world").await?;
stream.close().await?;
let mut echo = Vec::new();
stream.read_to_end(&mut echo).await?;
# Ok(())
# }
```
*/

mod config;
mod error;
mod frame;
mod header;
mod preface;
mod role;
mod session;
mod stream;
mod utils;

pub use config::{Config, MAX_FRAME_PAYLOAD, STREAM_WINDOW};
pub use error::SessionError;
pub use header::HeaderParseError;
pub use role::{ParseRoleError, Role};
pub use session::Session;
pub use stream::Stream;
