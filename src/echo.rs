//! Demo services hosted by the command line peers.
use futures::prelude::*;
use muxrpc::{Body, Error, Service};

/// Group under which the command line peers host [service].
pub const GROUP: &str = "tunnel";

/// Service with the methods
///
/// * `echo(text)` (`async`) responding with `"Echo: <text>"` and
/// * `stream()` (`duplex`) answering every message `text` with `"<text> more text"`.
pub fn service() -> Service {
    let mut service = Service::new();
    service.add_async("echo", |(text,): (String,)| async move {
        tracing::info!(%text, "echo");
        Ok(Body::String(echo(&text)))
    });
    service.add_duplex("stream", |_: Vec<serde_json::Value>| {
        let (sender, receiver) = futures::channel::mpsc::unbounded::<Body>();
        let source = receiver.map(|body| -> Result<Body, Error> {
            let text = body
                .decode_json::<String>()
                .map_err(|error| Error::new("ArgumentError", error))?;
            tracing::info!(%text, "stream message");
            Ok(Body::String(more_text(&text)))
        });
        let sink = sender.sink_map_err(|_| Error::new("CLOSED", "stream responder is gone"));
        (source, sink)
    });
    service
}

pub fn echo(text: &str) -> String {
    format!("Echo: {}", text)
}

pub fn more_text(text: &str) -> String {
    format!("{} more text", text)
}

/// Root service that hosts [service] under [GROUP].
pub fn root_service() -> Service {
    let mut root = Service::new();
    root.add_service(GROUP, service());
    root
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn responses() {
        assert_eq!(echo("hello"), "Echo: hello");
        assert_eq!(more_text("hello"), "hello more text");
    }

    #[test]
    fn methods() {
        let service = root_service();
        assert!(service.has_method("tunnel.echo"));
        assert!(service.has_method("tunnel.stream"));
        assert!(!service.has_method("echo"));
    }
}
