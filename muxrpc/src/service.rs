use futures::future::BoxFuture;
use futures::prelude::*;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::pin::Pin;

use crate::call::CallType;
use crate::error::Error;
use crate::packet::Body;

pub(crate) type BoxSource = BoxStream<'static, Result<Body, Error>>;

pub(crate) type BoxSink = Pin<Box<dyn Sink<Body, Error = Error> + Send>>;

/// Server side of a streaming call produced by a [Service] handler.
pub(crate) enum StreamEndpoint {
    /// Messages sent to the caller. The call ends when the source ends or the
    /// caller ends its side.
    Source(BoxSource),
    /// Messages received from the caller. The caller is answered with the end
    /// of the stream once the sink is closed or with the error the sink failed with.
    Sink(BoxSink),
    Duplex(BoxSource, BoxSink),
}

type AsyncHandler = Box<
    dyn Fn(Vec<serde_json::Value>) -> Result<BoxFuture<'static, Result<Body, Error>>, Error>
        + Send
        + Sync,
>;

type StreamHandler =
    Box<dyn Fn(Vec<serde_json::Value>) -> Result<StreamEndpoint, Error> + Send + Sync>;

enum Handler {
    Async(AsyncHandler),
    Stream(CallType, StreamHandler),
}

/// Collection of named methods that can be served with [crate::serve].
///
/// Method arguments are decoded from the JSON array sent by the caller into
/// `Args` with [serde]. If decoding fails the caller receives an
/// `ArgumentError`. Calling a method that is not registered results in a
/// `METHOD_NOT_FOUND` error.
///
/// ```
/// let mut service = muxrpc::Service::new();
/// service.add_async("echo", |(text,): (String,)| async move {
///     Ok(muxrpc::Body::String(text))
/// });
///
/// let mut server = muxrpc::Service::new();
/// server.add_service("tunnel", service);
/// assert!(server.has_method("tunnel.echo"));
/// ```
#[derive(Default)]
pub struct Service {
    handlers: HashMap<Vec<String>, Handler>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method that answers each call with a single response.
    pub fn add_async<Args, Fut>(
        &mut self,
        method: impl ToString,
        f: impl Fn(Args) -> Fut + Send + Sync + 'static,
    ) where
        Args: serde::de::DeserializeOwned,
        Fut: Future<Output = Result<Body, Error>> + Send + 'static,
    {
        self.insert(
            method,
            Handler::Async(Box::new(move |args| -> Result<_, Error> {
                Ok(f(decode_args(args)?).boxed())
            })),
        );
    }

    /// Add a method that streams messages to the caller.
    pub fn add_source<Args, Source>(
        &mut self,
        method: impl ToString,
        f: impl Fn(Args) -> Source + Send + Sync + 'static,
    ) where
        Args: serde::de::DeserializeOwned,
        Source: Stream<Item = Result<Body, Error>> + Send + 'static,
    {
        self.insert(
            method,
            Handler::Stream(
                CallType::Source,
                Box::new(move |args| -> Result<_, Error> {
                    Ok(StreamEndpoint::Source(f(decode_args(args)?).boxed()))
                }),
            ),
        );
    }

    /// Add a method that consumes messages streamed by the caller.
    pub fn add_sink<Args, Sink_>(
        &mut self,
        method: impl ToString,
        f: impl Fn(Args) -> Sink_ + Send + Sync + 'static,
    ) where
        Args: serde::de::DeserializeOwned,
        Sink_: Sink<Body, Error = Error> + Send + 'static,
    {
        self.insert(
            method,
            Handler::Stream(
                CallType::Sink,
                Box::new(move |args| -> Result<_, Error> {
                    Ok(StreamEndpoint::Sink(Box::pin(f(decode_args(args)?))))
                }),
            ),
        );
    }

    /// Add a method where both the caller and the service stream messages.
    pub fn add_duplex<Args, Source, Sink_>(
        &mut self,
        method: impl ToString,
        f: impl Fn(Args) -> (Source, Sink_) + Send + Sync + 'static,
    ) where
        Args: serde::de::DeserializeOwned,
        Source: Stream<Item = Result<Body, Error>> + Send + 'static,
        Sink_: Sink<Body, Error = Error> + Send + 'static,
    {
        self.insert(
            method,
            Handler::Stream(
                CallType::Duplex,
                Box::new(move |args| -> Result<_, Error> {
                    let (source, sink) = f(decode_args(args)?);
                    Ok(StreamEndpoint::Duplex(source.boxed(), Box::pin(sink)))
                }),
            ),
        );
    }

    /// Add all methods of `service` prefixed with `group`.
    ///
    /// A method `echo` of `service` is called as `group.echo`.
    pub fn add_service(&mut self, group: impl ToString, service: Self) {
        let group = group.to_string();
        self.handlers
            .extend(service.handlers.into_iter().map(|(mut method, handler)| {
                method.insert(0, group.clone());
                (method, handler)
            }));
    }

    /// Returns true if a method with the dotted name `method` is registered.
    pub fn has_method(&self, method: &str) -> bool {
        let method = method.split('.').map(String::from).collect::<Vec<_>>();
        self.handlers.contains_key(&method)
    }

    fn insert(&mut self, method: impl ToString, handler: Handler) {
        let method = method.to_string().split('.').map(String::from).collect();
        self.handlers.insert(method, handler);
    }

    pub(crate) fn handle_async(
        &self,
        method: &[String],
        args: Vec<serde_json::Value>,
    ) -> BoxFuture<'static, Result<Body, Error>> {
        let result = match self.handlers.get(method) {
            Some(Handler::Async(handler)) => handler(args),
            Some(Handler::Stream(type_, _)) => Err(wrong_call_type(method, *type_, CallType::Async)),
            None => Err(Error::method_not_found(method)),
        };
        match result {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(method = ?method.join("."), %error, "rejected async call");
                future::ready(Err(error)).boxed()
            }
        }
    }

    pub(crate) fn handle_stream(
        &self,
        method: &[String],
        call_type: CallType,
        args: Vec<serde_json::Value>,
    ) -> Result<StreamEndpoint, Error> {
        let result = match self.handlers.get(method) {
            Some(Handler::Stream(type_, handler)) if *type_ == call_type => handler(args),
            Some(Handler::Stream(type_, _)) => Err(wrong_call_type(method, *type_, call_type)),
            Some(Handler::Async(_)) => Err(wrong_call_type(method, CallType::Async, call_type)),
            None => Err(Error::method_not_found(method)),
        };
        if let Err(error) = &result {
            tracing::warn!(method = ?method.join("."), %call_type, %error, "rejected stream call");
        }
        result
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let methods = self
            .handlers
            .iter()
            .map(|(method, handler)| {
                let type_ = match handler {
                    Handler::Async(_) => CallType::Async,
                    Handler::Stream(type_, _) => *type_,
                };
                format!("{} ({})", method.join("."), type_)
            })
            .collect::<Vec<_>>();
        f.debug_struct("Service").field("methods", &methods).finish()
    }
}

fn decode_args<Args: serde::de::DeserializeOwned>(
    args: Vec<serde_json::Value>,
) -> Result<Args, Error> {
    serde_json::from_value(serde_json::Value::Array(args)).map_err(Error::invalid_arguments)
}

fn wrong_call_type(method: &[String], expected: CallType, actual: CallType) -> Error {
    Error::new(
        "WRONG_CALL_TYPE",
        format!(
            "Method \"{}\" is a {} method but was called as {}",
            method.join("."),
            expected,
            actual
        ),
    )
}
