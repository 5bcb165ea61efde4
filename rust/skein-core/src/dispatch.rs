//! Server-side dispatch: method name → handler → exactly one reply.
//!
//! A [`Processor`] owns a table of [`MethodHandler`]s keyed by method name.
//! For each inbound CALL it writes one REPLY or EXCEPTION; for ONEWAY
//! requests (and handlers declared one-way) it writes nothing at all.
//!
//! Failure mapping:
//! - unknown method → `UNKNOWN_METHOD`, body left undecoded
//! - arguments fail to decode → `PROTOCOL_ERROR`
//! - handler returns a declared [`ApplicationError`] → sent as is
//! - anything else, panics included → logged, opaque `INTERNAL_ERROR`

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use skein_wire::{ApplicationError, CodecError, Envelope, MessageKind, Protocol, SequenceId};

/// How a handler runs relative to the connection's reactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Runs as a future on the reactor; must never block.
    Async,
    /// Blocks; runs on the blocking worker pool.
    Blocking,
}

/// Error returned by handler functions.
#[derive(Debug)]
pub enum HandlerError {
    /// A fault the method declares; delivered to the caller unchanged.
    Application(ApplicationError),
    /// Anything else. Logged on the server; the caller only sees
    /// `INTERNAL_ERROR`.
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn declared(message: impl Into<String>) -> Self {
        HandlerError::Application(ApplicationError::declared(message))
    }

    pub fn internal(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        HandlerError::Internal(error.into())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Application(e) => write!(f, "{e}"),
            HandlerError::Internal(e) => write!(f, "internal: {e}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<ApplicationError> for HandlerError {
    fn from(e: ApplicationError) -> Self {
        HandlerError::Application(e)
    }
}

/// Why invoking a handler did not produce a result body.
#[derive(Debug)]
pub enum HandlerFault {
    /// The request body did not decode as the method's arguments.
    Decode(CodecError),
    /// The handler's result could not be encoded.
    Encode(CodecError),
    Handler(HandlerError),
    Panicked(String),
    /// The worker running a blocking handler was cancelled.
    Cancelled,
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerFault::Decode(e) => write!(f, "failed to decode arguments: {e}"),
            HandlerFault::Encode(e) => write!(f, "failed to encode result: {e}"),
            HandlerFault::Handler(e) => write!(f, "{e}"),
            HandlerFault::Panicked(msg) => write!(f, "handler panicked: {msg}"),
            HandlerFault::Cancelled => write!(f, "handler was cancelled"),
        }
    }
}

impl std::error::Error for HandlerFault {}

/// One registered method.
pub trait MethodHandler: Send + Sync {
    fn name(&self) -> &str;

    /// One-way methods never reply, even to a CALL.
    fn is_oneway(&self) -> bool;

    fn mode(&self) -> ExecutionMode;

    /// Decode `args`, run the method, and encode its result.
    fn invoke(&self, protocol: Protocol, args: Bytes) -> BoxFuture<'static, Result<Bytes, HandlerFault>>;
}

/// Errors that can occur while building a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Method name is already registered
    MethodAlreadyRegistered(String),
    /// Service name is already registered on a multiplexed processor
    ServiceAlreadyRegistered(String),
    /// Method names may not be empty
    EmptyMethodName,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::MethodAlreadyRegistered(name) => {
                write!(f, "method {name:?} is already registered")
            }
            DispatchError::ServiceAlreadyRegistered(name) => {
                write!(f, "service {name:?} is already registered")
            }
            DispatchError::EmptyMethodName => write!(f, "method name must not be empty"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Anything a server can hand inbound messages to.
pub trait MessageProcessor: Send + Sync + 'static {
    /// Handle one inbound message. `None` means nothing is sent back.
    fn process(&self, protocol: Protocol, message: Bytes) -> BoxFuture<'_, Option<Bytes>>;

    /// Names of handlers that block, checked against the server's threading model.
    fn blocking_methods(&self) -> Vec<String>;
}

struct AsyncFn<F, A, R> {
    name: String,
    oneway: bool,
    f: Arc<F>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<F, Fut, A, R> MethodHandler for AsyncFn<F, A, R>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_oneway(&self) -> bool {
        self.oneway
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }

    fn invoke(&self, protocol: Protocol, args: Bytes) -> BoxFuture<'static, Result<Bytes, HandlerFault>> {
        let f = self.f.clone();
        Box::pin(async move {
            let args: A = protocol.decode(&args).map_err(HandlerFault::Decode)?;
            let result = f(args).await.map_err(HandlerFault::Handler)?;
            encode_result(protocol, &result)
        })
    }
}

struct BlockingFn<F, A, R> {
    name: String,
    f: Arc<F>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<F, A, R> MethodHandler for BlockingFn<F, A, R>
where
    F: Fn(A) -> Result<R, HandlerError> + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_oneway(&self) -> bool {
        false
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Blocking
    }

    fn invoke(&self, protocol: Protocol, args: Bytes) -> BoxFuture<'static, Result<Bytes, HandlerFault>> {
        let f = self.f.clone();
        Box::pin(async move {
            let args: A = protocol.decode(&args).map_err(HandlerFault::Decode)?;
            let result = tokio::task::spawn_blocking(move || f(args))
                .await
                .map_err(|e| {
                    if e.is_panic() {
                        HandlerFault::Panicked(panic_message(&*e.into_panic()))
                    } else {
                        HandlerFault::Cancelled
                    }
                })?
                .map_err(HandlerFault::Handler)?;
            encode_result(protocol, &result)
        })
    }
}

fn encode_result<R: Serialize>(protocol: Protocol, result: &R) -> Result<Bytes, HandlerFault> {
    protocol
        .encode(result)
        .map(Bytes::from)
        .map_err(HandlerFault::Encode)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Builds a [`Processor`] from typed handler functions.
#[derive(Default)]
pub struct ProcessorBuilder {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
    error: Option<DispatchError>,
}

impl ProcessorBuilder {
    /// A request/response method running on the reactor.
    pub fn unary<F, Fut, A, R>(self, name: &str, f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.handler(AsyncFn {
            name: name.to_string(),
            oneway: false,
            f: Arc::new(f),
            _marker: PhantomData,
        })
    }

    /// A fire-and-forget method; no reply is ever written for it.
    pub fn oneway<F, Fut, A>(self, name: &str, f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
        A: DeserializeOwned + Send + 'static,
    {
        self.handler(AsyncFn {
            name: name.to_string(),
            oneway: true,
            f: Arc::new(f),
            _marker: PhantomData,
        })
    }

    /// A request/response method that blocks. Only accepted by servers
    /// with worker threads.
    pub fn blocking<F, A, R>(self, name: &str, f: F) -> Self
    where
        F: Fn(A) -> Result<R, HandlerError> + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.handler(BlockingFn {
            name: name.to_string(),
            f: Arc::new(f),
            _marker: PhantomData,
        })
    }

    /// Register a hand-written handler.
    pub fn handler(mut self, handler: impl MethodHandler + 'static) -> Self {
        if self.error.is_some() {
            return self;
        }
        let name = handler.name().to_string();
        if name.is_empty() {
            self.error = Some(DispatchError::EmptyMethodName);
        } else if self.handlers.contains_key(&name) {
            self.error = Some(DispatchError::MethodAlreadyRegistered(name));
        } else {
            self.handlers.insert(name, Arc::new(handler));
        }
        self
    }

    pub fn build(self) -> Result<Processor, DispatchError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        Ok(Processor {
            handlers: Arc::new(self.handlers),
        })
    }
}

/// Method-name → handler table for one service.
#[derive(Clone, Default)]
pub struct Processor {
    handlers: Arc<HashMap<String, Arc<dyn MethodHandler>>>,
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.handlers.keys().collect();
        methods.sort();
        f.debug_struct("Processor").field("methods", &methods).finish()
    }
}

impl Processor {
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder::default()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the handler for `method` and build the answer to `envelope`.
    ///
    /// `method` is usually `envelope.name`; a multiplexer passes the name
    /// with its service prefix stripped while replies keep the full name.
    pub async fn dispatch(
        &self,
        protocol: Protocol,
        envelope: &Envelope,
        method: &str,
        body: Bytes,
    ) -> Option<Bytes> {
        if !envelope.kind.is_request() {
            tracing::warn!(
                seq_id = %envelope.seq_id,
                kind = %envelope.kind,
                method = %envelope.name,
                "dropping non-request message sent to server"
            );
            return None;
        }

        let Some(handler) = self.handlers.get(method) else {
            tracing::warn!(seq_id = %envelope.seq_id, method, "unknown method");
            return reject(protocol, envelope, ApplicationError::unknown_method(method));
        };

        let outcome = AssertUnwindSafe(handler.invoke(protocol, body))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerFault::Panicked(panic_message(&*panic))));

        let expects_reply = envelope.kind == MessageKind::Call && !handler.is_oneway();
        let error = match outcome {
            Ok(result) => {
                if !expects_reply {
                    return None;
                }
                tracing::debug!(seq_id = %envelope.seq_id, method, "reply");
                return match protocol.assemble(&envelope.reply(), &result) {
                    Ok(reply) => Some(reply),
                    Err(e) => {
                        tracing::error!(seq_id = %envelope.seq_id, method, error = %e, "failed to encode reply");
                        exception(protocol, envelope, &ApplicationError::internal(method))
                    }
                };
            }
            Err(HandlerFault::Decode(e)) => {
                tracing::warn!(seq_id = %envelope.seq_id, method, error = %e, "malformed arguments");
                ApplicationError::protocol(e.to_string())
            }
            Err(HandlerFault::Handler(HandlerError::Application(e))) => {
                tracing::debug!(seq_id = %envelope.seq_id, method, error = %e, "declared error");
                e
            }
            Err(fault) => {
                tracing::error!(seq_id = %envelope.seq_id, method, error = %fault, "internal error processing call");
                ApplicationError::internal(method)
            }
        };

        if !expects_reply {
            tracing::debug!(seq_id = %envelope.seq_id, method, error = %error, "one-way call failed, no reply sent");
            return None;
        }
        exception(protocol, envelope, &error)
    }
}

impl MessageProcessor for Processor {
    fn process(&self, protocol: Protocol, message: Bytes) -> BoxFuture<'_, Option<Bytes>> {
        Box::pin(async move {
            let (envelope, body) = match read_request(protocol, &message) {
                Ok(parts) => parts,
                Err(reply) => return reply,
            };
            self.dispatch(protocol, &envelope, &envelope.name, body).await
        })
    }

    fn blocking_methods(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .handlers
            .values()
            .filter(|h| h.mode() == ExecutionMode::Blocking)
            .map(|h| h.name().to_string())
            .collect();
        names.sort();
        names
    }
}

/// Separator between service and method in multiplexed method names.
pub const SERVICE_SEPARATOR: char = ':';

/// Routes `"Service:method"` names to one [`Processor`] per service.
#[derive(Clone, Debug, Default)]
pub struct MultiplexedProcessor {
    services: HashMap<String, Processor>,
    default: Option<Processor>,
}

impl MultiplexedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: &str, processor: Processor) -> Result<(), DispatchError> {
        if self.services.contains_key(service) {
            return Err(DispatchError::ServiceAlreadyRegistered(service.to_string()));
        }
        self.services.insert(service.to_string(), processor);
        Ok(())
    }

    /// Processor for names without a service prefix.
    pub fn set_default(&mut self, processor: Processor) {
        self.default = Some(processor);
    }
}

impl MessageProcessor for MultiplexedProcessor {
    fn process(&self, protocol: Protocol, message: Bytes) -> BoxFuture<'_, Option<Bytes>> {
        Box::pin(async move {
            let (envelope, body) = match read_request(protocol, &message) {
                Ok(parts) => parts,
                Err(reply) => return reply,
            };
            match envelope.name.split_once(SERVICE_SEPARATOR) {
                Some((service, method)) => match self.services.get(service) {
                    Some(processor) => processor.dispatch(protocol, &envelope, method, body).await,
                    None => {
                        tracing::warn!(seq_id = %envelope.seq_id, service, "unknown service");
                        reject(
                            protocol,
                            &envelope,
                            ApplicationError::unknown_method(&envelope.name),
                        )
                    }
                },
                None => match &self.default {
                    Some(processor) => {
                        processor
                            .dispatch(protocol, &envelope, &envelope.name, body)
                            .await
                    }
                    None => reject(
                        protocol,
                        &envelope,
                        ApplicationError::new(
                            skein_wire::ErrorKind::UnknownMethod,
                            format!("Service name not found in message name: {}", envelope.name),
                        ),
                    ),
                },
            }
        })
    }

    fn blocking_methods(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .services
            .iter()
            .flat_map(|(service, processor)| {
                processor
                    .blocking_methods()
                    .into_iter()
                    .map(move |method| format!("{service}{SERVICE_SEPARATOR}{method}"))
            })
            .collect();
        if let Some(default) = &self.default {
            names.extend(default.blocking_methods());
        }
        names.sort();
        names
    }
}

/// Split an inbound message, or produce the PROTOCOL_ERROR answer for it.
fn read_request(protocol: Protocol, message: &Bytes) -> Result<(Envelope, Bytes), Option<Bytes>> {
    protocol.read_envelope(message).map_err(|e| {
        tracing::warn!(error = %e, "malformed request envelope");
        let envelope = Envelope::new("", MessageKind::Exception, SequenceId::NONE);
        encode_exception(protocol, &envelope, &ApplicationError::protocol(e.to_string()))
    })
}

/// Answer with `error` unless the request was one-way.
fn reject(protocol: Protocol, envelope: &Envelope, error: ApplicationError) -> Option<Bytes> {
    if envelope.kind == MessageKind::Oneway {
        return None;
    }
    exception(protocol, envelope, &error)
}

fn exception(protocol: Protocol, request: &Envelope, error: &ApplicationError) -> Option<Bytes> {
    encode_exception(protocol, &request.exception(), error)
}

fn encode_exception(protocol: Protocol, envelope: &Envelope, error: &ApplicationError) -> Option<Bytes> {
    match protocol.write_message(envelope, error) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::error!(seq_id = %envelope.seq_id, error = %e, "failed to encode exception");
            None
        }
    }
}
