//! Serving a [`MessageProcessor`] over the available transports.
//!
//! Every `serve_*` function checks its [`ServerConfig`] against the
//! processor's handlers before accepting anything, then runs until its
//! listener fails. Each reply goes back over the connection its request
//! came in on.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use skein_wire::Protocol;

use crate::{ServeError, TransportError};
use crate::config::ServerConfig;
use crate::dispatch::MessageProcessor;
use crate::transport::Transport;

/// Requests one connection may have in progress before reading pauses.
pub const MAX_IN_FLIGHT: usize = 1024;

/// Answer requests arriving on `transport` until it closes.
///
/// Requests start in arrival order and run concurrently on this task;
/// blocking handlers are moved to the worker pool by the processor. Once
/// [`MAX_IN_FLIGHT`] requests are unanswered, nothing more is read until
/// one finishes.
pub async fn serve_connection(
    transport: Transport,
    processor: Arc<dyn MessageProcessor>,
    protocol: Protocol,
) {
    let mut in_flight = FuturesUnordered::new();
    loop {
        tokio::select! {
            received = transport.recv(), if in_flight.len() < MAX_IN_FLIGHT => {
                let message = match received {
                    Ok(message) => message,
                    Err(TransportError::Closed) => {
                        tracing::debug!("connection closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "connection failed");
                        break;
                    }
                };
                in_flight.push(answer(transport.clone(), processor.clone(), protocol, message));
            }
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
        }
    }
    // let one-way work finish; replies to a dead peer just fail to send
    while in_flight.next().await.is_some() {}
    transport.close();
}

async fn answer(
    transport: Transport,
    processor: Arc<dyn MessageProcessor>,
    protocol: Protocol,
    message: Bytes,
) {
    if let Some(reply) = processor.process(protocol, message).await
        && let Err(e) = transport.send(reply).await
    {
        tracing::debug!(error = %e, "failed to send reply");
    }
}

/// Accept TCP connections and serve each with length-prefixed framing.
#[cfg(feature = "stream")]
pub async fn serve_tcp(
    listener: tokio::net::TcpListener,
    processor: Arc<dyn MessageProcessor>,
    config: ServerConfig,
) -> Result<(), ServeError> {
    config.validate(&processor.blocking_methods())?;
    tracing::info!(addr = ?listener.local_addr().ok(), "serving tcp");
    loop {
        let (socket, peer) = listener.accept().await?;
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        tracing::debug!(%peer, "accepted connection");
        let transport =
            crate::transport::stream::StreamTransport::new(socket, config.max_frame_size);
        tokio::spawn(serve_connection(
            transport.into(),
            processor.clone(),
            config.protocol,
        ));
    }
}

/// Serve every connection made to `listener`'s bus address.
///
/// Returns once the bus can deliver no more connections.
#[cfg(feature = "mem")]
pub async fn serve_bus(
    mut listener: crate::transport::mem::BusListener,
    processor: Arc<dyn MessageProcessor>,
    config: ServerConfig,
) -> Result<(), ServeError> {
    config.validate(&processor.blocking_methods())?;
    tracing::info!(address = listener.address(), "serving bus address");
    while let Some(transport) = listener.accept().await {
        tokio::spawn(serve_connection(
            transport.into(),
            processor.clone(),
            config.protocol,
        ));
    }
    Ok(())
}

/// Accept WebSocket upgrades on `config.path` and serve one message per
/// WebSocket message.
#[cfg(feature = "websocket")]
pub async fn serve_websocket(
    listener: tokio::net::TcpListener,
    processor: Arc<dyn MessageProcessor>,
    config: ServerConfig,
) -> Result<(), ServeError> {
    config.validate(&processor.blocking_methods())?;
    tracing::info!(addr = ?listener.local_addr().ok(), path = %config.path, "serving websocket");
    let path: Arc<str> = Arc::from(config.path.as_str());
    loop {
        let (socket, peer) = listener.accept().await?;
        let processor = processor.clone();
        let path = path.clone();
        let (protocol, max_frame_size) = (config.protocol, config.max_frame_size);
        tokio::spawn(async move {
            match crate::transport::websocket::WebSocketTransport::accept(
                socket,
                &path,
                max_frame_size,
            )
            .await
            {
                Ok(transport) => serve_connection(transport.into(), processor, protocol).await,
                Err(e) => tracing::debug!(%peer, error = %e, "websocket handshake failed"),
            }
        });
    }
}

/// Answer HTTP POSTs, routing each by path to its processor.
#[cfg(feature = "http")]
pub async fn serve_http(
    listener: tokio::net::TcpListener,
    routes: crate::transport::http::HttpRoutes,
    config: ServerConfig,
) -> Result<(), ServeError> {
    if let Some(path) = routes.paths().into_iter().find(|p| !p.starts_with('/')) {
        return Err(crate::ConfigError::InvalidPath(path.to_string()).into());
    }
    for processor in routes.processors() {
        config.validate(&processor.blocking_methods())?;
    }
    tracing::info!(addr = ?listener.local_addr().ok(), paths = ?routes.paths(), "serving http");
    let routes = Arc::new(routes);
    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::debug!(%peer, "accepted http connection");
        tokio::spawn(crate::transport::http::serve_connection(
            socket,
            routes.clone(),
            config.protocol,
            config.max_frame_size,
        ));
    }
}
