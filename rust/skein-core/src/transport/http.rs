//! HTTP binding: one POST per message, the response body is the reply.
//!
//! Unlike the duplex transports there is no connection-level stream to
//! correlate on; each request carries exactly one message and gets its
//! answer in the response. Bodies are read through a [`FragmentAssembler`]
//! so an oversized body is refused instead of buffered.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use skein_wire::Protocol;
use tokio::net::TcpStream;

use crate::TransportError;
use crate::dispatch::MessageProcessor;
use crate::reassembly::FragmentAssembler;

const CONTENT_TYPE_SKEIN: &str = "application/x-skein";

/// Client side: posts messages to one URL.
#[derive(Clone, Debug)]
pub struct HttpClientTransport {
    uri: Uri,
    /// Origin-form target sent in the request line.
    target: Uri,
    authority: String,
    max_message_size: usize,
}

impl HttpClientTransport {
    /// `url` must be an absolute `http://host[:port]/path` URL.
    pub fn new(url: &str, max_message_size: usize) -> Result<Self, TransportError> {
        let uri: Uri = url
            .parse()
            .map_err(|e: http::uri::InvalidUri| TransportError::Http(e.to_string()))?;
        if uri.scheme_str() != Some("http") {
            return Err(TransportError::Http(format!("unsupported url {url:?}")));
        }
        let host = uri
            .host()
            .ok_or_else(|| TransportError::Http(format!("url {url:?} has no host")))?;
        let authority = format!("{host}:{}", uri.port_u16().unwrap_or(80));
        let target = uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/")
            .parse()
            .map_err(|e: http::uri::InvalidUri| TransportError::Http(e.to_string()))?;
        Ok(HttpClientTransport {
            uri,
            target,
            authority,
            max_message_size,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// POST `message` and return the response body.
    ///
    /// Any status other than 200 is an error for this message only.
    pub async fn post(&self, message: Bytes) -> Result<Bytes, TransportError> {
        let stream = TcpStream::connect(&self.authority).await?;
        stream.set_nodelay(true)?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(http_error)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "http client connection ended with error");
            }
        });

        let mut request = Request::new(Full::new(message));
        *request.method_mut() = Method::POST;
        *request.uri_mut() = self.target.clone();
        let host = HeaderValue::from_str(&self.authority).map_err(|e| TransportError::Http(e.to_string()))?;
        request.headers_mut().insert(HOST, host);
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_SKEIN));

        let response = sender.send_request(request).await.map_err(http_error)?;
        if response.status() != StatusCode::OK {
            return Err(TransportError::HttpStatus(response.status().as_u16()));
        }
        read_body(response.into_body(), self.max_message_size).await
    }
}

fn http_error(e: hyper::Error) -> TransportError {
    TransportError::Http(e.to_string())
}

async fn read_body(mut body: Incoming, max_message_size: usize) -> Result<Bytes, TransportError> {
    let mut assembler = FragmentAssembler::new(max_message_size);
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(http_error)?;
        if let Ok(data) = frame.into_data() {
            assembler.push(&data, false)?;
        }
    }
    Ok(assembler.push(&[], true)?.unwrap_or_default())
}

/// Path → processor table for an HTTP server.
#[derive(Clone, Default)]
pub struct HttpRoutes {
    routes: HashMap<String, Arc<dyn MessageProcessor>>,
}

impl std::fmt::Debug for HttpRoutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut paths: Vec<_> = self.routes.keys().collect();
        paths.sort();
        f.debug_struct("HttpRoutes").field("paths", &paths).finish()
    }
}

impl HttpRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a single processor at `path`.
    pub fn single(path: &str, processor: Arc<dyn MessageProcessor>) -> Self {
        Self::new().route(path, processor)
    }

    pub fn route(mut self, path: &str, processor: Arc<dyn MessageProcessor>) -> Self {
        self.routes.insert(path.to_string(), processor);
        self
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<_> = self.routes.keys().map(String::as_str).collect();
        paths.sort();
        paths
    }

    pub(crate) fn processors(&self) -> impl Iterator<Item = &Arc<dyn MessageProcessor>> {
        self.routes.values()
    }

    fn get(&self, path: &str) -> Option<&Arc<dyn MessageProcessor>> {
        self.routes.get(path)
    }
}

/// Serve HTTP/1 requests on one accepted connection until the peer hangs up.
pub(crate) async fn serve_connection(
    stream: TcpStream,
    routes: Arc<HttpRoutes>,
    protocol: Protocol,
    max_message_size: usize,
) {
    let service = service_fn(move |request: Request<Incoming>| {
        let routes = routes.clone();
        async move {
            Ok::<_, Infallible>(handle_request(request, &routes, protocol, max_message_size).await)
        }
    });
    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!(error = %e, "http connection ended with error");
    }
}

async fn handle_request(
    request: Request<Incoming>,
    routes: &HttpRoutes,
    protocol: Protocol,
    max_message_size: usize,
) -> Response<Full<Bytes>> {
    if request.method() != Method::POST {
        tracing::debug!(method = %request.method(), "refusing non-POST request");
        return status(StatusCode::METHOD_NOT_ALLOWED);
    }
    let Some(processor) = routes.get(request.uri().path()).cloned() else {
        tracing::debug!(path = %request.uri().path(), "no processor for path");
        return status(StatusCode::NOT_FOUND);
    };
    let message = match read_body(request.into_body(), max_message_size).await {
        Ok(message) => message,
        Err(TransportError::Framing(e)) => {
            tracing::warn!(error = %e, "request body too large");
            return status(StatusCode::PAYLOAD_TOO_LARGE);
        }
        Err(e) => {
            tracing::debug!(error = %e, "failed to read request body");
            return status(StatusCode::BAD_REQUEST);
        }
    };
    let reply = processor.process(protocol, message).await.unwrap_or_default();
    let mut response = Response::new(Full::new(reply));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_SKEIN));
    response
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = code;
    response
}
