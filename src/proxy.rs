//! Pass-through forwarding to the backend
//!
//! Requests that are not control-plane calls go to the backend unchanged
//! over a pooled HTTP client. The backend's response is streamed back as-is.

use crate::error::{json_error_response, ControlErrorCode};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for forwarding
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Pooled client bound to the backend's address
pub struct BackendProxy {
    client: Client<HttpConnector, Incoming>,
    host: String,
    port: u16,
    forwarded: AtomicU64,
}

impl BackendProxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self {
            client,
            host: host.into(),
            port,
            forwarded: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Number of requests handed to the backend
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Forward a request, turning connection failures into a 502
    pub async fn forward(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.send_request(req).await {
            Ok(response) => {
                debug!(%method, %uri, status = %response.status(), "Forwarded request");
                response
            }
            Err(e) => {
                warn!(%method, %uri, backend = %self.address(), error = %e, "Failed to forward request");
                json_error_response(
                    ControlErrorCode::BackendUnavailable,
                    "Failed to connect to backend",
                )
            }
        }
    }

    /// Send a request to the backend with method, headers and body untouched
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}{}", self.address(), path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        self.forwarded.fetch_add(1, Ordering::Relaxed);
        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
