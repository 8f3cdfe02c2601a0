//! HTTP front door
//!
//! Requests under the control prefix (`files`, `restart`, `status`) are
//! authenticated and served by the [`Controller`]; everything else is
//! forwarded to the backend.

use crate::auth::TokenAuth;
use crate::controller::{Controller, UploadItem};
use crate::error::{json_error_response, ControlErrorCode};
use crate::proxy::BackendProxy;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{ALLOW, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the controller
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Control endpoints, relative to the base path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRoute {
    Files,
    Restart,
    Status,
}

impl ControlRoute {
    /// Methods accepted on this route, for the `Allow` header
    pub fn allowed_methods(&self) -> &'static str {
        match self {
            ControlRoute::Files => "GET, PUT",
            ControlRoute::Restart => "POST",
            ControlRoute::Status => "GET",
        }
    }
}

/// Maps request paths to control routes under a base prefix
#[derive(Debug, Clone)]
pub struct ControlRoutes {
    prefix: String,
}

impl ControlRoutes {
    pub fn new(base_path: &str) -> Self {
        Self {
            prefix: base_path.trim_end_matches('/').to_string(),
        }
    }

    pub fn resolve(&self, path: &str) -> Option<ControlRoute> {
        let rest = path.strip_prefix(self.prefix.as_str())?;
        match rest.trim_end_matches('/') {
            "/files" => Some(ControlRoute::Files),
            "/restart" => Some(ControlRoute::Restart),
            "/status" => Some(ControlRoute::Status),
            _ => None,
        }
    }
}

/// One file of an upload request body
#[derive(Debug, Deserialize)]
pub struct UploadEntry {
    /// Base64 encoded file content
    #[serde(alias = "Content")]
    pub content: String,
}

/// State shared by every connection
struct GatewayState {
    controller: Arc<Controller>,
    proxy: BackendProxy,
    routes: ControlRoutes,
    auth: TokenAuth,
}

/// The controller's HTTP server
pub struct Gateway {
    bind_addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new(
        bind_addr: SocketAddr,
        controller: Arc<Controller>,
        proxy: BackendProxy,
        base_path: &str,
        auth: TokenAuth,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(GatewayState {
                controller,
                proxy,
                routes: ControlRoutes::new(base_path),
                auth,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            backend = %self.state.proxy.address(),
            auth = self.state.auth.is_enabled(),
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(
                            forwarded = self.state.proxy.forwarded(),
                            "Gateway shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<GatewayState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let Some(route) = state.routes.resolve(req.uri().path()) else {
        return Ok(state.proxy.forward(req).await);
    };

    let method = req.method().clone();
    debug!(%method, path = %req.uri().path(), ?route, "Control request");

    if !state.auth.is_authorized(req.headers()) {
        warn!(%method, path = %req.uri().path(), "Unauthorized control request");
        return Ok(json_error_response(
            ControlErrorCode::Unauthorized,
            "missing or invalid x-auth-token",
        ));
    }

    let controller = &state.controller;
    let response = match (route, method) {
        (ControlRoute::Files, Method::GET) => list_files(controller).await,
        (ControlRoute::Files, Method::PUT) => upload_files(req, controller).await,
        (ControlRoute::Restart, Method::POST) => restart_app(controller).await,
        (ControlRoute::Status, Method::GET) => json_response(StatusCode::OK, &controller.status()),
        (route, method) => method_not_allowed(route, &method),
    };

    Ok(response)
}

async fn list_files(controller: &Arc<Controller>) -> Response<GatewayBody> {
    let controller = Arc::clone(controller);
    match tokio::task::spawn_blocking(move || controller.list_files()).await {
        Ok(files) => json_response(StatusCode::OK, &files),
        Err(e) => {
            error!(error = %e, "File scan task failed");
            json_error_response(ControlErrorCode::InternalError, "file scan failed")
        }
    }
}

async fn upload_files(req: Request<Incoming>, controller: &Controller) -> Response<GatewayBody> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read upload body");
            return json_error_response(ControlErrorCode::MalformedBody, "failed to read body");
        }
    };

    let items = match decode_upload(&body) {
        Ok(items) => items,
        Err(message) => {
            warn!(error = %message, "Rejected upload body");
            return json_error_response(ControlErrorCode::MalformedBody, message);
        }
    };

    let report = controller.upload(items).await;
    json_response(StatusCode::OK, &crate::supervisor::Status::from(report))
}

/// Decode a `{path: {content: base64}}` body. Any bad entry rejects the batch.
pub fn decode_upload(body: &[u8]) -> Result<Vec<UploadItem>, String> {
    let entries: BTreeMap<String, UploadEntry> =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {}", e))?;

    entries
        .into_iter()
        .map(|(path, entry)| {
            BASE64
                .decode(entry.content.as_bytes())
                .map(|content| UploadItem::new(path.as_str(), content))
                .map_err(|e| format!("invalid base64 content for '{}': {}", path, e))
        })
        .collect()
}

async fn restart_app(controller: &Controller) -> Response<GatewayBody> {
    match controller.restart().await {
        Ok(status) => json_response(StatusCode::OK, &status),
        Err(e) => {
            error!(error = %e, "Manual restart failed");
            json_error_response(ControlErrorCode::RestartFailed, e.to_string())
        }
    }
}

fn method_not_allowed(route: ControlRoute, method: &Method) -> Response<GatewayBody> {
    let mut response = json_error_response(
        ControlErrorCode::MethodNotAllowed,
        format!("{} is not supported here", method),
    );
    response
        .headers_mut()
        .insert(ALLOW, hyper::header::HeaderValue::from_static(route.allowed_methods()));
    response
}

/// Helper to create a JSON response
fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<GatewayBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            json_error_response(ControlErrorCode::InternalError, "failed to serialize response")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_default_base() {
        let routes = ControlRoutes::new("/");

        assert_eq!(routes.resolve("/files"), Some(ControlRoute::Files));
        assert_eq!(routes.resolve("/files/"), Some(ControlRoute::Files));
        assert_eq!(routes.resolve("/restart"), Some(ControlRoute::Restart));
        assert_eq!(routes.resolve("/status"), Some(ControlRoute::Status));
        assert_eq!(routes.resolve("/"), None);
        assert_eq!(routes.resolve("/files/app.py"), None);
        assert_eq!(routes.resolve("/statuses"), None);
    }

    #[test]
    fn test_routes_with_prefix() {
        for base in ["/fastpush", "/fastpush/"] {
            let routes = ControlRoutes::new(base);

            assert_eq!(routes.resolve("/fastpush/files"), Some(ControlRoute::Files));
            assert_eq!(routes.resolve("/fastpush/status"), Some(ControlRoute::Status));
            assert_eq!(routes.resolve("/status"), None);
            assert_eq!(routes.resolve("/fastpushstatus"), None);
        }
    }

    #[test]
    fn test_decode_upload() {
        let body = br#"{"app.py": {"content": "cHJpbnQoMSk="}, "b.txt": {"Content": ""}}"#;
        let items = decode_upload(body).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path, "app.py");
        assert_eq!(items[0].content, b"print(1)");
        assert_eq!(items[1].path, "b.txt");
        assert!(items[1].content.is_empty());
    }

    #[test]
    fn test_decode_upload_rejects_bad_input() {
        assert!(decode_upload(b"not json").is_err());
        assert!(decode_upload(br#"["app.py"]"#).is_err());

        let err = decode_upload(br#"{"a.py": {"content": "cHJpbnQoMSk="}, "b.py": {"content": "%%%"}}"#)
            .unwrap_err();
        assert!(err.contains("b.py"));
    }

    #[test]
    fn test_allowed_methods() {
        assert_eq!(ControlRoute::Files.allowed_methods(), "GET, PUT");
        assert_eq!(ControlRoute::Restart.allowed_methods(), "POST");

        let response = method_not_allowed(ControlRoute::Status, &Method::DELETE);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "GET");
    }
}
