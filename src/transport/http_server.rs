#![forbid(unsafe_code)]

use crate::domain::{ReceivedMessage, REMOTE_ADDR_KEY};
use crate::pipeline::failure::FailureCategory;
use crate::transport::runtime::ReceiverControl;
use crate::transport::{MessageHandler, ProcessingReply, Receiver, ReceiverKind, TransportError};
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1_048_576;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpReceiverOptions {
    pub address: SocketAddr,
    pub path: String,
    pub max_body_bytes: usize,
}

impl HttpReceiverOptions {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            path: "/".to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_path(mut self, path: impl AsRef<str>) -> Self {
        self.path = normalise_path(path.as_ref());
        self
    }
}

pub fn normalise_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// AS4 endpoint: one POST route feeding the agent and a GET health probe.
pub struct HttpReceiver {
    options: HttpReceiverOptions,
    control: ReceiverControl,
    bound: Mutex<Option<SocketAddr>>,
}

#[derive(Clone)]
struct HttpServerState {
    handler: Arc<dyn MessageHandler>,
}

impl HttpReceiver {
    pub fn new(options: HttpReceiverOptions) -> Self {
        Self {
            options,
            control: ReceiverControl::new(),
            bound: Mutex::new(None),
        }
    }

    /// Address actually bound, available once the listener is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().expect("http receiver poisoned")
    }

    fn router(&self, handler: Arc<dyn MessageHandler>) -> Router {
        let health_path = if self.options.path == "/health" {
            "/healthz"
        } else {
            "/health"
        };
        Router::new()
            .route(&self.options.path, post(handle_message))
            .route(health_path, get(handle_health_probe))
            .layer(DefaultBodyLimit::max(self.options.max_body_bytes))
            .with_state(HttpServerState { handler })
    }
}

async fn handle_message(
    State(state): State<HttpServerState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    let message = ReceivedMessage::new(body.to_vec(), content_type)
        .with_property(REMOTE_ADDR_KEY, remote.to_string());

    let reply = state.handler.handle(message).await;
    reply_to_response(state.handler.name(), reply)
}

fn reply_to_response(agent: &str, reply: ProcessingReply) -> Response {
    if let Some(content) = reply.response {
        return Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content.content_type)
            .header(CACHE_CONTROL, "no-store")
            .body(Body::from(content.content))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    match reply.outcome.error() {
        None => StatusCode::ACCEPTED.into_response(),
        Some(error) => {
            crate::as4_event!(
                warn,
                "http_request_rejected",
                agent = agent,
                category = error.category,
                error = error.description
            );
            let status = if error.category == FailureCategory::Transform {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, error.description.clone()).into_response()
        }
    }
}

async fn handle_health_probe() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CACHE_CONTROL, "no-store")
        .body(Body::from("ok"))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[async_trait]
impl Receiver for HttpReceiver {
    fn kind(&self) -> ReceiverKind {
        ReceiverKind::Http
    }

    async fn start_receiving(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let token = self.control.begin(&shutdown);
        let listener = TcpListener::bind(self.options.address)
            .await
            .map_err(|err| TransportError::Bind {
                address: self.options.address.to_string(),
                reason: err.to_string(),
            })?;
        let local = listener.local_addr()?;
        *self.bound.lock().expect("http receiver poisoned") = Some(local);

        crate::as4_event!(
            info,
            "receiver_started",
            agent = handler.name(),
            address = local,
            path = self.options.path
        );
        let router = self.router(handler);
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
        tracing::debug!(address = %local, "http receiver stopped");
        Ok(())
    }

    fn stop_receiving(&self) {
        self.control.stop();
    }
}
