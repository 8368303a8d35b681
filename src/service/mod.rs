use crate::dispatch::{DispatchRequest, MessageDispatcher};
use crate::error::RotorError;
use crate::event::AnyEvent;
use crate::metrics::prom::{gather_text, HTTP_REQUESTS};
use crate::store::{StoreHealth, StoreHealthSource, StoreStatus};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post, Router},
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
/// HTTP surface of the rotor: run a chain on demand, health and metrics
use std::sync::Arc;
use std::time::Duration;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer};
use tracing::{error, info};

/// Maximum request body size (1MB)
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Default request timeout (30 seconds)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum concurrent requests
const MAX_CONCURRENT_REQUESTS: usize = 1000;

#[derive(Clone)]
pub struct RotorService {
    dispatcher: Arc<MessageDispatcher>,
    stores: Vec<Arc<dyn StoreHealthSource>>,
    api_key: Option<Arc<str>>,
    start_time: std::time::Instant,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    stores: Vec<StoreHealth>,
}

/// Body of `POST /func`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuncRequest {
    connection_id: String,
    event: AnyEvent,
    #[serde(default)]
    retries: u32,
    #[serde(default)]
    function_id: Option<String>,
}

/// Body of `POST /func/multi`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiFuncRequest {
    connection_ids: Vec<String>,
    event: AnyEvent,
}

fn error_status(e: &RotorError) -> StatusCode {
    match e {
        RotorError::UnknownConnection(_) => StatusCode::NOT_FOUND,
        RotorError::Parse(_) | RotorError::Configuration(_) => StatusCode::BAD_REQUEST,
        RotorError::StoreRefresh { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl RotorService {
    pub fn new(dispatcher: Arc<MessageDispatcher>) -> Self {
        Self {
            dispatcher,
            stores: Vec::new(),
            api_key: None,
            start_time: std::time::Instant::now(),
        }
    }

    /// Report `store` on `/health`
    pub fn with_store(mut self, store: Arc<dyn StoreHealthSource>) -> Self {
        self.stores.push(store);
        self
    }

    /// Require `x-api-key` on every route but `/health`
    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.map(Arc::from);
        self
    }

    pub fn router(&self) -> Router {
        let app = Router::new()
            .route("/health", get(Self::health_handler))
            .route("/metrics", get(Self::metrics_handler))
            .route("/func", post(Self::func_handler))
            .route("/func/multi", post(Self::multi_handler))
            .layer(middleware::from_fn_with_state(
                self.clone(),
                Self::auth_middleware,
            ))
            .with_state(self.clone());

        // Apply middleware layers
        app.layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
            .layer(TimeoutLayer::new(DEFAULT_TIMEOUT))
            .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
            .layer(CorsLayer::permissive())
    }

    /// Authentication middleware
    async fn auth_middleware(
        State(service): State<RotorService>,
        headers: HeaderMap,
        request: Request<axum::body::Body>,
        next: Next,
    ) -> Result<Response, StatusCode> {
        // Skip auth for health endpoint
        if request.uri().path() == "/health" {
            return Ok(next.run(request).await);
        }

        match &service.api_key {
            Some(expected) => match headers.get("x-api-key") {
                Some(key) if key.as_bytes() == expected.as_bytes() => Ok(next.run(request).await),
                _ => {
                    HTTP_REQUESTS
                        .with_label_values(&[request.uri().path(), "401"])
                        .inc();
                    Err(StatusCode::UNAUTHORIZED)
                }
            },
            None => Ok(next.run(request).await),
        }
    }

    async fn health_handler(
        State(service): State<RotorService>,
    ) -> (StatusCode, Json<HealthResponse>) {
        let stores: Vec<StoreHealth> = service.stores.iter().map(|s| s.health()).collect();
        let failed = stores.iter().any(|s| s.status == StoreStatus::Failed);
        let status = if failed {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        };
        (
            status,
            Json(HealthResponse {
                status: if failed { "unhealthy" } else { "healthy" }.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_seconds: service.start_time.elapsed().as_secs(),
                stores,
            }),
        )
    }

    async fn metrics_handler() -> Response {
        match gather_text() {
            Ok((content_type, text)) => {
                ([(header::CONTENT_TYPE, content_type)], text).into_response()
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    async fn run_one(&self, request: DispatchRequest) -> Result<Value, RotorError> {
        let outcome = self.dispatcher.run(request).await?;
        let mut body = Map::new();
        body.insert("events".into(), json!(outcome.result.events));
        body.insert("execLog".into(), json!(outcome.result.exec_log));
        if let Some(err) = outcome.error {
            body.insert("error".into(), json!(err));
        }
        Ok(Value::Object(body))
    }

    async fn func_handler(
        State(service): State<RotorService>,
        Json(request): Json<FuncRequest>,
    ) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
        let dispatch = DispatchRequest::for_event(request.connection_id, request.event)
            .with_retries(request.retries)
            .with_function_id(request.function_id);
        match service.run_one(dispatch).await {
            Ok(body) => {
                HTTP_REQUESTS.with_label_values(&["/func", "200"]).inc();
                Ok(Json(body))
            }
            Err(e) => {
                let status = error_status(&e);
                error!("Function run failed: {}", e);
                HTTP_REQUESTS
                    .with_label_values(&["/func", status.as_str()])
                    .inc();
                Err((status, Json(json!({ "error": e.to_string() }))))
            }
        }
    }

    async fn multi_handler(
        State(service): State<RotorService>,
        Json(request): Json<MultiFuncRequest>,
    ) -> Json<Value> {
        let Some(first) = request.connection_ids.first() else {
            HTTP_REQUESTS.with_label_values(&["/func/multi", "200"]).inc();
            return Json(json!({}));
        };
        let base = DispatchRequest::for_event(first.clone(), request.event);
        let runs = request.connection_ids.iter().map(|id| {
            let dispatch = base.clone().with_connection_id(id.clone());
            let service = &service;
            async move { (id.clone(), service.run_one(dispatch).await) }
        });
        let mut results = Map::new();
        for (id, result) in join_all(runs).await {
            let value = match result {
                Ok(body) => body,
                Err(e) => json!({ "error": e.to_string() }),
            };
            results.insert(id, value);
        }
        HTTP_REQUESTS.with_label_values(&["/func/multi", "200"]).inc();
        Json(json!({ "results": results }))
    }

    pub async fn serve(
        self,
        addr: SocketAddr,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        let app = self.router();

        info!("Starting rotor HTTP service on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            error!("Server error: {}", e);
            return Err(e.into());
        }

        Ok(())
    }
}
