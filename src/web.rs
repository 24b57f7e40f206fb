use crate::{
    app::SearchApp,
    backfill::BackfillReport,
    search::{ImageSearchResponse, SearchError, TextSearchResponse},
};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

/// Room for multipart boundaries and headers on top of the image itself
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
struct SharedState {
    app: Arc<SearchApp>,
}

pub fn router(app: Arc<SearchApp>) -> Router {
    let upload_limit = app.config.max_upload_bytes + MULTIPART_OVERHEAD;
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/search/text", post(search_text))
        .route(
            "/search/image",
            post(search_image).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/admin/search/backfill", post(backfill))
        .route("/health", get(health))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down");
}

async fn start_app(app: SearchApp, listen_addr: &str) -> anyhow::Result<()> {
    let app = router(Arc::new(app));

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    log::info!("listening on {listen_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn start_daemon(app: SearchApp, listen_addr: &str) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(app, listen_addr).await })
}

#[derive(Debug)]
struct HttpError(SearchError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            SearchError::InvalidInput(_) | SearchError::UnsupportedFormat(_) => {
                StatusCode::BAD_REQUEST
            }
            SearchError::CorruptImage | SearchError::EncodingFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            SearchError::EncodingTimeout | SearchError::IndexUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (
            status,
            Json(json!({"error": self.0.to_string(), "code": self.0.code()})),
        )
            .into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<SearchError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSearchParams {
    pub q: Option<String>,
    pub limit: Option<usize>,
    pub taxonomy_limit: Option<usize>,
}

impl TextSearchParams {
    /// Query-string values win over body values.
    fn merge(self, body: Option<Self>) -> Self {
        let body = body.unwrap_or_default();
        Self {
            q: self.q.or(body.q),
            limit: self.limit.or(body.limit),
            taxonomy_limit: self.taxonomy_limit.or(body.taxonomy_limit),
        }
    }
}

async fn search_text(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<TextSearchParams>,
    body: Option<Json<TextSearchParams>>,
) -> Result<Json<TextSearchResponse>, HttpError> {
    let params = params.merge(body.map(|Json(b)| b));
    log::debug!("text search: {params:?}");

    let q = params
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| SearchError::InvalidInput("Please enter a search term.".to_string()))?;

    let response = state
        .app
        .ranker
        .search_text(&q, params.limit, params.taxonomy_limit)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageSearchParams {
    pub limit: Option<usize>,
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> SearchError {
    log::debug!("multipart rejected: {err}");
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        SearchError::InvalidInput("Image is too large.".to_string())
    } else {
        SearchError::InvalidInput("Malformed upload.".to_string())
    }
}

async fn search_image(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<ImageSearchParams>,
    mut multipart: Multipart,
) -> Result<Json<ImageSearchResponse>, HttpError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("image") {
            continue;
        }
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_error)?;
        upload = Some((bytes.to_vec(), content_type));
        break;
    }

    let (bytes, content_type) = upload.ok_or_else(|| {
        SearchError::InvalidInput("Missing 'image' field in upload.".to_string())
    })?;
    log::debug!(
        "image search: {} bytes, declared {content_type:?}",
        bytes.len()
    );

    let response = state
        .app
        .ranker
        .search_image(bytes, content_type, params.limit)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillParams {
    pub batch_size: Option<usize>,
}

async fn backfill(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<BackfillParams>,
) -> Result<Json<BackfillReport>, HttpError> {
    let batch_size = params
        .batch_size
        .unwrap_or(state.app.config.backfill_batch_size)
        .max(1);
    let worker = state.app.backfill.clone();

    tokio::task::spawn_blocking(move || worker.run_batch(batch_size))
        .await
        .map_err(|err| {
            log::error!("backfill task failed: {err}");
            SearchError::IndexUnavailable
        })?
        .map(Json)
        .map_err(|err| {
            log::error!("backfill failed: {err:#}");
            HttpError(SearchError::IndexUnavailable)
        })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub encoder_ready: bool,
    pub indexed: usize,
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        encoder_ready: state.app.encoder.is_ready(),
        indexed: state.app.ranker.indexed(),
    })
}
