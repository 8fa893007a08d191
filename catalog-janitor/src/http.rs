use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use eyre::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::app_context::{AppContext, JanitorStatus};

pub async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn index(State(context): State<Arc<AppContext>>) -> String {
    format!("catalog janitor {}", context.janitor.settings.id)
}

async fn liveness(State(context): State<Arc<AppContext>>) -> Response {
    if context.state.is_alive(Utc::now()).await {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "janitor stalled").into_response()
    }
}

async fn status(State(context): State<Arc<AppContext>>) -> Json<JanitorStatus> {
    Json(context.state.get_status().await)
}

pub fn app(context: Arc<AppContext>) -> Result<Router> {
    let metrics_enabled = context.metrics;
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(liveness))
        .route("/status", get(status));

    // Installing the recorder touches global state, so tests leave it off
    let router = if metrics_enabled {
        setup_metrics_routes(router)?
    } else {
        router
    };

    Ok(router.with_state(context))
}

fn setup_metrics_routes(router: Router<Arc<AppContext>>) -> Result<Router<Arc<AppContext>>> {
    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
    ];

    let recorder_handle = PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
