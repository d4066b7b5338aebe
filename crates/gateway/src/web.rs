use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::db::{SeriesPoint, StatsSummary};
use crate::mqtt::DeviceSettings;
use crate::orchestrator::Orchestrator;

type AppState = Arc<Orchestrator>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(orch: AppState) -> Router {
    Router::new()
        .route("/api/telemetry", get(get_telemetry))
        .route("/api/settings", get(get_settings).post(post_settings))
        .route("/api/weather", get(get_weather))
        .route("/api/history", get(get_history))
        .route("/api/stats", get(get_stats))
        .route("/api/ai_report/daily", get(get_daily_report))
        .route("/api/ai_report/weekly", get(get_weekly_report))
        .route_layer(middleware::from_fn_with_state(
            orch.clone(),
            require_access_key,
        ))
        .with_state(orch)
}

/// Opaque access-key check: missing header → 401, unknown key → 403.
async fn require_access_key(State(orch): State<AppState>, request: Request, next: Next) -> Response {
    let key = request
        .headers()
        .get("X-Access-Key")
        .and_then(|v| v.to_str().ok());

    let Some(key) = key else {
        return (StatusCode::UNAUTHORIZED, "missing X-Access-Key header").into_response();
    };

    match orch.verify_access_key(key).await {
        Some(_user_id) => next.run(request).await,
        None => (StatusCode::FORBIDDEN, "invalid or expired key").into_response(),
    }
}

// ---------------------------------------------------------------------------
// Handlers — thin delegates to orchestrator accessors
// ---------------------------------------------------------------------------

async fn get_telemetry(State(orch): State<AppState>) -> Response {
    match orch.current_telemetry().await {
        Some(t) => Json(t).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            "telemetry not yet received from the device",
        )
            .into_response(),
    }
}

async fn get_settings(State(orch): State<AppState>) -> Response {
    match orch.fetch_settings().await {
        Some(s) => Json(s).into_response(),
        None => (StatusCode::NOT_FOUND, "device settings unavailable").into_response(),
    }
}

async fn post_settings(
    State(orch): State<AppState>,
    Json(settings): Json<DeviceSettings>,
) -> StatusCode {
    // Fire-and-forget; the reachability guard inside decides whether
    // anything actually goes out.
    orch.push_settings(&settings).await;
    StatusCode::ACCEPTED
}

async fn get_weather(State(orch): State<AppState>) -> Response {
    match orch.weather().await {
        Some(w) => Json(w).into_response(),
        None => (StatusCode::NOT_FOUND, "no cached weather available").into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct WindowParams {
    #[serde(default = "default_hours")]
    hours: i64,
    #[serde(default = "default_max_points")]
    max_points: usize,
}

fn default_hours() -> i64 {
    24
}

fn default_max_points() -> usize {
    100
}

#[derive(Serialize)]
struct HistoryResponse {
    period_hours: i64,
    records_count: usize,
    records: Vec<SeriesPoint>,
}

async fn get_history(State(orch): State<AppState>, Query(params): Query<WindowParams>) -> Response {
    if !(1..=168).contains(&params.hours) {
        return (StatusCode::BAD_REQUEST, "hours must be within 1..=168").into_response();
    }

    match orch.history(params.hours, params.max_points).await {
        Ok(records) if records.is_empty() => {
            (StatusCode::NOT_FOUND, "no history for the period").into_response()
        }
        Ok(records) => Json(HistoryResponse {
            period_hours: params.hours,
            records_count: records.len(),
            records,
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("history query failed: {e}"))
            .into_response(),
    }
}

#[derive(Serialize)]
struct StatsResponse {
    period_hours: i64,
    #[serde(flatten)]
    summary: StatsSummary,
}

async fn get_stats(State(orch): State<AppState>, Query(params): Query<WindowParams>) -> Response {
    if !(1..=168).contains(&params.hours) {
        return (StatusCode::BAD_REQUEST, "hours must be within 1..=168").into_response();
    }

    match orch.stats(params.hours).await {
        Ok(summary) => Json(StatsResponse {
            period_hours: params.hours,
            summary,
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("stats query failed: {e}"))
            .into_response(),
    }
}

async fn get_daily_report(State(orch): State<AppState>) -> Response {
    match orch.daily_report().await {
        Some(text) => text.into_response(),
        None => (StatusCode::BAD_GATEWAY, "daily report unavailable").into_response(),
    }
}

async fn get_weekly_report(State(orch): State<AppState>) -> Response {
    match orch.weekly_report().await {
        Some(text) => text.into_response(),
        None => (StatusCode::BAD_GATEWAY, "weekly report unavailable").into_response(),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(orch: AppState, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(orch))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    use crate::cache::WeatherCache;
    use crate::config::Config;
    use crate::db::Store;
    use crate::mqtt::{DeviceLink, InboundEvent, TelemetryMsg, TimeSetPayload, WeatherForDevice};
    use crate::report::ReportClient;
    use crate::weather::ForecastClient;
    use async_trait::async_trait;

    const KEY: &str = "test-access-key";

    struct NullLink;

    #[async_trait]
    impl DeviceLink for NullLink {
        async fn send_weather(&self, _: &str, _: &WeatherForDevice) -> bool {
            true
        }
        async fn push_settings(&self, _: &str, _: &DeviceSettings) -> bool {
            true
        }
        async fn request_settings(&self, _: &str) -> bool {
            true
        }
        async fn send_time(&self, _: &str, _: &TimeSetPayload) -> bool {
            true
        }
    }

    async fn test_app() -> (Router, Arc<Orchestrator>) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let cache = WeatherCache::new(store.pool().clone());
        cache.seed_access_key(KEY, 7).await;

        let forecast = ForecastClient::new("http://127.0.0.1:9/forecast", "k").unwrap();
        let reporter = ReportClient::new("http://127.0.0.1:9", "k", "m").unwrap();

        let mut cfg = Config::default();
        cfg.session.settings_timeout_secs = 1;

        let orch = Arc::new(Orchestrator::new(
            cfg,
            store,
            cache,
            Arc::new(NullLink),
            forecast,
            reporter,
        ));
        (router(orch.clone()), orch)
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .header("X-Access-Key", KEY)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn telemetry_event() -> InboundEvent {
        InboundEvent::Telemetry {
            device_id: "greenhouse_01".to_string(),
            msg: TelemetryMsg {
                temperature: 22.5,
                humidity: 51.0,
                free_memory: None,
                uptime: None,
                bluetooth_is_active: None,
            },
        }
    }

    // -- auth ---------------------------------------------------------------

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let (app, _) = test_app().await;
        let resp = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/telemetry")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_key_is_forbidden() {
        let (app, _) = test_app().await;
        let resp = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/telemetry")
                    .header("X-Access-Key", "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    // -- telemetry ------------------------------------------------------------

    #[tokio::test]
    async fn telemetry_absent_is_not_found() {
        let (app, _) = test_app().await;
        let resp = app.oneshot(get("/api/telemetry")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn telemetry_present_is_returned() {
        let (app, orch) = test_app().await;
        orch.dispatch(telemetry_event()).await;

        let resp = app.oneshot(get("/api/telemetry")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["temperature"], 22.5);
        assert_eq!(json["humidity"], 51.0);
        assert_eq!(json["device_id"], "greenhouse_01");
    }

    // -- settings ---------------------------------------------------------------

    #[tokio::test]
    async fn settings_pull_while_offline_is_not_found() {
        let (app, _) = test_app().await;
        // Device never connected: the guard short-circuits, no 5 s wait.
        let resp = app.oneshot(get("/api/settings")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn settings_push_is_accepted() {
        let (app, _) = test_app().await;
        let body = serde_json::to_string(&DeviceSettings::default()).unwrap();
        let resp = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/settings")
                    .header("X-Access-Key", KEY)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    // -- weather ------------------------------------------------------------------

    #[tokio::test]
    async fn weather_absent_is_not_found() {
        let (app, _) = test_app().await;
        let resp = app.oneshot(get("/api/weather")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    // -- history / stats ------------------------------------------------------------

    #[tokio::test]
    async fn history_empty_is_not_found() {
        let (app, _) = test_app().await;
        let resp = app.oneshot(get("/api/history?hours=24")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn history_returns_persisted_rows() {
        let (app, orch) = test_app().await;
        // Five samples → one durable row.
        for _ in 0..5 {
            orch.dispatch(telemetry_event()).await;
        }

        let resp = app.oneshot(get("/api/history?hours=24")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["period_hours"], 24);
        assert_eq!(json["records_count"], 1);
        assert_eq!(json["records"][0]["temp_in"], 22.5);
    }

    #[tokio::test]
    async fn history_hours_out_of_range_is_bad_request() {
        let (app, _) = test_app().await;
        let resp = app.oneshot(get("/api/history?hours=0")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let (app, _) = test_app().await;
        let resp = app.oneshot(get("/api/history?hours=169")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_empty_is_still_ok() {
        let (app, _) = test_app().await;
        let resp = app.oneshot(get("/api/stats?hours=24")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["period_hours"], 24);
        assert_eq!(json["total_records"], 0);
    }

    // -- reports -----------------------------------------------------------------------

    #[tokio::test]
    async fn daily_report_absent_is_bad_gateway() {
        let (app, _) = test_app().await;
        let resp = app.oneshot(get("/api/ai_report/daily")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn weekly_report_absent_is_bad_gateway() {
        let (app, _) = test_app().await;
        let resp = app.oneshot(get("/api/ai_report/weekly")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
