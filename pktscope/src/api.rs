use crate::dispatch::{SnifferContext, StatsSnapshot};
use crate::reader;
use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade, ws::{Message, WebSocket}},
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

pub struct AppState {
    pub ctx: Arc<SnifferContext>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    packets_seen: Counter,
    lines_logged: Counter,
    parse_skips: Counter,
    format_overflows: Counter,
    log_resets: Counter,
    log_bytes: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let packets_seen = Counter::default();
        let lines_logged = Counter::default();
        let parse_skips = Counter::default();
        let format_overflows = Counter::default();
        let log_resets = Counter::default();
        let log_bytes = Gauge::default();

        registry.register(
            "pktscope_packets_seen",
            "Packets delivered to the hooks",
            packets_seen.clone(),
        );
        registry.register(
            "pktscope_lines_logged",
            "Packets rendered into the log",
            lines_logged.clone(),
        );
        registry.register(
            "pktscope_parse_skips",
            "Packets that were not TCP/UDP over IPv4",
            parse_skips.clone(),
        );
        registry.register(
            "pktscope_format_overflows",
            "Lines dropped for exceeding the line bound",
            format_overflows.clone(),
        );
        registry.register(
            "pktscope_log_resets",
            "Times the log was cleared on overflow",
            log_resets.clone(),
        );
        registry.register(
            "pktscope_log_bytes",
            "Bytes currently held in the log",
            log_bytes.clone(),
        );

        Self {
            registry,
            packets_seen,
            lines_logged,
            parse_skips,
            format_overflows,
            log_resets,
            log_bytes,
        }
    }

    /// Bring the monotonic counters up to the atomic totals.
    fn sync(&self, stats: &StatsSnapshot, log_bytes: usize) {
        fn catch_up(counter: &Counter, total: u64) {
            let current = counter.get();
            if total > current {
                counter.inc_by(total - current);
            }
        }
        catch_up(&self.packets_seen, stats.packets_seen);
        catch_up(&self.lines_logged, stats.lines_logged);
        catch_up(&self.parse_skips, stats.parse_skips);
        catch_up(&self.format_overflows, stats.format_overflows);
        catch_up(&self.log_resets, stats.log_resets);
        self.log_bytes.set(log_bytes as i64);
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    packets_seen: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    log_bytes: usize,
    log_capacity: usize,
    #[serde(flatten)]
    counters: StatsSnapshot,
}

#[derive(Deserialize, Default)]
pub struct LogParams {
    offset: Option<usize>,
    len: Option<usize>,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/latest", get(get_latest))
        .route("/log", get(get_log))
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/stream", get(ws_handler))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| s.parse::<IpNet>().ok())
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

fn is_allowed(allowed: &[IpNet], ip: IpAddr) -> bool {
    allowed.iter().any(|net| net.contains(&ip))
}

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if is_allowed(&allowed, ip) {
            return next.run(req).await.into_response();
        }
        tracing::debug!("rejected read from {}", ip);
        return StatusCode::FORBIDDEN.into_response();
    }
    // If there is no ConnectInfo, allow (should not happen with into_make_service_with_connect_info).
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_latest(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = reader::read_latest(&state.ctx);
    tracing::debug!("/latest: sent {} bytes", body.len());
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], body)
}

async fn get_log(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogParams>,
) -> impl IntoResponse {
    let body: Bytes = match (params.offset, params.len) {
        (None, None) => reader::read_log(&state.ctx),
        (offset, len) => reader::read_log_chunk(&state.ctx, offset.unwrap_or(0), len),
    };
    tracing::debug!("/log: sent {} bytes", body.len());
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], body)
}

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        packets_seen: state.ctx.stats.snapshot().packets_seen,
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        log_bytes: state.ctx.store.len(),
        log_capacity: state.ctx.store.capacity(),
        counters: state.ctx.stats.snapshot(),
    })
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    metrics.sync(&state.ctx.stats.snapshot(), state.ctx.store.len());

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        tracing::error!("failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Follow mode: push every new latest line. Missed intermediate lines are not
/// replayed; the full history is available from `/log`.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    tracing::debug!("stream session opened");
    let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(250));
    let mut seen = 0;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                if client_gone(&incoming) {
                    break;
                }
            }
            _ = interval.tick() => {
                let generation = state.ctx.latest.generation();
                if generation == seen {
                    continue;
                }
                seen = generation;

                let line = state.ctx.latest.get();
                let text = String::from_utf8_lossy(line.as_bytes()).into_owned();
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!("stream session closed");
}

/// Whether a frame read from a follow session means the client has left.
/// Anything else the client sends is ignored.
fn client_gone(incoming: &Option<Result<Message, axum::Error>>) -> bool {
    matches!(incoming, None | Some(Err(_)) | Some(Ok(Message::Close(_))))
}
