//! SQRL HTTP 绑定
//!
//! - `GET  /login`：签发页面 Nut 并创建关联器
//! - `POST /sqrl`：SQRL 客户端回调（`nut` / `cor` 在查询串，其余在表单）
//! - `GET  /status/{correlator}`：浏览器轮询
//! - `GET  /cps/{correlator}?token=`：CPS 令牌兑换
//! - `GET  /health`, `GET /metrics`

use crate::metrics::{
    CPS_REDEMPTIONS, PAGES_ISSUED, RequestTimer, SQRL_REQUESTS, STATUS_CACHE, export_metrics,
};
use crate::service::trace::http_trace_layer;
use axum::{
    Form, Json, Router,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use sqrl_common::{ExpiringCache, HttpBindConfig};
use sqrl_protocol::{
    AuthenticationPage, CorrelatorSnapshot, RawSqrlRequest, SqrlEngine, SqrlError, TifFlag,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 状态轮询缓存时长
const STATUS_CACHE_TTL: Duration = Duration::from_secs(1);

/// HTTP 层共享状态
#[derive(Clone)]
pub struct SqrlHttpState {
    engine: Arc<SqrlEngine>,
    status_cache: Arc<Mutex<ExpiringCache<String, CorrelatorSnapshot>>>,
    forwarding_headers: Arc<[String]>,
    instance_name: Arc<str>,
}

impl SqrlHttpState {
    pub fn new(engine: Arc<SqrlEngine>, bind: &HttpBindConfig, instance_name: &str) -> Self {
        Self {
            engine,
            status_cache: Arc::new(Mutex::new(ExpiringCache::new(STATUS_CACHE_TTL))),
            forwarding_headers: bind.ip_forwarding_headers.clone().into(),
            instance_name: instance_name.into(),
        }
    }

    /// 客户端 IP：按顺序取第一个存在且可解析的转发头，否则使用对端地址
    fn client_ip(&self, headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
        self.forwarding_headers
            .iter()
            .filter_map(|name| headers.get(name.as_str()))
            .filter_map(|value| value.to_str().ok())
            .find_map(|value| value.split(',').next()?.trim().parse().ok())
            .unwrap_or_else(|| peer.ip())
    }
}

/// 协议错误到 HTTP 响应的映射
///
/// 只在无法构造协议应答时使用，响应体不携带内部细节
pub struct ApiError(pub SqrlError);

impl From<SqrlError> for ApiError {
    fn from(err: SqrlError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            SqrlError::CorrelatorNotFound(_) => (StatusCode::NOT_FOUND, "Resource not found"),
            e if e.is_client_error() => (StatusCode::BAD_REQUEST, "Bad request"),
            e => {
                error!("Internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
        (status, message).into_response()
    }
}

/// 创建 SQRL 路由
pub fn create_router(state: SqrlHttpState) -> Router {
    Router::new()
        .route("/login", get(login_handler))
        .route("/sqrl", post(sqrl_handler))
        .route("/status/{correlator}", get(status_handler))
        .route("/cps/{correlator}", get(cps_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(http_trace_layer())
}

async fn login_handler(
    State(state): State<SqrlHttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<AuthenticationPage>, ApiError> {
    let timer = RequestTimer::new("GET", "/login");
    let ip = state.client_ip(&headers, peer);

    let result = state.engine.begin_authentication(&ip).await;
    timer.observe(if result.is_ok() { 200 } else { 500 });

    let page = result?;
    PAGES_ISSUED.inc();
    Ok(Json(page))
}

async fn sqrl_handler(
    State(state): State<SqrlHttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<RawSqrlRequest>,
    Form(body): Form<RawSqrlRequest>,
) -> Response {
    let timer = RequestTimer::new("POST", "/sqrl");
    let ip = state.client_ip(&headers, peer);

    let raw = RawSqrlRequest {
        nut: query.nut.or(body.nut),
        cor: query.cor.or(body.cor),
        ..body
    };

    match state.engine.handle_request(raw, &ip).await {
        Ok(reply) => {
            let outcome = if reply.tif.contains(TifFlag::ClientFailure) {
                "client_failure"
            } else if reply.tif.contains(TifFlag::CommandFailed) {
                "command_failed"
            } else {
                "ok"
            };
            SQRL_REQUESTS.with_label_values(&[outcome]).inc();
            timer.observe(200);
            debug!("SQRL reply sent (tif={})", reply.tif);

            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                reply.encoded,
            )
                .into_response()
        }
        Err(e) => {
            SQRL_REQUESTS.with_label_values(&["rejected"]).inc();
            // 无法构造应答时一律回复裸状态码，未知关联器也按 400 处理
            let status = StatusCode::from_u16(e.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            timer.observe(status.as_u16());
            if status.is_server_error() {
                error!("SQRL request failed: {}", e);
            }
            status.into_response()
        }
    }
}

async fn status_handler(
    State(state): State<SqrlHttpState>,
    Path(correlator_id): Path<String>,
) -> Result<Json<CorrelatorSnapshot>, ApiError> {
    if let Some(snapshot) = state.status_cache.lock().await.get(&correlator_id) {
        STATUS_CACHE.with_label_values(&["hit"]).inc();
        return Ok(Json(snapshot));
    }
    STATUS_CACHE.with_label_values(&["miss"]).inc();

    let snapshot = state.engine.correlator_status(&correlator_id).await?;
    state
        .status_cache
        .lock()
        .await
        .insert(correlator_id, snapshot.clone());
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
struct CpsQuery {
    token: String,
}

async fn cps_handler(
    State(state): State<SqrlHttpState>,
    Path(correlator_id): Path<String>,
    Query(query): Query<CpsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state
        .engine
        .redeem_cps_token(&correlator_id, &query.token)
        .await
    {
        Ok(idk) => {
            CPS_REDEMPTIONS.with_label_values(&["success"]).inc();
            info!("CPS session established for correlator {}", correlator_id);
            Ok(Json(json!({
                "correlator_id": correlator_id,
                "idk": idk,
            })))
        }
        Err(e) => {
            CPS_REDEMPTIONS.with_label_values(&["rejected"]).inc();
            warn!("CPS redemption failed for {}: {}", correlator_id, e);
            Err(e.into())
        }
    }
}

async fn health_handler(State(state): State<SqrlHttpState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "sqrl",
        "name": &*state.instance_name,
        "backend": state.engine.persistence().backend_name(),
        "timestamp": sqrl_protocol::unix_timestamp(),
    }))
}

async fn metrics_handler() -> String {
    export_metrics()
}

/// 绑定端口并在后台运行 HTTP 服务器，收到关闭广播后优雅退出
///
/// 返回实际监听地址（端口为 0 时由系统分配）
pub async fn serve(
    router: Router,
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to address '{addr}': {e}"))?;
    let local_addr = listener.local_addr()?;
    info!("HTTP server listening on {}", local_addr);

    let handle = tokio::spawn(async move {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("HTTP server received shutdown signal");
        });
        if let Err(e) = server.await {
            error!("HTTP server error: {}", e);
            let _ = shutdown_tx.send(());
        }
        info!("HTTP server stopped");
    });

    Ok((local_addr, handle))
}
