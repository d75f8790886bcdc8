//! 健康检查路由
//!
//! | 路径 | 方法 | 说明 |
//! |------|------|------|
//! | /health | GET | 健康检查 (含事件通道积压) |
//!
//! ```json
//! {
//!   "status": "ok",
//!   "version": "0.1.0",
//!   "revision": "v2",
//!   "uptimeSeconds": 42,
//!   "pendingEvents": 0,
//!   "deadLetters": 0
//! }
//! ```

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Instant;

use crate::state::ServerState;

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// ok | degraded
    status: &'static str,
    version: &'static str,
    /// 用户服务版本标签
    revision: String,
    uptime_seconds: u64,
    /// 尚未确认的事件数 (通道不可用时为空)
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_events: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dead_letters: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

// 服务器启动时间 (懒加载)
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Record the process start for uptime reporting
pub fn mark_started() {
    START_TIME.get_or_init(Instant::now);
}

fn uptime_seconds() -> u64 {
    START_TIME.get_or_init(Instant::now).elapsed().as_secs()
}

/// GET /health - 健康检查
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    let backlog = async {
        let pending = state.channel.pending_count().await?;
        let dead = state.channel.dead_letters().await?.len();
        Ok::<_, message_bus::ChannelError>((pending, dead))
    };

    let mut response = HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        revision: state.config.user_service_revision.clone(),
        uptime_seconds: uptime_seconds(),
        pending_events: None,
        dead_letters: None,
        message: None,
    };

    match backlog.await {
        Ok((pending, dead)) => {
            response.pending_events = Some(pending);
            response.dead_letters = Some(dead);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read event channel");
            response.status = "degraded";
            response.message = Some(e.to_string());
        }
    }

    Json(response)
}
