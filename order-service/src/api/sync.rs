//! Sync API Handlers

use axum::{
    Json,
    extract::{Path, State},
};
use message_bus::{ChannelError, DeadLetter};
use serde::Serialize;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::message::EventEnvelope;

use super::OrderState;
use crate::sync::{SweepReport, SyncReport};

/// Dead letter as shown to operators
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterView {
    pub seq: u64,
    pub partition_key: String,
    pub delivery_count: u32,
    pub enqueued_at: i64,
    pub dead_lettered_at: i64,
    pub reason: String,
    /// None when the payload is not a readable envelope
    pub envelope: Option<EventEnvelope>,
}

impl From<DeadLetter> for DeadLetterView {
    fn from(entry: DeadLetter) -> Self {
        Self {
            envelope: entry.envelope(),
            seq: entry.seq,
            partition_key: entry.partition_key,
            delivery_count: entry.delivery_count,
            enqueued_at: entry.enqueued_at,
            dead_lettered_at: entry.dead_lettered_at,
            reason: entry.reason,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueResponse {
    pub seq: u64,
    pub requeued_as: u64,
}

fn channel_error(err: ChannelError) -> AppError {
    match err {
        ChannelError::DeadLetterNotFound(seq) => {
            AppError::new(ErrorCode::DeadLetterNotFound).with_detail("seq", seq)
        }
        other => AppError::channel_unavailable(other.to_string()),
    }
}

/// GET /sync/dead-letters - 死信列表
pub async fn list_dead_letters(
    State(state): State<OrderState>,
) -> AppResult<Json<Vec<DeadLetterView>>> {
    let entries = state.channel.dead_letters().await.map_err(channel_error)?;
    Ok(Json(entries.into_iter().map(DeadLetterView::from).collect()))
}

/// POST /sync/dead-letters/{seq}/requeue - 死信重新入队
pub async fn requeue_dead_letter(
    State(state): State<OrderState>,
    Path(seq): Path<u64>,
) -> AppResult<Json<RequeueResponse>> {
    let requeued_as = state
        .channel
        .requeue_dead_letter(seq)
        .await
        .map_err(channel_error)?;
    Ok(Json(RequeueResponse { seq, requeued_as }))
}

/// POST /sync/users/{user_id}/resync - 按用户当前版本重新同步
pub async fn resync_user(
    State(state): State<OrderState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<SyncReport>> {
    Ok(Json(state.sweep.resync_user(&user_id).await?))
}

/// POST /sync/reconcile - 立即执行一次对账
pub async fn reconcile(State(state): State<OrderState>) -> AppResult<Json<SweepReport>> {
    Ok(Json(state.sweep.run_once().await?))
}
