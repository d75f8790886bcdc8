//! Order API Handlers

use axum::{
    Json,
    extract::{Path, Query, State},
};
use http::StatusCode;
use serde::Deserialize;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{Order, OrderCreate, OrderStatus, OrderStatusUpdate};

use super::OrderState;
use crate::service::OrderStatusChange;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// GET /orders/?status= - 按状态查询订单
pub async fn list(
    State(state): State<OrderState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Order>>> {
    let raw = query
        .status
        .ok_or_else(|| AppError::invalid_request("status query parameter is required"))?;
    let status: OrderStatus = raw.parse().map_err(|msg: String| {
        AppError::with_message(ErrorCode::InvalidOrderStatus, msg).with_detail("status", raw.clone())
    })?;
    Ok(Json(state.service.list_by_status(status)?))
}

/// GET /orders/{id} - 获取订单
pub async fn get_by_id(
    State(state): State<OrderState>,
    Path(id): Path<String>,
) -> AppResult<Json<Order>> {
    Ok(Json(state.service.get(&id)?))
}

/// POST /orders/ - 创建订单
pub async fn create(
    State(state): State<OrderState>,
    Json(payload): Json<OrderCreate>,
) -> AppResult<(StatusCode, Json<Order>)> {
    let order = state.service.create(payload)?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// PUT /orders/{id}/status - 更新订单状态
pub async fn update_status(
    State(state): State<OrderState>,
    Path(id): Path<String>,
    Json(payload): Json<OrderStatusUpdate>,
) -> AppResult<Json<OrderStatusChange>> {
    let change = state.service.update_status(&id, payload.order_status)?;
    Ok(Json(change))
}
