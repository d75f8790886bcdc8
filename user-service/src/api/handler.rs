//! User API Handlers

use axum::{
    Json,
    extract::{Path, State},
};
use http::StatusCode;
use shared::error::{AppError, AppResult};
use shared::models::{User, UserCreate, UserUpdate};

use super::UserState;
use crate::service::UserUpdateResult;

/// GET /users/ - 获取所有用户
pub async fn list(State(service): State<UserState>) -> AppResult<Json<Vec<User>>> {
    Ok(Json(service.list()?))
}

/// GET /users/{id} - 获取单个用户
pub async fn get_by_id(
    State(service): State<UserState>,
    Path(id): Path<String>,
) -> AppResult<Json<User>> {
    let user = service
        .get(&id)?
        .ok_or_else(|| AppError::user_not_found(&id))?;
    Ok(Json(user))
}

/// POST /users/ - 创建用户
pub async fn create(
    State(service): State<UserState>,
    Json(payload): Json<UserCreate>,
) -> AppResult<(StatusCode, Json<User>)> {
    let user = service.create(payload)?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// PUT /users/{id} - 更新联系信息
pub async fn update(
    State(service): State<UserState>,
    Path(id): Path<String>,
    Json(payload): Json<UserUpdate>,
) -> AppResult<Json<UserUpdateResult>> {
    let result = service.update(&id, payload).await?;
    Ok(Json(result))
}
