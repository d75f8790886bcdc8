//! User API 模块
//!
//! | 路径 | 方法 | 说明 |
//! |------|------|------|
//! | /users/ | GET | 用户列表 |
//! | /users/ | POST | 创建用户 |
//! | /users/{id} | GET | 获取用户 |
//! | /users/{id} | PUT | 更新联系信息并发布事件 |

mod handler;

use axum::{Router, routing::get};
use std::sync::Arc;

use crate::service::UserService;

pub type UserState = Arc<UserService>;

pub fn router(service: UserState) -> Router {
    routes().with_state(service)
}

fn routes() -> Router<UserState> {
    Router::new()
        .route("/users", get(handler::list).post(handler::create))
        .route("/users/", get(handler::list).post(handler::create))
        .route("/users/{id}", get(handler::get_by_id).put(handler::update))
}
