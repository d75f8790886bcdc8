//! Order API 模块
//!
//! | 路径 | 方法 | 说明 |
//! |------|------|------|
//! | /orders/ | POST | 创建订单 |
//! | /orders/?status= | GET | 按状态查询 |
//! | /orders/{id} | GET | 获取订单 |
//! | /orders/{id}/status | PUT | 更新状态 |
//! | /sync/dead-letters | GET | 死信列表 |
//! | /sync/dead-letters/{seq}/requeue | POST | 死信重新入队 |
//! | /sync/users/{user_id}/resync | POST | 单个用户重新同步 |
//! | /sync/reconcile | POST | 立即执行一次对账 |

mod handler;
mod sync;

use axum::{
    Router,
    routing::{get, post, put},
};
use message_bus::EventChannel;
use std::sync::Arc;

use crate::service::OrderService;
use crate::sync::ReconciliationSweep;

/// Handles shared by the order and sync routes
#[derive(Clone)]
pub struct OrderState {
    pub service: OrderService,
    pub channel: Arc<dyn EventChannel>,
    pub sweep: Arc<ReconciliationSweep>,
}

pub fn router(state: OrderState) -> Router {
    order_routes().merge(sync_routes()).with_state(state)
}

fn order_routes() -> Router<OrderState> {
    Router::new()
        .route("/orders", get(handler::list).post(handler::create))
        .route("/orders/", get(handler::list).post(handler::create))
        .route("/orders/{id}", get(handler::get_by_id))
        .route("/orders/{id}/status", put(handler::update_status))
}

fn sync_routes() -> Router<OrderState> {
    Router::new()
        .route("/sync/dead-letters", get(sync::list_dead_letters))
        .route("/sync/dead-letters/{seq}/requeue", post(sync::requeue_dead_letter))
        .route("/sync/users/{user_id}/resync", post(sync::resync_user))
        .route("/sync/reconcile", post(sync::reconcile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use http::{Request, StatusCode};
    use message_bus::{EnvelopeChannelExt, RedbChannel, RetryPolicy};
    use serde_json::{Value, json};
    use shared::message::EventEnvelope;
    use tower::ServiceExt;

    use crate::storage::OrderStorage;
    use crate::storage::tests::contact;
    use crate::sync::reconcile::tests::{StaticDirectory, user};
    use crate::sync::{OrderSyncApplier, ReconciliationPolicy};

    struct TestApp {
        router: Router,
        channel: Arc<RedbChannel>,
        directory: Arc<StaticDirectory>,
    }

    fn app() -> TestApp {
        let storage = OrderStorage::open_in_memory().unwrap();
        let channel = Arc::new(RedbChannel::open_in_memory().unwrap());
        let directory = Arc::new(StaticDirectory::default());
        let applier = OrderSyncApplier::new(Arc::new(storage.clone()), RetryPolicy::immediate(1));
        let sweep = ReconciliationSweep::new(
            applier,
            directory.clone(),
            ReconciliationPolicy::default(),
        );
        let router = router(OrderState {
            service: OrderService::new(storage),
            channel: channel.clone(),
            sweep: Arc::new(sweep),
        });
        TestApp {
            router,
            channel,
            directory,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(match body {
                Some(b) => Body::from(b.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn order_body(user_id: &str, user_version: u64) -> Value {
        json!({
            "userId": user_id,
            "items": [{"itemId": "sku-1", "quantity": 2, "price": 9.5}],
            "userEmails": ["a@x.com"],
            "deliveryAddress": {
                "street": "1 Rd", "city": "c", "state": "s", "postalCode": "p", "country": "co"
            },
            "orderStatus": "under process",
            "userVersion": user_version,
        })
    }

    #[tokio::test]
    async fn test_create_get_list_and_status_flow() {
        let app = app().router;

        let (status, order) = call(&app, "POST", "/orders/", Some(order_body("u1", 3))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(order["orderStatus"], "under process");
        assert_eq!(order["lastSyncedUserVersion"], 3);
        let id = order["orderId"].as_str().unwrap().to_string();

        let (status, fetched) = call(&app, "GET", &format!("/orders/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched, order);

        let (status, change) = call(
            &app,
            "PUT",
            &format!("/orders/{id}/status"),
            Some(json!({"orderStatus": "shipping"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(change["previous"]["orderStatus"], "under process");
        assert_eq!(change["current"]["orderStatus"], "shipping");
        assert_eq!(change["current"]["lastSyncedUserVersion"], 3);

        let (status, shipping) = call(&app, "GET", "/orders?status=shipping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(shipping.as_array().unwrap().len(), 1);

        let (status, pending) = call(&app, "GET", "/orders/?status=under%20process", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(pending.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_order_error_statuses() {
        let app = app().router;

        let (status, body) = call(&app, "GET", "/orders/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 4001);

        let (status, body) = call(
            &app,
            "PUT",
            "/orders/missing/status",
            Some(json!({"orderStatus": "delivered"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 4001);

        let (status, body) = call(&app, "GET", "/orders?status=lost", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 4002);

        let (status, _) = call(&app, "GET", "/orders", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut bad = order_body("u1", 0);
        bad["items"] = json!([]);
        let (status, _) = call(&app, "POST", "/orders/", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_fields() {
        let app = app().router;

        let mut body = order_body("u1", 0);
        body["lastSyncedUserVersion"] = json!(99);
        let (status, _) = call(&app, "POST", "/orders/", Some(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_dead_letter_list_and_requeue() {
        let TestApp {
            router: app,
            channel,
            ..
        } = app();

        let env = EventEnvelope::new("u1", 2, contact("a@x.com", "A St"));
        channel.send_envelope(&env).await.unwrap();
        let delivery = channel.poll(1).await.unwrap().remove(0);
        channel.dead_letter(&delivery, "store down").await.unwrap();

        let (status, dead) = call(&app, "GET", "/sync/dead-letters", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(dead[0]["seq"], delivery.seq);
        assert_eq!(dead[0]["reason"], "store down");
        assert_eq!(dead[0]["envelope"]["userVersion"], 2);

        let uri = format!("/sync/dead-letters/{}/requeue", delivery.seq);
        let (status, requeued) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(requeued["requeuedAs"].as_u64().unwrap() > delivery.seq);
        assert_eq!(channel.pending_count().await.unwrap(), 1);

        let (status, body) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 6002);
    }

    #[tokio::test]
    async fn test_resync_and_reconcile() {
        let TestApp {
            router: app,
            directory,
            ..
        } = app();

        let (_, order) = call(&app, "POST", "/orders/", Some(order_body("u1", 1))).await;
        let id = order["orderId"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "POST", "/sync/users/u1/resync", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 1001);

        directory.put(user("u1", 4, "4 Rd"));
        let (status, report) = call(&app, "POST", "/sync/reconcile", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["laggingOrders"], 1);
        assert_eq!(report["applied"], 1);

        let (_, synced) = call(&app, "GET", &format!("/orders/{id}"), None).await;
        assert_eq!(synced["lastSyncedUserVersion"], 4);
        assert_eq!(synced["deliveryAddress"]["street"], "4 Rd");

        // Already current, nothing to apply
        let (status, report) = call(&app, "POST", "/sync/users/u1/resync", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["matched"], 1);
        assert_eq!(report["applied"], 0);
        assert_eq!(report["stale"], 1);
    }
}
