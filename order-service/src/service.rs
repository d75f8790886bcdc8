//! Order service
//!
//! Create, read and status edits. Contact fields on an order only change
//! through the sync path so they always match one user version.

use serde::Serialize;
use shared::error::{AppError, AppResult};
use shared::models::{Order, OrderCreate, OrderStatus};
use validator::Validate;

use crate::storage::{OrderStorage, OrderStore};

/// Result of a status edit
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusChange {
    pub previous: Order,
    pub current: Order,
}

#[derive(Debug, Clone)]
pub struct OrderService {
    storage: OrderStorage,
}

impl OrderService {
    pub fn new(storage: OrderStorage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &OrderStorage {
        &self.storage
    }

    pub fn create(&self, data: OrderCreate) -> AppResult<Order> {
        data.validate()?;
        let order = self.storage.create(data)?;
        tracing::info!(
            order_id = %order.order_id,
            user_id = %order.user_id,
            synced_version = order.last_synced_user_version,
            "Order created"
        );
        Ok(order)
    }

    pub fn get(&self, order_id: &str) -> AppResult<Order> {
        self.storage
            .find_by_order_id(order_id)?
            .ok_or_else(|| AppError::order_not_found(order_id))
    }

    pub fn list_by_status(&self, status: OrderStatus) -> AppResult<Vec<Order>> {
        Ok(self.storage.find_by_status(status)?)
    }

    pub fn update_status(&self, order_id: &str, status: OrderStatus) -> AppResult<OrderStatusChange> {
        let change = self.storage.update_status(order_id, status)?;
        tracing::info!(
            order_id = %order_id,
            from = %change.previous.order_status,
            to = %change.current.order_status,
            "Order status updated"
        );
        Ok(OrderStatusChange {
            previous: change.previous,
            current: change.current,
        })
    }
}
