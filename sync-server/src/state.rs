//! Server State
//!
//! 打开数据文件并把同一个事件通道注入两个服务。
//!
//! ```text
//! WORK_DIR/data/
//! ├── channel.redb   # 事件通道 (持久化队列 + 死信)
//! ├── users.redb     # 用户服务
//! └── orders.redb    # 订单服务 (含已处理事件)
//! ```

use anyhow::Context;
use axum::Router;
use message_bus::{EventChannel, RedbChannel};
use order_service::api::OrderState;
use order_service::sync::{
    HttpUserDirectory, OrderSyncApplier, ReconciliationPolicy, ReconciliationSweep, SyncWorker,
    UserDirectory,
};
use order_service::{OrderService, OrderStorage};
use std::sync::Arc;
use std::time::Duration;
use user_service::{Publisher, UserService, UserStorage};

use crate::api;
use crate::config::Config;
use crate::directory::LocalUserDirectory;
use crate::tasks::{BackgroundTasks, TaskKind};

const CHANNEL_FILE: &str = "channel.redb";
const USERS_FILE: &str = "users.redb";
const ORDERS_FILE: &str = "orders.redb";

/// Timeout for user lookups over HTTP
const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);

/// 服务器状态 - 持有所有服务句柄 (Arc 共享，克隆开销低)
#[derive(Clone)]
pub struct ServerState {
    pub config: Config,
    pub channel: Arc<dyn EventChannel>,
    pub users: Arc<UserService>,
    pub orders: OrderService,
    pub applier: OrderSyncApplier,
    pub sweep: Arc<ReconciliationSweep>,
    pub policy: ReconciliationPolicy,
}

impl ServerState {
    /// 在 `WORK_DIR/data` 下打开 (或创建) 所有数据库
    pub fn initialize(config: &Config) -> anyhow::Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;

        let channel = RedbChannel::open(data_dir.join(CHANNEL_FILE)).context("open event channel")?;
        let users = UserStorage::open(data_dir.join(USERS_FILE)).context("open user store")?;
        let orders = OrderStorage::open(data_dir.join(ORDERS_FILE)).context("open order store")?;

        tracing::info!(data_dir = %data_dir.display(), "Databases opened");
        Self::from_parts(config.clone(), Arc::new(channel), users, orders)
    }

    /// Wire services over already opened stores
    pub fn from_parts(
        config: Config,
        channel: Arc<dyn EventChannel>,
        user_storage: UserStorage,
        order_storage: OrderStorage,
    ) -> anyhow::Result<Self> {
        let policy = config.reconciliation_policy();

        let publisher = Publisher::new(channel.clone(), config.publish_retry())
            .with_source(config.user_service_revision.clone());
        let users = Arc::new(UserService::new(user_storage.clone(), publisher));

        let applier = OrderSyncApplier::new(Arc::new(order_storage.clone()), policy.store_retry);
        let directory: Arc<dyn UserDirectory> = match &config.user_directory_url {
            Some(url) => {
                tracing::info!(url = %url, "Reconciliation reads users over HTTP");
                Arc::new(
                    HttpUserDirectory::new(url.clone(), DIRECTORY_TIMEOUT)
                        .context("build user directory client")?,
                )
            }
            None => Arc::new(LocalUserDirectory::new(user_storage)),
        };
        let sweep = Arc::new(ReconciliationSweep::new(
            applier.clone(),
            directory,
            policy.clone(),
        ));

        Ok(Self {
            config,
            channel,
            users,
            orders: OrderService::new(order_storage),
            applier,
            sweep,
            policy,
        })
    }

    /// In-memory stores (tests, ephemeral runs)
    pub fn in_memory(config: Config) -> anyhow::Result<Self> {
        Self::from_parts(
            config,
            Arc::new(RedbChannel::open_in_memory()?),
            UserStorage::open_in_memory()?,
            OrderStorage::open_in_memory()?,
        )
    }

    pub fn sync_worker(&self) -> SyncWorker {
        SyncWorker::new(self.channel.clone(), self.applier.clone(), self.policy.clone())
    }

    /// Full HTTP surface: users, orders, sync admin, health
    pub fn router(&self) -> Router {
        Router::new()
            .merge(user_service::api::router(self.users.clone()))
            .merge(order_service::api::router(OrderState {
                service: self.orders.clone(),
                channel: self.channel.clone(),
                sweep: self.sweep.clone(),
            }))
            .merge(api::health::router(self.clone()))
    }

    /// 注册同步消费者和定时对账任务
    pub fn start_background_tasks(&self, tasks: &mut BackgroundTasks) {
        let worker = self.sync_worker();
        let shutdown = tasks.shutdown_token();
        tasks.spawn("sync_worker", TaskKind::Worker, worker.run(shutdown));

        if self.policy.sweep_interval.is_zero() {
            tracing::info!("Reconciliation sweep disabled");
        } else {
            let sweep = self.sweep.clone();
            let shutdown = tasks.shutdown_token();
            tasks.spawn("reconciliation_sweep", TaskKind::Periodic, sweep.run(shutdown));
        }

        tasks.log_summary();
    }
}
