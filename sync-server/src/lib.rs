//! Contact Sync Server
//!
//! 在同一进程中托管用户服务和订单服务，并共享一个持久化事件通道。
//!
//! ```text
//! PUT /users/{id} ──► UserService ──► Publisher ──► channel.redb
//!                                                       │
//!                      SyncWorker ◄── poll/ack/nack ────┘
//!                          │
//!                          ▼
//!                    OrderStorage (version-gated update)
//!                          ▲
//!            ReconciliationSweep (periodic, /sync/reconcile)
//! ```
//!
//! # 模块结构
//!
//! - `config` - 环境变量配置
//! - `state` - 数据文件与服务装配
//! - `server` - HTTP 服务与优雅关闭
//! - `tasks` - 后台任务管理
//! - `directory` - 进程内用户目录
//! - `logger` - 日志初始化

pub mod api;
pub mod config;
pub mod directory;
pub mod logger;
pub mod server;
pub mod state;
pub mod tasks;

pub use config::Config;
pub use server::Server;
pub use state::ServerState;
pub use tasks::{BackgroundTasks, TaskKind};

/// Load `.env`, prepare the work dir, start logging
pub fn setup_environment(config: &Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.work_dir)?;

    let log_dir = config.log_dir();
    let file_logs = config.is_production().then_some(log_dir.as_path());
    logger::init_logger(&config.log_level, config.log_json, file_logs)?;
    Ok(())
}
