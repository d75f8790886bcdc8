use message_bus::RetryPolicy;
use order_service::sync::{DEFAULT_MAX_REDELIVERIES, ReconciliationPolicy};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 服务器配置 - 同步服务的所有配置项
///
/// # 环境变量
///
/// 所有配置项都可以通过环境变量覆盖 (启动时会先加载 `.env`)：
///
/// | 环境变量 | 默认值 | 说明 |
/// |----------|--------|------|
/// | WORK_DIR | /var/lib/contact-sync | 工作目录 (数据库、日志) |
/// | HTTP_PORT | 3000 | HTTP 服务端口 |
/// | ENVIRONMENT | development | 运行环境 |
/// | LOG_LEVEL | info | 日志级别 |
/// | LOG_JSON | false | JSON 格式日志 |
/// | USER_SERVICE_REVISION | v1 | 用户服务版本标签 (写入事件 source) |
/// | USER_DIRECTORY_URL | - | 对账时通过 HTTP 读取用户；未设置则读本地存储 |
/// | PUBLISH_MAX_ATTEMPTS | 5 | 发布最大尝试次数 |
/// | PUBLISH_BASE_DELAY_MS | 100 | 发布重试初始延迟 |
/// | PUBLISH_MAX_DELAY_MS | 5000 | 发布重试最大延迟 |
/// | SYNC_MAX_REDELIVERIES | 10 | 进入死信前的最大投递次数 |
/// | SYNC_STORE_RETRY_ATTEMPTS | 3 | 单次投递内存储重试次数 |
/// | SYNC_RETRY_BASE_DELAY_MS | 1000 | 重新投递初始延迟 |
/// | SYNC_RETRY_MAX_DELAY_MS | 60000 | 重新投递最大延迟 |
/// | SYNC_BATCH_SIZE | 16 | 每次拉取的最大消息数 |
/// | SYNC_POLL_INTERVAL_MS | 1000 | 空闲轮询间隔 |
/// | SYNC_DEDUP_WINDOW_SECS | 86400 | 已处理事件保留时长 |
/// | RECONCILE_INTERVAL_SECS | 300 | 对账周期 (0 = 关闭) |
/// | RECONCILE_STALENESS_THRESHOLD | 0 | 版本落后超过该值才对账 |
///
/// # 示例
///
/// ```ignore
/// WORK_DIR=/tmp/sync HTTP_PORT=8080 SYNC_MAX_REDELIVERIES=5 cargo run -p sync-server
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// 工作目录，存放 redb 数据文件和日志
    pub work_dir: String,
    /// HTTP API 服务端口
    pub http_port: u16,
    /// 运行环境: development | staging | production
    pub environment: String,
    pub log_level: String,
    pub log_json: bool,
    /// 当前用户服务版本 (v1 | v2)
    pub user_service_revision: String,
    /// 外部用户服务地址
    pub user_directory_url: Option<String>,

    // === 发布 ===
    pub publish_max_attempts: u32,
    pub publish_base_delay_ms: u64,
    pub publish_max_delay_ms: u64,

    // === 消费 ===
    pub sync_max_redeliveries: u32,
    pub sync_store_retry_attempts: u32,
    pub sync_retry_base_delay_ms: u64,
    pub sync_retry_max_delay_ms: u64,
    pub sync_batch_size: usize,
    pub sync_poll_interval_ms: u64,
    pub sync_dedup_window_secs: u64,

    // === 对账 ===
    pub reconcile_interval_secs: u64,
    pub reconcile_staleness_threshold: u64,
}

impl Config {
    /// 从环境变量加载配置
    ///
    /// 如果环境变量未设置或无法解析，使用默认值
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// 从任意键值来源加载配置
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            work_dir: var("WORK_DIR").unwrap_or_else(|| "/var/lib/contact-sync".into()),
            http_port: parse_or(var("HTTP_PORT"), 3000),
            environment: var("ENVIRONMENT").unwrap_or_else(|| "development".into()),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            log_json: parse_or(var("LOG_JSON"), false),
            user_service_revision: var("USER_SERVICE_REVISION").unwrap_or_else(|| "v1".into()),
            user_directory_url: var("USER_DIRECTORY_URL").filter(|url| !url.trim().is_empty()),

            publish_max_attempts: parse_or(var("PUBLISH_MAX_ATTEMPTS"), 5),
            publish_base_delay_ms: parse_or(var("PUBLISH_BASE_DELAY_MS"), 100),
            publish_max_delay_ms: parse_or(var("PUBLISH_MAX_DELAY_MS"), 5000),

            sync_max_redeliveries: parse_or(var("SYNC_MAX_REDELIVERIES"), DEFAULT_MAX_REDELIVERIES),
            sync_store_retry_attempts: parse_or(var("SYNC_STORE_RETRY_ATTEMPTS"), 3),
            sync_retry_base_delay_ms: parse_or(var("SYNC_RETRY_BASE_DELAY_MS"), 1000),
            sync_retry_max_delay_ms: parse_or(var("SYNC_RETRY_MAX_DELAY_MS"), 60_000),
            sync_batch_size: parse_or(var("SYNC_BATCH_SIZE"), 16),
            sync_poll_interval_ms: parse_or(var("SYNC_POLL_INTERVAL_MS"), 1000),
            sync_dedup_window_secs: parse_or(var("SYNC_DEDUP_WINDOW_SECS"), 24 * 60 * 60),

            reconcile_interval_secs: parse_or(var("RECONCILE_INTERVAL_SECS"), 300),
            reconcile_staleness_threshold: parse_or(var("RECONCILE_STALENESS_THRESHOLD"), 0),
        }
    }

    /// 使用自定义工作目录和端口覆盖部分配置
    ///
    /// 常用于测试场景
    pub fn with_overrides(work_dir: impl Into<String>, http_port: u16) -> Self {
        let mut config = Self::from_env();
        config.work_dir = work_dir.into();
        config.http_port = http_port;
        config
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.work_dir).join("data")
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.work_dir).join("logs")
    }

    pub fn publish_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.publish_max_attempts,
            Duration::from_millis(self.publish_base_delay_ms),
            Duration::from_millis(self.publish_max_delay_ms),
        )
    }

    pub fn reconciliation_policy(&self) -> ReconciliationPolicy {
        let defaults = ReconciliationPolicy::default();
        ReconciliationPolicy {
            max_redeliveries: self.sync_max_redeliveries.max(1),
            store_retry: RetryPolicy::new(
                self.sync_store_retry_attempts,
                defaults.store_retry.base_delay,
                defaults.store_retry.max_delay,
            ),
            redelivery_backoff: RetryPolicy::new(
                self.sync_max_redeliveries,
                Duration::from_millis(self.sync_retry_base_delay_ms),
                Duration::from_millis(self.sync_retry_max_delay_ms),
            ),
            batch_size: self.sync_batch_size.max(1),
            poll_interval: Duration::from_millis(self.sync_poll_interval_ms),
            dedup_window: Duration::from_secs(self.sync_dedup_window_secs),
            sweep_interval: Duration::from_secs(self.reconcile_interval_secs),
            staleness_threshold: self.reconcile_staleness_threshold,
        }
    }

    /// 是否生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// 是否开发环境
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
