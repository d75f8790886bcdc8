use sync_server::{Config, Server, setup_environment};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. 加载 .env (不存在时忽略)
    dotenv::dotenv().ok();

    // 2. 加载配置
    let config = Config::from_env();

    // 3. 工作目录和日志
    setup_environment(&config)?;
    tracing::info!(work_dir = %config.work_dir, "Contact sync server starting...");

    // 4. 启动 HTTP 服务器和后台任务
    if let Err(e) = Server::new(config).run().await {
        tracing::error!(error = %e, "Server error");
        return Err(e);
    }

    Ok(())
}
