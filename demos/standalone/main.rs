use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use demos::{load_config, FsHandler};
use flexi_logger::Logger;
use gecko_tftp::Server;
use log::{error, info};

/// 以一个目录为根的 tftp 服务
#[derive(Debug, Parser)]
#[clap(version, about)]
struct Args {
    /// 配置文件路径
    #[clap(short, long)]
    config: Option<String>,
    /// 监听地址，覆盖配置文件
    #[clap(short, long)]
    bind: Option<SocketAddr>,
    /// 文件根目录
    #[clap(short, long)]
    root: Option<PathBuf>,
    /// 日志级别
    #[clap(long, default_value = "info")]
    log_level: String,
    /// 拒绝所有上传
    #[clap(long)]
    read_only: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // 初始化日志
    let _logger = match Logger::try_with_env_or_str(&args.log_level).and_then(|l| l.start()) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("failed to init logger: {}", e);
            std::process::exit(1);
        }
    };

    // 获取配置：配置文件 < 环境变量 < 命令行
    let (mut cfg, overrides) = match load_config(args.config.as_deref()).await {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        cfg.server.bind_addr = bind;
    }
    let root = args
        .root
        .or(overrides.root)
        .unwrap_or_else(|| PathBuf::from("."));
    let read_only = args.read_only || overrides.read_only.unwrap_or(false);
    info!(
        "serving {} (read_only={}, block_size={}, timeout={}ms, retries={})",
        root.display(),
        read_only,
        cfg.transfer.block_size,
        cfg.transfer.timeout_ms,
        cfg.transfer.retries
    );

    // 启动 server
    let handler = FsHandler::new(root, cfg.transfer.block_size).read_only(read_only);
    if let Err(e) = Server::new(cfg, handler).serve().await {
        error!("{}", e);
        std::process::exit(1);
    }
}
