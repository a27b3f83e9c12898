//! The `sessionfs` file server binary.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use sessionfs::common::logger::init_logger;
use sessionfs::common::shutdown::wait_for_shutdown;
use sessionfs::config::ServerConfig;
use sessionfs::rpc::common::TimeoutOptions;
use sessionfs::rpc::server::RpcServer;
use sessionfs::server::{FileService, SubscriberRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });
    init_logger(&config.log_level);
    config.validate()?;

    let root = config.root_dir.canonicalize()?;
    let registry = Arc::new(SubscriberRegistry::new());
    let service = Arc::new(FileService::new(root.clone(), registry));
    let mut server = RpcServer::new(TimeoutOptions::default(), service);
    server.listen(&config.addr).await?;
    info!("Serving {} on {}", root.display(), config.addr);

    wait_for_shutdown()?.await;
    server.stop().await;
    info!("Server stopped");
    Ok(())
}
