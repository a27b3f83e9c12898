//! The `sessionfs` client mount binary.
//!
//! Builds the client core and parks until a termination signal. The
//! kernel file-system bridge attaches to the running [`FsClient`] to
//! translate system calls into its operations.

use clap::Parser;
use tracing::info;

use sessionfs::client::FsClient;
use sessionfs::common::logger::init_logger;
use sessionfs::common::shutdown::wait_for_shutdown;
use sessionfs::config::MountConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = MountConfig::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });
    init_logger(&config.log_level);

    let mut client = FsClient::new(&config.server_addr, config.cache_root.clone()).await?;
    info!(
        "Client {} ready at mount point {}; server root is {}",
        client.client_id(),
        config.mount_point.display(),
        client.server_root()
    );

    wait_for_shutdown()?.await;
    client.shutdown().await;
    info!("Client stopped");
    Ok(())
}
