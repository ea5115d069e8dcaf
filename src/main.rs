#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use ltp_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.network.peers.is_empty() {
        log::warn!(
            "No peers are configured; inbound segments will be parsed but reports and acknowledgements cannot be routed anywhere :-)"
        );
    }

    let _handle = ltp_server::startup(config).await?;

    // The server loop runs on its own task and stops when every handle is
    // dropped, so keep ours and park this task.
    std::future::pending::<()>().await;

    Ok(())
}
