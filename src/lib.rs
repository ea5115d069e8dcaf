pub mod config;
pub mod observer;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use self::{config::Config, observer::Observer, statistics::Statistics};

pub use self::server::LtpHandle;

/// In order to let integration tests and embedding applications use the
/// ltp-server crate directly, a function is opened to replace the main
/// function to directly start the server. The returned handle accepts
/// transmission requests; dropping every clone of it stops the server
/// loop.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<LtpHandle> {
    let statistics = Statistics::default();
    let observer = Observer::new(config.clone(), statistics.clone());

    server::start(&config, &statistics, observer).await
}
