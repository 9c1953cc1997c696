pub mod api;
pub mod config;
pub mod logging;
pub mod peers;
pub mod redirect;
pub mod server;

use config::Config;

/// Replaces `main` for integration tests that want to drive a real
/// portal process in-memory: loads the static config, binds the
/// control socket, and starts the HTTP front door. Returns once the
/// HTTP server stops, which under normal operation is never.
pub async fn portal_main(config: Config, static_cfg: config::StaticConfig) -> anyhow::Result<()> {
    let state = server::run(config, static_cfg).await?;
    api::start(state).await
}
