#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use portal::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, static_cfg) = Config::load()?;
    portal::logging::init(config.log_level, config.log_path.as_deref())?;
    portal::portal_main(config, static_cfg).await
}
