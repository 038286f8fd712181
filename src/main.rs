use anyhow::Context;
use daybook_lib::host::{serve, Host};
use daybook_lib::models::HostConfig;
use daybook_lib::service::CollectionService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HostConfig::from_env();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;
    daybook_lib::init_tracing(&config.log_dir()).map_err(anyhow::Error::msg)?;

    let service = CollectionService::open(&config.db_path()).context("failed to open database")?;
    let host = Host::new(service);
    tracing::info!(data_dir = %config.data_dir.display(), "host ready");

    let handled = serve(&host, tokio::io::stdin(), tokio::io::stdout()).await;
    match &handled {
        Ok(count) => tracing::info!(count, "input closed; shutting down"),
        Err(error) => tracing::error!(error = %error, "request loop failed; shutting down"),
    }

    host.into_service().shutdown()?;
    handled?;
    Ok(())
}
