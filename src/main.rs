use anyhow::{Context, Result};

use model_runner::{cli::config_path_from_args, config::Config, service};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_from_args()?;
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    service::run(config).await
}
