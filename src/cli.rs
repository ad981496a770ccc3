//! Thin argument parsing: this binary takes exactly one flag, `--config`,
//! naming the config file to load. Everything else is driven from config.

use std::{env, path::PathBuf};

use anyhow::{Result, anyhow};

use crate::config::DEFAULT_CONFIG_FILE;

pub fn config_path_from_args() -> Result<PathBuf> {
    let mut args = env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("missing value for --config"))?;
                config_path = Some(PathBuf::from(value));
            }
            other => {
                return Err(anyhow!(
                    "unknown argument: {other}. usage: model-runner [--config <path>]"
                ));
            }
        }
    }

    Ok(config_path.unwrap_or_else(|| PathBuf::from(format!("./{DEFAULT_CONFIG_FILE}"))))
}
