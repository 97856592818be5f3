use anyhow::Result;

use crate::config;

pub fn run(
    http_addr: Option<String>,
    log_level: Option<String>,
    config_path: Option<String>,
    db_path: Option<String>,
) -> Result<()> {
    // Load config from file (custom path or default)
    let cfg = if let Some(path) = config_path {
        config::load_from(std::path::Path::new(&path))?
    } else {
        config::load()?
    };
    let mut daemon_config = cfg.daemon.unwrap_or_default();

    // CLI flags override config values
    if let Some(addr) = http_addr {
        daemon_config.http_addr = addr;
    }
    if let Some(level) = log_level {
        daemon_config.log_level = level;
    }
    if let Some(path) = db_path {
        daemon_config.db_path = Some(path.into());
    }

    // Build tokio runtime explicitly (no #[tokio::main] on fn main)
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(crate::server::run(daemon_config, cfg.feeds))
}
