use log::info;

use crate::logger::{self, LoggerSettings, print_env};

pub fn startup(
    name: &str,
    settings: &LoggerSettings,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    logger::setup_logger(settings)?;
    log_panics::init();

    info!("--- {} ---", name);
    print_env()?;

    Ok(())
}
