use std::{env, path::PathBuf, time::SystemTime};

use cronsaga_models::errors::SendableError;
use log::{LevelFilter, info};

#[derive(Debug, Clone)]
pub struct LoggerSettings {
    pub level: LevelFilter,
    pub file: Option<PathBuf>,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            file: None,
        }
    }
}

pub fn setup_logger(settings: &LoggerSettings) -> Result<(), SendableError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(settings.level)
        // sqlx statement logging is noisy at info
        .level_for("sqlx", LevelFilter::Warn)
        .chain(std::io::stdout());

    if let Some(path) = &settings.file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

pub fn parse_level(value: &str) -> Result<LevelFilter, SendableError> {
    value
        .parse::<LevelFilter>()
        .map_err(|err| -> SendableError { Box::new(err) })
}

pub fn print_env() -> std::io::Result<()> {
    let path = env::current_dir()?;
    info!("The current directory is {}", path.display());
    Ok(())
}
