use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

/// Fully-resolved logging options. Precedence per knob: CLI override, then
/// the config file's `logging` section, then the defaults (info, json).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogOptions {
    pub fn resolve(config: &Config, cli_level: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();

        let raw_level = cli_level
            .or_else(|| logging.and_then(|logging| logging.level.as_deref()))
            .unwrap_or("info");
        let level = raw_level
            .trim()
            .to_ascii_lowercase()
            .parse::<LevelFilter>()
            .map_err(|_| {
                anyhow!(
                    "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
                )
            })?;

        Ok(Self {
            level,
            format: logging
                .and_then(|logging| logging.format)
                .unwrap_or(LogFormat::Json),
        })
    }
}

pub fn init(options: LogOptions) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(options.level)
        .with_target(true);
    match options.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}
