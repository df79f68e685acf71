use std::process;

use log::{info, LevelFilter};
use syslog::{BasicLogger, Facility, Formatter3164};
use tracing_subscriber::EnvFilter;

use super::args::{Args, LogFormat};
use crate::config::Config;
use crate::VERSION;

/// Level from the command line, else from the configuration file.
pub fn effective_level(args: &Args, config: &Config) -> tracing::Level {
    args.log_level
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(tracing::Level::INFO)
}

pub fn init_logging(args: &Args, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let level = effective_level(args, config);
    match &args.syslog_prog_name {
        Some(syslog_name) => init_syslog(syslog_name.clone(), level)?,
        None => {
            // Initialize a default filter, and then override the builtin default "warning" with
            // our level (default: "info")
            let filter = EnvFilter::from_default_env().add_directive(level.into());

            let trace_sub = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(!args.no_color);

            match args.log_format {
                LogFormat::Structured => trace_sub.json().try_init().map_err(|err| err.to_string())?,
                LogFormat::Debug => trace_sub.pretty().try_init().map_err(|err| err.to_string())?,
                LogFormat::Text => trace_sub.try_init().map_err(|err| err.to_string())?,
            };
        }
    }
    info!("Starting pg_stats_exporter (Version {VERSION})");
    Ok(())
}

fn init_syslog(syslog_name: String, level: tracing::Level) -> Result<(), Box<dyn std::error::Error>> {
    let formatter = Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: None,
        process: syslog_name,
        pid: process::id(),
    };
    let syslog_logger = syslog::unix(formatter)?;
    // max level in syslog mode is INFO (performance penalty for DEBUG).
    let max_level = if level >= tracing::Level::INFO {
        LevelFilter::Info
    } else {
        level_filter(level)
    };
    log::set_boxed_logger(Box::new(BasicLogger::new(syslog_logger)))?;
    log::set_max_level(max_level);
    Ok(())
}

fn level_filter(level: tracing::Level) -> LevelFilter {
    match level {
        tracing::Level::ERROR => LevelFilter::Error,
        tracing::Level::WARN => LevelFilter::Warn,
        tracing::Level::INFO => LevelFilter::Info,
        tracing::Level::DEBUG => LevelFilter::Debug,
        tracing::Level::TRACE => LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::args::parse_from;

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["pg_stats_exporter"];
        full.extend_from_slice(argv);
        parse_from(full, std::iter::empty()).unwrap()
    }

    #[test]
    fn test_effective_level() {
        let mut config = Config::default();
        assert_eq!(effective_level(&args(&[]), &config), tracing::Level::INFO);

        config.log.level = "debug".to_string();
        assert_eq!(effective_level(&args(&[]), &config), tracing::Level::DEBUG);
        assert_eq!(
            effective_level(&args(&["--log-level", "warn"]), &config),
            tracing::Level::WARN
        );

        config.log.level = "chatty".to_string();
        assert_eq!(effective_level(&args(&[]), &config), tracing::Level::INFO);
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter(tracing::Level::WARN), LevelFilter::Warn);
        assert_eq!(level_filter(tracing::Level::TRACE), LevelFilter::Trace);
    }
}
