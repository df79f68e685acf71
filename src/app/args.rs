use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};

use crate::collector::DEFAULT_NAMESPACE;
use crate::config::DEFAULT_CONFIG_FILE;

/// Prometheus exporter for PostgreSQL and GaussDB server statistics.
#[derive(Parser, Debug)]
#[command(name = "pg_stats_exporter", author, version, about, long_about = None)]
pub struct Args {
    #[arg(long = "config-file", default_value = DEFAULT_CONFIG_FILE, env = "PG_EXPORTER_CONFIG_FILE")]
    pub config_file: String,

    #[arg(long = "web.listen-address", default_value = "0.0.0.0:9103", env = "PG_EXPORTER_WEB_LISTEN_ADDRESS")]
    pub listen_address: String,

    #[arg(long = "web.telemetry-path", default_value = "/metrics", env = "PG_EXPORTER_WEB_TELEMETRY_PATH")]
    pub telemetry_path: String,

    #[arg(long, default_value_t = false, env = "PG_EXPORTER_DISABLE_DEFAULT_METRICS", help = "Do not include default metrics")]
    pub disable_default_metrics: bool,

    #[arg(long, default_value_t = false, env = "PG_EXPORTER_DISABLE_SETTINGS_METRICS", help = "Do not include pg_settings metrics")]
    pub disable_settings_metrics: bool,

    #[arg(long, default_value_t = false, env = "PG_EXPORTER_AUTO_DISCOVER_DATABASES", help = "Discover the databases on a server dynamically")]
    pub auto_discover_databases: bool,

    #[arg(long, value_delimiter = ',', env = "PG_EXPORTER_EXCLUDE_DATABASES", help = "Databases to leave out of discovery and per-database results")]
    pub exclude_databases: Vec<String>,

    #[arg(long, value_delimiter = ',', env = "PG_EXPORTER_INCLUDE_DATABASES", help = "Databases to keep when auto-discovery is enabled")]
    pub include_databases: Vec<String>,

    #[arg(long, default_value = DEFAULT_NAMESPACE, env = "PG_EXPORTER_METRIC_PREFIX", help = "Prefix of every exported metric")]
    pub metric_prefix: String,

    #[arg(long = "data-source-name", value_delimiter = ',', env = "DATA_SOURCE_NAME", help = "Connection strings scraped by the telemetry endpoint; defaults to every configured instance")]
    pub data_source_name: Vec<String>,

    /// Overrides the level from the configuration file.
    #[arg(short, long, env)]
    pub log_level: Option<tracing::Level>,

    #[clap(short='F', long, value_enum, default_value_t=LogFormat::Text, env)]
    pub log_format: LogFormat,

    #[arg(short, long, default_value_t = false, env, help = "disable colors in the log output")]
    pub no_color: bool,

    #[arg(long, env = "PG_EXPORTER_SYSLOG_PROG_NAME", help = "log to syslog under this program name instead of stdout")]
    pub syslog_prog_name: Option<String>,

    /// Collector switches given on the command line, in `(name, enabled)`
    /// form. Filled by [`parse`].
    #[arg(skip)]
    pub collector_overrides: Vec<(String, bool)>,
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Structured,
    Debug,
}

fn enable_flag(name: &str) -> String {
    format!("collector.{name}")
}

fn disable_flag(name: &str) -> String {
    format!("no-collector.{name}")
}

/// Parses `argv` with one `--collector.<name>` / `--no-collector.<name>`
/// pair per registered collector.
pub fn parse_from<'a, I, T>(
    argv: I,
    collectors: impl Iterator<Item = (&'a str, bool)>,
) -> Result<Args, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let names: Vec<(&str, bool)> = collectors.collect();
    let mut command = Args::command();
    for (name, default_enabled) in &names {
        let default = if *default_enabled {
            "enabled"
        } else {
            "disabled"
        };
        command = command
            .arg(
                Arg::new(enable_flag(name))
                    .long(enable_flag(name))
                    .action(ArgAction::SetTrue)
                    .help(format!("Enable the {name} collector (default: {default})")),
            )
            .arg(
                Arg::new(disable_flag(name))
                    .long(disable_flag(name))
                    .action(ArgAction::SetTrue)
                    .help(format!("Disable the {name} collector")),
            );
    }

    let matches = command.try_get_matches_from(argv)?;
    let mut args = Args::from_arg_matches(&matches)?;
    args.collector_overrides = names
        .iter()
        .filter_map(|(name, _)| collector_override(&matches, name))
        .map(|(name, enabled)| (name.to_string(), enabled))
        .collect();
    Ok(args)
}

/// Parses the process arguments, exiting on error or `--help`.
pub fn parse<'a>(collectors: impl Iterator<Item = (&'a str, bool)>) -> Args {
    parse_from(std::env::args_os(), collectors).unwrap_or_else(|err| err.exit())
}

/// The switch given last wins.
fn collector_override<'a>(matches: &ArgMatches, name: &'a str) -> Option<(&'a str, bool)> {
    let last_index = |id: &str| {
        if matches.value_source(id) != Some(ValueSource::CommandLine) {
            return None;
        }
        matches.indices_of(id).and_then(|indices| indices.max())
    };
    match (last_index(&enable_flag(name)), last_index(&disable_flag(name))) {
        (None, None) => None,
        (Some(_), None) => Some((name, true)),
        (None, Some(_)) => Some((name, false)),
        (Some(enable), Some(disable)) => Some((name, enable > disable)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLLECTORS: [(&str, bool); 2] = [("memory", true), ("wait_events", false)];

    fn parse_args(argv: &[&str]) -> Args {
        let mut full = vec!["pg_stats_exporter"];
        full.extend_from_slice(argv);
        parse_from(full, COLLECTORS.iter().copied()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse_args(&[]);
        assert_eq!(args.config_file, DEFAULT_CONFIG_FILE);
        assert_eq!(args.listen_address, "0.0.0.0:9103");
        assert_eq!(args.telemetry_path, "/metrics");
        assert_eq!(args.metric_prefix, "gs");
        assert_eq!(args.log_format, LogFormat::Text);
        assert!(args.log_level.is_none());
        assert!(args.collector_overrides.is_empty());
    }

    #[test]
    fn test_collector_switches() {
        let args = parse_args(&["--collector.wait_events", "--no-collector.memory"]);
        assert_eq!(
            args.collector_overrides,
            vec![
                ("memory".to_string(), false),
                ("wait_events".to_string(), true)
            ]
        );
    }

    #[test]
    fn test_last_collector_switch_wins() {
        let args = parse_args(&["--no-collector.memory", "--collector.memory"]);
        assert_eq!(args.collector_overrides, vec![("memory".to_string(), true)]);

        let args = parse_args(&["--collector.memory", "--no-collector.memory"]);
        assert_eq!(args.collector_overrides, vec![("memory".to_string(), false)]);
    }

    #[test]
    fn test_unknown_collector_switch_is_rejected() {
        let argv = ["pg_stats_exporter", "--collector.nope"];
        assert!(parse_from(argv, COLLECTORS.iter().copied()).is_err());
    }

    #[test]
    fn test_list_flags() {
        let args = parse_args(&[
            "--exclude-databases",
            "template0,template1",
            "--data-source-name",
            "host=a,host=b",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.exclude_databases, vec!["template0", "template1"]);
        assert_eq!(args.data_source_name, vec!["host=a", "host=b"]);
        assert_eq!(args.log_level, Some(tracing::Level::DEBUG));
    }
}
