//! `pg_settings` gauges.

use super::session::QueryRow;
use crate::collector::MetricSink;

pub const SETTINGS_QUERY: &str = "SELECT name, setting, COALESCE(unit, '') AS unit, \
    short_desc, vartype FROM pg_settings \
    WHERE vartype IN ('bool', 'integer', 'real') AND name != 'sync_commit_cancel_wait'";

/// Normalizes a setting to base units, returning the value and the name
/// suffix for the unit.
pub fn normalize(value: f64, unit: &str) -> Option<(f64, &'static str)> {
    let (factor, suffix) = match unit {
        "" => (1.0, ""),
        "ms" => (0.001, "_seconds"),
        "s" => (1.0, "_seconds"),
        "min" => (60.0, "_seconds"),
        "h" => (3_600.0, "_seconds"),
        "d" => (86_400.0, "_seconds"),
        "B" => (1.0, "_bytes"),
        "kB" => (1024.0, "_bytes"),
        "MB" => (1024.0 * 1024.0, "_bytes"),
        "GB" => (1024.0 * 1024.0 * 1024.0, "_bytes"),
        "TB" => (1024.0 * 1024.0 * 1024.0 * 1024.0, "_bytes"),
        "8kB" => (8.0 * 1024.0, "_bytes"),
        "16kB" => (16.0 * 1024.0, "_bytes"),
        "32kB" => (32.0 * 1024.0, "_bytes"),
        "16MB" => (16.0 * 1024.0 * 1024.0, "_bytes"),
        "32MB" => (32.0 * 1024.0 * 1024.0, "_bytes"),
        "64MB" => (64.0 * 1024.0 * 1024.0, "_bytes"),
        _ => return None,
    };
    // -1 means "disabled" for many settings and must survive conversion
    if value == -1.0 {
        return Some((value, suffix));
    }
    Some((value * factor, suffix))
}

fn metric_name(namespace: &str, setting: &str, suffix: &str) -> String {
    let setting: String = setting
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{namespace}_settings_{setting}{suffix}")
}

/// Emits one gauge per numeric or boolean setting. Rows with unknown units
/// or unparseable values are skipped.
pub fn emit(
    rows: &[QueryRow],
    sink: &MetricSink,
    namespace: &str,
    server: &str,
) -> prometheus::Result<()> {
    for row in rows {
        let (Some(name), Some(value)) = (row.get("name"), row.get_f64("setting")) else {
            continue;
        };
        let unit = row.get("unit").unwrap_or("");
        let Some((value, suffix)) = normalize(value, unit) else {
            continue;
        };
        let help = row.get("short_desc").unwrap_or(name);
        sink.gauge(
            &metric_name(namespace, name, suffix),
            help,
            &["server"],
            &[server],
            value,
        )?;
    }
    Ok(())
}
