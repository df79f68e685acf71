//! In-memory `log` backend for tests that assert on emitted records.

use std::sync::Once;

use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub struct CapturedLogs {
    records: Mutex<Vec<(Level, String)>>,
}

static LOGS: Lazy<CapturedLogs> = Lazy::new(|| CapturedLogs {
    records: Mutex::new(Vec::new()),
});
static INSTALL: Once = Once::new();

impl Log for CapturedLogs {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.records
            .lock()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

impl CapturedLogs {
    /// Records at `level` whose message contains `needle`.
    pub fn matching(&self, level: Level, needle: &str) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|(recorded, message)| *recorded == level && message.contains(needle))
            .map(|(_, message)| message.clone())
            .collect()
    }
}

/// Installs the capturing logger on first use and clears earlier records.
/// Callers run under `#[serial(logs)]` since the logger is process-wide.
pub fn capture() -> &'static CapturedLogs {
    INSTALL.call_once(|| {
        let _ = log::set_logger(&*LOGS);
        log::set_max_level(LevelFilter::Trace);
    });
    LOGS.records.lock().clear();
    &LOGS
}
