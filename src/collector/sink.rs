//! Output sink shared by every collector of one scrape.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use prometheus::core::Collector as _;
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, Opts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Gauge,
    Counter,
}

enum Family {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

impl Family {
    fn new(
        value_type: ValueType,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> prometheus::Result<Family> {
        // prometheus rejects empty help strings
        let help = if help.is_empty() { name } else { help };
        let opts = Opts::new(name, help);
        Ok(match value_type {
            ValueType::Gauge => Family::Gauge(GaugeVec::new(opts, label_names)?),
            ValueType::Counter => Family::Counter(CounterVec::new(opts, label_names)?),
        })
    }

    fn value_type(&self) -> ValueType {
        match self {
            Family::Gauge(_) => ValueType::Gauge,
            Family::Counter(_) => ValueType::Counter,
        }
    }

    fn collect(&self) -> Vec<MetricFamily> {
        match self {
            Family::Gauge(vec) => vec.collect(),
            Family::Counter(vec) => vec.collect(),
        }
    }
}

/// Accepts samples from concurrent writers and turns them into metric
/// families. Ordering between writers is not preserved.
#[derive(Default)]
pub struct MetricSink {
    families: Mutex<BTreeMap<String, Family>>,
}

impl MetricSink {
    pub fn new() -> MetricSink {
        MetricSink::default()
    }

    pub fn gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        label_values: &[&str],
        value: f64,
    ) -> prometheus::Result<()> {
        self.record(ValueType::Gauge, name, help, label_names, label_values, value)
    }

    /// Counters are snapshots of server-side totals. NULL (NaN) values are
    /// skipped.
    pub fn counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        label_values: &[&str],
        value: f64,
    ) -> prometheus::Result<()> {
        self.record(ValueType::Counter, name, help, label_names, label_values, value)
    }

    pub fn record(
        &self,
        value_type: ValueType,
        name: &str,
        help: &str,
        label_names: &[&str],
        label_values: &[&str],
        value: f64,
    ) -> prometheus::Result<()> {
        if value_type == ValueType::Counter {
            if value.is_nan() {
                return Ok(());
            }
            if value < 0.0 {
                return Err(prometheus::Error::Msg(format!(
                    "counter {name} got negative value {value}"
                )));
            }
        }

        if label_names.len() != label_values.len() {
            return Err(prometheus::Error::InconsistentCardinality {
                expect: label_names.len(),
                got: label_values.len(),
            });
        }

        let mut families = self.families.lock();
        if !families.contains_key(name) {
            let family = Family::new(value_type, name, help, label_names)?;
            families.insert(name.to_string(), family);
        }
        let family = &families[name];
        if family.value_type() != value_type {
            return Err(prometheus::Error::Msg(format!(
                "metric {name} already recorded with another type"
            )));
        }
        match family {
            Family::Gauge(vec) => vec.get_metric_with_label_values(label_values)?.set(value),
            Family::Counter(vec) => {
                let counter = vec.get_metric_with_label_values(label_values)?;
                counter.reset();
                counter.inc_by(value);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.families.lock().is_empty()
    }

    /// Metric families recorded so far, sorted by name.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.families
            .lock()
            .values()
            .flat_map(Family::collect)
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn render(families: &[MetricFamily]) -> String {
    use prometheus::Encoder;

    let mut buffer = Vec::new();
    prometheus::TextEncoder::new()
        .encode(families, &mut buffer)
        .unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_gauge_and_counter_render() {
        let sink = MetricSink::new();
        sink.gauge("gs_memory_info", "memory", &["memtype"], &["shared"], 42.0)
            .unwrap();
        sink.counter("gs_xact_commit", "", &["datname"], &["orders"], 7.0)
            .unwrap();
        sink.counter("gs_xact_commit", "", &["datname"], &["orders"], 9.0)
            .unwrap();

        let text = render(&sink.gather());
        assert!(text.contains("gs_memory_info{memtype=\"shared\"} 42"));
        assert!(text.contains("# TYPE gs_xact_commit counter"));
        assert!(text.contains("gs_xact_commit{datname=\"orders\"} 9"));
    }

    #[test]
    fn test_type_conflict_and_label_mismatch_are_errors() {
        let sink = MetricSink::new();
        sink.gauge("gs_up", "up", &[], &[], 1.0).unwrap();
        assert!(sink.counter("gs_up", "up", &[], &[], 1.0).is_err());
        assert!(sink.gauge("gs_up", "up", &[], &["extra"], 1.0).is_err());
        assert!(sink.counter("gs_neg", "neg", &[], &[], -1.0).is_err());
        assert!(sink.counter("gs_null", "null", &[], &[], f64::NAN).is_ok());
    }

    #[test]
    fn test_concurrent_writers() {
        let sink = Arc::new(MetricSink::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    let label = i.to_string();
                    sink.gauge("gs_worker", "worker", &["id"], &[&label], i as f64)
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let text = render(&sink.gather());
        assert_eq!(text.lines().filter(|l| l.starts_with("gs_worker{")).count(), 8);
    }
}
