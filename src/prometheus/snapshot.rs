use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;

/// Serves the result of a finished scrape through a [`prometheus::Registry`].
///
/// The declared descriptors are the fixed scrape metadata families; the
/// leaf families are dynamic and are only known once the scrape ran.
pub struct ScrapeSnapshot {
    descs: Vec<Desc>,
    families: Vec<MetricFamily>,
}

impl ScrapeSnapshot {
    pub fn new(descs: Vec<Desc>, families: Vec<MetricFamily>) -> ScrapeSnapshot {
        ScrapeSnapshot { descs, families }
    }
}

impl Collector for ScrapeSnapshot {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.families.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::sink::render;
    use crate::collector::MetricSink;
    use prometheus::Registry;
    use std::collections::HashMap;

    #[test]
    fn test_snapshot_in_isolated_registry() {
        let sink = MetricSink::new();
        sink.gauge(
            "gs_scrape_collector_success",
            "success",
            &["collector"],
            &["memory"],
            1.0,
        )
        .unwrap();
        sink.gauge("gs_memory_info", "memory", &["memtype"], &["shared"], 3.0)
            .unwrap();
        let desc = Desc::new(
            "gs_scrape_collector_success".to_string(),
            "success".to_string(),
            vec!["collector".to_string()],
            HashMap::new(),
        )
        .unwrap();

        let registry = Registry::new();
        registry
            .register(Box::new(ScrapeSnapshot::new(vec![desc], sink.gather())))
            .unwrap();

        let text = render(&registry.gather());
        assert!(text.contains("gs_scrape_collector_success{collector=\"memory\"} 1"));
        assert!(text.contains("gs_memory_info{memtype=\"shared\"} 3"));
    }
}
