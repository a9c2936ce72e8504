use std::collections::BTreeMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// Default histogram bucket boundaries, per spec.md §4.9.
pub const DEFAULT_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

struct HistogramState {
    buckets: Vec<f64>, // sorted ascending, +Inf implied
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramState {
    fn new(buckets: &[f64]) -> Self {
        let mut b = buckets.to_vec();
        b.sort_by(|a, c| a.partial_cmp(c).unwrap());
        let n = b.len();
        Self {
            buckets: b,
            bucket_counts: vec![0; n + 1], // last slot is +Inf
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (i, le) in self.buckets.iter().enumerate() {
            if value <= *le {
                self.bucket_counts[i] += 1;
            }
        }
        self.bucket_counts[self.buckets.len()] += 1; // +Inf always incremented
        self.sum += value;
        self.count += 1;
    }
}

enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Histogram(HistogramState),
}

struct MetricFamily {
    kind: MetricType,
    help: String,
    buckets_config: Vec<f64>,
    series: BTreeMap<Labels, MetricValue>,
}

/// In-process counter/gauge/histogram store with Prometheus-format export,
/// per spec.md §4.9. Label keys are sorted for both dedup and serialization
/// because `Labels = BTreeMap<String, String>`.
#[derive(Default)]
pub struct MetricsCollector {
    families: Mutex<BTreeMap<String, MetricFamily>>,
}

static GLOBAL: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::default);

/// Process-wide instance, per spec.md §4.9 / §9 ("a `global()` accessor").
pub fn global() -> &'static MetricsCollector {
    &GLOBAL
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_counter(&self, name: &str, help: &str, labels: Labels, by: f64) {
        let mut families = self.families.lock().unwrap();
        let family = families.entry(name.to_string()).or_insert_with(|| MetricFamily {
            kind: MetricType::Counter,
            help: help.to_string(),
            buckets_config: Vec::new(),
            series: BTreeMap::new(),
        });
        assert_type(family, MetricType::Counter, name);
        let entry = family.series.entry(labels).or_insert(MetricValue::Counter(0.0));
        if let MetricValue::Counter(v) = entry {
            *v += by;
        }
    }

    pub fn set_gauge(&self, name: &str, help: &str, labels: Labels, value: f64) {
        let mut families = self.families.lock().unwrap();
        let family = families.entry(name.to_string()).or_insert_with(|| MetricFamily {
            kind: MetricType::Gauge,
            help: help.to_string(),
            buckets_config: Vec::new(),
            series: BTreeMap::new(),
        });
        assert_type(family, MetricType::Gauge, name);
        family.series.insert(labels, MetricValue::Gauge(value));
    }

    pub fn observe_histogram(&self, name: &str, help: &str, labels: Labels, value: f64) {
        self.observe_histogram_with_buckets(name, help, labels, value, DEFAULT_BUCKETS)
    }

    pub fn observe_histogram_with_buckets(&self, name: &str, help: &str, labels: Labels, value: f64, buckets: &[f64]) {
        let mut families = self.families.lock().unwrap();
        let family = families.entry(name.to_string()).or_insert_with(|| MetricFamily {
            kind: MetricType::Histogram,
            help: help.to_string(),
            buckets_config: buckets.to_vec(),
            series: BTreeMap::new(),
        });
        assert_type(family, MetricType::Histogram, name);
        let entry = family
            .series
            .entry(labels)
            .or_insert_with(|| MetricValue::Histogram(HistogramState::new(&family.buckets_config)));
        if let MetricValue::Histogram(h) = entry {
            h.observe(value);
        }
    }

    pub fn reset(&self) {
        self.families.lock().unwrap().clear();
    }

    /// Prometheus exposition format; labels sorted lexicographically within
    /// each sample line (property tested in spec.md §8).
    pub fn export(&self) -> String {
        let families = self.families.lock().unwrap();
        let mut out = String::new();
        for (name, family) in families.iter() {
            out.push_str(&format!("# HELP {} {}\n", name, family.help));
            let type_str = match family.kind {
                MetricType::Counter => "counter",
                MetricType::Gauge => "gauge",
                MetricType::Histogram => "histogram",
            };
            out.push_str(&format!("# TYPE {} {}\n", name, type_str));
            for (labels, value) in family.series.iter() {
                let label_str = format_labels(labels);
                match value {
                    MetricValue::Counter(v) | MetricValue::Gauge(v) => {
                        out.push_str(&format!("{}{} {}\n", name, label_str, v));
                    }
                    MetricValue::Histogram(h) => {
                        for (i, le) in h.buckets.iter().enumerate() {
                            let bucket_labels = format_labels_with_extra(labels, "le", &le.to_string());
                            out.push_str(&format!("{}_bucket{} {}\n", name, bucket_labels, h.bucket_counts[i]));
                        }
                        let inf_labels = format_labels_with_extra(labels, "le", "+Inf");
                        out.push_str(&format!(
                            "{}_bucket{} {}\n",
                            name,
                            inf_labels,
                            h.bucket_counts[h.buckets.len()]
                        ));
                        out.push_str(&format!("{}_sum{} {}\n", name, label_str, h.sum));
                        out.push_str(&format!("{}_count{} {}\n", name, label_str, h.count));
                    }
                }
            }
        }
        out
    }
}

fn assert_type(family: &MetricFamily, expected: MetricType, name: &str) {
    assert!(
        family.kind == expected,
        "metric {} redefined with a different type (was {:?}, now {:?})",
        name,
        family.kind,
        expected
    );
}

fn format_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = labels.iter().map(|(k, v)| format!("{}=\"{}\"", k, v)).collect();
    format!("{{{}}}", parts.join(","))
}

fn format_labels_with_extra(labels: &Labels, extra_key: &str, extra_value: &str) -> String {
    let mut merged = labels.clone();
    merged.insert(extra_key.to_string(), extra_value.to_string());
    format_labels(&merged)
}

pub fn labels(pairs: impl IntoIterator<Item = (&'static str, String)>) -> Labels {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotonic_and_export_sorts_labels() {
        let m = MetricsCollector::new();
        m.inc_counter("requests_total", "total requests", labels([("z", "1".into()), ("a", "2".into())]), 1.0);
        m.inc_counter("requests_total", "total requests", labels([("z", "1".into()), ("a", "2".into())]), 2.0);
        let out = m.export();
        let line = out.lines().find(|l| l.starts_with("requests_total{")).unwrap();
        assert!(line.starts_with("requests_total{a=\"2\",z=\"1\"} 3"));
    }

    #[test]
    fn histogram_accumulates_buckets_with_inf_sentinel() {
        let m = MetricsCollector::new();
        m.observe_histogram("latency", "latency seconds", Labels::new(), 0.2);
        m.observe_histogram("latency", "latency seconds", Labels::new(), 20.0);
        let out = m.export();
        assert!(out.contains("latency_bucket{le=\"+Inf\"} 2"));
        assert!(out.contains("latency_count 2"));
    }

    #[test]
    #[should_panic]
    fn redefining_metric_type_panics() {
        let m = MetricsCollector::new();
        m.inc_counter("x", "x", Labels::new(), 1.0);
        m.set_gauge("x", "x", Labels::new(), 1.0);
    }
}
