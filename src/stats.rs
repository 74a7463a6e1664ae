use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Sink for named counters kept by the server, registry and tunnels.
/// Injected where needed so the INFO command can render a snapshot without
/// the producers knowing about each other.
pub trait MetricSink: Send + Sync {
    fn add(&self, name: &'static str, delta: i64);
    fn snapshot(&self) -> Vec<(String, i64)>;
}

/// Adds to the sink when one is present.
pub fn add(sink: &Option<Arc<dyn MetricSink>>, name: &'static str, delta: i64) {
    if let Some(sink) = sink {
        sink.add(name, delta);
    }
}

/// Default [`MetricSink`]: a mutex-guarded map of counters.
#[derive(Default)]
pub struct StatsMap {
    values: Mutex<HashMap<&'static str, i64>>,
}

impl StatsMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricSink for StatsMap {
    fn add(&self, name: &'static str, delta: i64) {
        let mut values = self.values.lock().unwrap();
        *values.entry(name).or_insert(0) += delta;
    }

    fn snapshot(&self) -> Vec<(String, i64)> {
        let values = self.values.lock().unwrap();
        let mut out: Vec<(String, i64)> = values
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect();
        out.sort();
        out
    }
}
