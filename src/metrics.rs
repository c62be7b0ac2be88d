use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;

/// Process-wide metric registry. Registration under an existing name adopts
/// the recorder that is already there instead of erroring.
static REGISTRY: Lazy<Mutex<HashMap<String, Arc<LatencySummary>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A labelled latency summary: per-label observation count and total.
pub struct LatencySummary {
    name: String,
    series: Mutex<HashMap<String, LatencyStat>>,
}

#[derive(Clone, Copy, Default)]
pub struct LatencyStat {
    pub count: u64,
    pub total: Duration,
}

impl LatencySummary {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observe(&self, label: &str, elapsed: Duration) {
        let mut series = self.series.lock().unwrap();
        let stat = series.entry(label.to_string()).or_default();
        stat.count += 1;
        stat.total += elapsed;
    }

    pub fn get(&self, label: &str) -> LatencyStat {
        let series = self.series.lock().unwrap();
        series.get(label).copied().unwrap_or_default()
    }
}

/// Register a latency summary, or adopt the existing one under that name.
pub fn register(name: &str) -> Arc<LatencySummary> {
    let mut registry = REGISTRY.lock().unwrap();
    registry
        .entry(name.to_string())
        .or_insert_with(|| {
            Arc::new(LatencySummary {
                name: name.to_string(),
                series: Mutex::new(HashMap::new()),
            })
        })
        .clone()
}

/// Latency until the first block of a UnixFS response, labelled by
/// namespace.
pub fn unixfs_get_latency() -> Arc<LatencySummary> {
    register("unixfs_get_latency_seconds")
}

#[cfg(test)]
mod tests {
    use super::{register, unixfs_get_latency};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_register_adopts_existing() {
        let a = register("test_adopt");
        let b = register("test_adopt");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_observe() {
        let m = unixfs_get_latency();
        let before = m.get("test-ns").count;
        m.observe("test-ns", Duration::from_millis(5));
        m.observe("test-ns", Duration::from_millis(7));
        let stat = m.get("test-ns");
        assert_eq!(stat.count, before + 2);
        assert!(stat.total >= Duration::from_millis(12));
    }
}
