use super::HealthReport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_KEY: &str = "health_report";

/// Reports keyed by the requested service filter, valid for a fixed TTL.
#[derive(Debug)]
pub struct ReportCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, HealthReport)>>,
}

impl ReportCache {
    /// A zero `ttl` disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key of a filter. Order and duplicates do not matter.
    pub fn key(filter: &[String]) -> String {
        if filter.is_empty() {
            return DEFAULT_KEY.to_string();
        }
        let mut names: Vec<&str> = filter.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        format!("{}::{}", DEFAULT_KEY, names.join("::"))
    }

    pub fn get(&self, filter: &[String]) -> Option<HealthReport> {
        if self.ttl.is_zero() {
            return None;
        }
        let key = Self::key(filter);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some((stored, report)) if stored.elapsed() < self.ttl => Some(report.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, filter: &[String], report: &HealthReport) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock();
        entries.retain(|_, (stored, _)| stored.elapsed() < self.ttl);
        entries.insert(Self::key(filter), (Instant::now(), report.clone()));
    }

    pub fn invalidate(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_key_ignores_order() {
        assert_eq!(ReportCache::key(&[]), "health_report");
        assert_eq!(
            ReportCache::key(&names(&["web", "api"])),
            ReportCache::key(&names(&["api", "web", "api"]))
        );
        assert_eq!(ReportCache::key(&names(&["api"])), "health_report::api");
    }

    #[test]
    fn test_hit_and_expiry() {
        let cache = ReportCache::new(Duration::from_millis(50));
        let report = HealthReport::new("proj", Vec::new());
        cache.put(&[], &report);
        assert!(cache.get(&[]).is_some());
        assert!(cache.get(&names(&["api"])).is_none());

        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get(&[]).is_none());
    }

    #[test]
    fn test_zero_ttl_disables() {
        let cache = ReportCache::new(Duration::ZERO);
        cache.put(&[], &HealthReport::new("proj", Vec::new()));
        assert!(cache.get(&[]).is_none());
    }

    #[test]
    fn test_invalidate() {
        let cache = ReportCache::new(Duration::from_secs(60));
        cache.put(&[], &HealthReport::new("proj", Vec::new()));
        cache.invalidate();
        assert!(cache.get(&[]).is_none());
    }
}
