//! Smoothed, bounded telemetry per subject.
//!
//! Raw samples arrive as `stats`/`allStats` broadcasts. Each subject keeps an
//! exponential moving average of CPU and memory and a capped history of the
//! smoothed points for charting. Subjects that drop out of a full container
//! listing are forgotten.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub const DEFAULT_ALPHA: f64 = 0.2;
pub const DEFAULT_CAPACITY: usize = 60;

pub fn push_capped<T>(dq: &mut VecDeque<T>, v: T, cap: usize) {
    while dq.len() >= cap.max(1) {
        dq.pop_front();
    }
    dq.push_back(v);
}

/// One raw reading for a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSample {
    pub cpu_percent: f64,
    pub memory_bytes: f64,
    pub ip: Option<String>,
    pub timestamp: SystemTime,
}

impl StatsSample {
    pub fn new(cpu_percent: f64, memory_bytes: f64) -> Self {
        Self {
            cpu_percent,
            memory_bytes,
            ip: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.to_string());
        self
    }
}

/// One smoothed history point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsPoint {
    pub timestamp: SystemTime,
    pub cpu_percent: f64,
    pub memory_bytes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsHistory {
    pub points: VecDeque<StatsPoint>,
    /// Latest non-empty address, never smoothed.
    pub ip: Option<String>,
}

impl StatsHistory {
    pub fn latest(&self) -> Option<&StatsPoint> {
        self.points.back()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

struct SubjectState {
    cpu: f64,
    memory: f64,
    history: StatsHistory,
}

pub struct StatsAggregator {
    alpha: f64,
    capacity: usize,
    subjects: Mutex<HashMap<String, SubjectState>>,
    updates: broadcast::Sender<String>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA, DEFAULT_CAPACITY)
    }
}

impl StatsAggregator {
    /// `alpha` is clamped into `(0, 1]`; a capacity of 0 is treated as 1.
    pub fn new(alpha: f64, capacity: usize) -> Self {
        let alpha = if alpha.is_finite() && alpha > 0.0 {
            alpha.min(1.0)
        } else {
            DEFAULT_ALPHA
        };
        let (updates, _) = broadcast::channel(256);
        Self {
            alpha,
            capacity: capacity.max(1),
            subjects: Mutex::new(HashMap::new()),
            updates,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fold one raw sample into the subject's average and history.
    pub fn ingest(&self, subject_id: &str, sample: StatsSample) {
        {
            let mut subjects = self.subjects.lock();
            let alpha = self.alpha;
            let state = subjects
                .entry(subject_id.to_string())
                .and_modify(|s| {
                    s.cpu = s.cpu * (1.0 - alpha) + sample.cpu_percent * alpha;
                    s.memory = s.memory * (1.0 - alpha) + sample.memory_bytes * alpha;
                })
                .or_insert_with(|| SubjectState {
                    cpu: sample.cpu_percent,
                    memory: sample.memory_bytes,
                    history: StatsHistory {
                        points: VecDeque::with_capacity(self.capacity),
                        ip: None,
                    },
                });

            if let Some(ip) = sample.ip.filter(|ip| !ip.is_empty()) {
                state.history.ip = Some(ip);
            }
            let point = StatsPoint {
                timestamp: sample.timestamp,
                cpu_percent: state.cpu,
                memory_bytes: state.memory,
            };
            push_capped(&mut state.history.points, point, self.capacity);
        }
        // Ignore error - means no subscribers
        let _ = self.updates.send(subject_id.to_string());
    }

    /// Forget every subject not in `current`. Returns the ids removed.
    pub fn gc(&self, current: &HashSet<String>) -> Vec<String> {
        let mut subjects = self.subjects.lock();
        let stale: Vec<String> = subjects
            .keys()
            .filter(|id| !current.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            subjects.remove(id);
        }
        if !stale.is_empty() {
            tracing::debug!(removed = stale.len(), "stats gc");
        }
        stale
    }

    pub fn get(&self, subject_id: &str) -> Option<StatsHistory> {
        self.subjects
            .lock()
            .get(subject_id)
            .map(|s| s.history.clone())
    }

    pub fn subjects(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subjects.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Receive the subject id after every ingest.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }

    pub fn clear(&self) {
        self.subjects.lock().clear();
    }
}

// ── Payload parsing ────────────────────────────────────────────────

const ID_KEYS: &[&str] = &["containerId", "id", "Id", "ID"];
const CPU_KEYS: &[&str] = &["cpuPercent", "cpu", "CPUPerc", "cpu_percent"];
const MEMORY_KEYS: &[&str] = &["memoryBytes", "memory", "memUsage", "memory_bytes"];
const IP_KEYS: &[&str] = &["ip", "IPAddress", "ipAddress"];

/// Extract `(subject, sample)` pairs from a telemetry payload.
///
/// Accepts a single sample object, an array of them, or an object keyed by
/// subject id. Numbers may arrive as JSON numbers or strings like `"12.5%"`.
/// Entries without an id or a CPU reading are skipped.
pub fn parse_samples(data: &Value) -> Vec<(String, StatsSample)> {
    match data {
        Value::Array(items) => items.iter().filter_map(|v| parse_one(v, None)).collect(),
        Value::Object(map) if first_of(map, ID_KEYS).is_some() => {
            parse_one(data, None).into_iter().collect()
        }
        Value::Object(map) => map
            .iter()
            .filter_map(|(id, v)| parse_one(v, Some(id)))
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_one(value: &Value, key: Option<&str>) -> Option<(String, StatsSample)> {
    let obj = value.as_object()?;
    let id = first_of(obj, ID_KEYS)
        .and_then(Value::as_str)
        .or(key)?
        .to_string();
    let cpu = first_of(obj, CPU_KEYS).and_then(number)?;
    let memory = first_of(obj, MEMORY_KEYS).and_then(number).unwrap_or(0.0);
    let mut sample = StatsSample::new(cpu, memory);
    sample.ip = first_of(obj, IP_KEYS)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some((id, sample))
}

fn first_of<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

fn number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    };
    n.filter(|n: &f64| n.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn push_capped_evicts_oldest() {
        let mut dq = VecDeque::new();
        for i in 0..5 {
            push_capped(&mut dq, i, 3);
        }
        assert_eq!(dq, VecDeque::from(vec![2, 3, 4]));
    }

    #[test]
    fn first_sample_seeds_average() {
        let stats = StatsAggregator::default();
        stats.ingest("a", StatsSample::new(50.0, 1000.0));
        let point = *stats.get("a").unwrap().latest().unwrap();
        assert_eq!(point.cpu_percent, 50.0);
        assert_eq!(point.memory_bytes, 1000.0);
    }

    #[test]
    fn ema_update() {
        let stats = StatsAggregator::new(0.2, 60);
        stats.ingest("a", StatsSample::new(10.0, 100.0));
        stats.ingest("a", StatsSample::new(60.0, 600.0));
        let point = *stats.get("a").unwrap().latest().unwrap();
        assert!((point.cpu_percent - 20.0).abs() < 1e-9);
        assert!((point.memory_bytes - 200.0).abs() < 1e-9);
    }

    #[test]
    fn history_is_bounded() {
        let stats = StatsAggregator::new(0.2, 60);
        for i in 0..100 {
            stats.ingest("a", StatsSample::new(i as f64, 0.0));
        }
        assert_eq!(stats.get("a").unwrap().len(), 60);
    }

    #[test]
    fn ip_is_last_non_empty() {
        let stats = StatsAggregator::default();
        stats.ingest("a", StatsSample::new(1.0, 1.0).with_ip("10.0.0.2"));
        stats.ingest("a", StatsSample::new(1.0, 1.0));
        stats.ingest("a", StatsSample::new(1.0, 1.0).with_ip(""));
        assert_eq!(stats.get("a").unwrap().ip.as_deref(), Some("10.0.0.2"));
        stats.ingest("a", StatsSample::new(1.0, 1.0).with_ip("10.0.0.9"));
        assert_eq!(stats.get("a").unwrap().ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn gc_drops_missing_subjects() {
        let stats = StatsAggregator::default();
        for id in ["A", "B", "C"] {
            stats.ingest(id, StatsSample::new(5.0, 5.0));
        }
        let removed = stats.gc(&ids(&["A", "C"]));
        assert_eq!(removed, vec!["B".to_string()]);
        assert!(stats.get("B").is_none());
        assert_eq!(stats.get("A").unwrap().len(), 1);
        assert_eq!(stats.get("C").unwrap().len(), 1);

        // B comes back with a fresh average, not the old one.
        stats.ingest("B", StatsSample::new(90.0, 0.0));
        assert_eq!(stats.get("B").unwrap().latest().unwrap().cpu_percent, 90.0);
    }

    #[tokio::test]
    async fn subscribers_see_ingests() {
        let stats = StatsAggregator::default();
        let mut rx = stats.subscribe();
        stats.ingest("a", StatsSample::new(1.0, 1.0));
        assert_eq!(rx.recv().await.unwrap(), "a");
    }

    #[test]
    fn bad_alpha_falls_back() {
        assert_eq!(StatsAggregator::new(f64::NAN, 10).alpha(), DEFAULT_ALPHA);
        assert_eq!(StatsAggregator::new(0.0, 10).alpha(), DEFAULT_ALPHA);
        assert_eq!(StatsAggregator::new(3.0, 10).alpha(), 1.0);
        assert_eq!(StatsAggregator::new(0.5, 0).capacity(), 1);
    }

    #[test]
    fn parse_single_and_array() {
        let one = parse_samples(&json!({"containerId": "c1", "cpuPercent": 12.5, "memoryBytes": 2048, "ip": "172.17.0.2"}));
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].0, "c1");
        assert_eq!(one[0].1.cpu_percent, 12.5);
        assert_eq!(one[0].1.ip.as_deref(), Some("172.17.0.2"));

        let many = parse_samples(&json!([
            {"Id": "c1", "cpu": "3.5%", "memory": "100"},
            {"Id": "c2", "cpu": 1},
            {"Id": "c3"},
            "junk"
        ]));
        assert_eq!(many.len(), 2);
        assert_eq!(many[0].1.cpu_percent, 3.5);
        assert_eq!(many[0].1.memory_bytes, 100.0);
        assert_eq!(many[1].1.memory_bytes, 0.0);
    }

    #[test]
    fn parse_keyed_map() {
        let samples = parse_samples(&json!({
            "c1": {"cpuPercent": 1.0, "memoryBytes": 10},
            "c2": {"cpuPercent": 2.0, "memoryBytes": 20}
        }));
        let mut got: Vec<_> = samples.iter().map(|(id, _)| id.as_str()).collect();
        got.sort();
        assert_eq!(got, vec!["c1", "c2"]);
    }
}
