//! Process-wide metrics registry: request, job, cache, and system counters.
//!
//! Recording is lock-light (`std::sync::RwLock` held for map updates only,
//! never across an await) so it can be called from job handlers without
//! stalling the worker pool.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cache::CacheStats;
use crate::job::JobType;

#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointMetrics {
    pub count: u64,
    pub total_duration_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub status_codes: HashMap<u16, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobMetrics {
    pub processed: u64,
    pub failed: u64,
    pub total_processing_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub queue_size: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SystemMetrics {
    pub memory_bytes: u64,
    pub cpu_pct: f32,
    pub uptime_sec: u64,
}

/// Full snapshot returned by `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: HashMap<String, EndpointMetrics>,
    pub jobs: HashMap<String, JobMetrics>,
    pub caches: HashMap<String, CacheStats>,
    pub system: SystemMetrics,
}

#[derive(Default)]
pub struct MetricsRegistry {
    requests: RwLock<HashMap<String, EndpointMetrics>>,
    jobs: RwLock<HashMap<JobType, JobMetrics>>,
    system: RwLock<SystemMetrics>,
    started_at: Option<Instant>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            system: RwLock::new(SystemMetrics::default()),
            started_at: Some(Instant::now()),
        }
    }

    pub fn record_request(&self, endpoint: &str, status: u16, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let mut requests = self.requests.write().unwrap();
        let entry = requests.entry(endpoint.to_string()).or_default();
        if entry.count == 0 {
            entry.min_ms = ms;
        }
        entry.count += 1;
        entry.total_duration_ms += ms;
        entry.min_ms = entry.min_ms.min(ms);
        entry.max_ms = entry.max_ms.max(ms);
        *entry.status_codes.entry(status).or_default() += 1;
    }

    pub fn record_job(&self, job_type: JobType, success: bool, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let mut jobs = self.jobs.write().unwrap();
        let entry = jobs.entry(job_type).or_default();
        if entry.processed + entry.failed == 0 {
            entry.min_ms = ms;
        }
        if success {
            entry.processed += 1;
        } else {
            entry.failed += 1;
        }
        entry.total_processing_ms += ms;
        entry.min_ms = entry.min_ms.min(ms);
        entry.max_ms = entry.max_ms.max(ms);
    }

    /// Current ready-queue depth, refreshed by the dispatcher maintenance loop.
    pub fn set_queue_depth(&self, job_type: JobType, depth: u64) {
        let mut jobs = self.jobs.write().unwrap();
        jobs.entry(job_type).or_default().queue_size = depth;
    }

    /// System gauges, sampled every ~30 s by the server.
    pub fn set_system(&self, memory_bytes: u64, cpu_pct: f32) {
        let mut system = self.system.write().unwrap();
        system.memory_bytes = memory_bytes;
        system.cpu_pct = cpu_pct;
        system.uptime_sec = self
            .started_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or_default();
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn snapshot(&self, caches: HashMap<String, CacheStats>) -> MetricsSnapshot {
        let mut system = *self.system.read().unwrap();
        system.uptime_sec = self.uptime().as_secs();
        MetricsSnapshot {
            requests: self.requests.read().unwrap().clone(),
            jobs: self
                .jobs
                .read()
                .unwrap()
                .iter()
                .map(|(t, m)| (t.as_str().to_string(), m.clone()))
                .collect(),
            caches,
            system,
        }
    }

    /// Drop all recorded values. Test hook.
    pub fn reset(&self) {
        self.requests.write().unwrap().clear();
        self.jobs.write().unwrap().clear();
        *self.system.write().unwrap() = SystemMetrics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_metrics_aggregate_min_max_and_status_codes() {
        let registry = MetricsRegistry::new();
        registry.record_request("POST /instances", 201, Duration::from_millis(40));
        registry.record_request("POST /instances", 400, Duration::from_millis(10));
        registry.record_request("POST /instances", 201, Duration::from_millis(90));

        let snap = registry.snapshot(HashMap::new());
        let m = &snap.requests["POST /instances"];
        assert_eq!(m.count, 3);
        assert_eq!(m.min_ms, 10);
        assert_eq!(m.max_ms, 90);
        assert_eq!(m.total_duration_ms, 140);
        assert_eq!(m.status_codes[&201], 2);
        assert_eq!(m.status_codes[&400], 1);
    }

    #[test]
    fn job_metrics_split_processed_and_failed() {
        let registry = MetricsRegistry::new();
        registry.record_job(JobType::CreateInstance, true, Duration::from_millis(500));
        registry.record_job(JobType::CreateInstance, false, Duration::from_millis(100));
        registry.set_queue_depth(JobType::CreateInstance, 7);

        let snap = registry.snapshot(HashMap::new());
        let m = &snap.jobs["CREATE_INSTANCE"];
        assert_eq!(m.processed, 1);
        assert_eq!(m.failed, 1);
        assert_eq!(m.queue_size, 7);
        assert_eq!(m.min_ms, 100);
        assert_eq!(m.max_ms, 500);
    }

    #[test]
    fn reset_clears_everything() {
        let registry = MetricsRegistry::new();
        registry.record_request("GET /health", 200, Duration::from_millis(1));
        registry.reset();
        let snap = registry.snapshot(HashMap::new());
        assert!(snap.requests.is_empty());
        assert!(snap.jobs.is_empty());
    }
}
