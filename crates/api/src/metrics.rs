use query::Stage;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// How a query request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Answered,
    Insufficient,
    Escalated,
    Failed,
}

impl QueryOutcome {
    pub fn from_terminal(stage: Stage) -> Self {
        match stage {
            Stage::Done => QueryOutcome::Answered,
            Stage::Escalate => QueryOutcome::Escalated,
            _ => QueryOutcome::Insufficient,
        }
    }
}

pub struct Metrics {
    // Query counters
    total_queries: AtomicUsize,
    answered: AtomicUsize,
    insufficient: AtomicUsize,
    escalated: AtomicUsize,
    failed: AtomicUsize,
    guard_retries: AtomicUsize,

    // Timing (in microseconds)
    total_query_time_us: AtomicU64,
    total_ingest_time_us: AtomicU64,

    // Ingestion counts
    ingest_requests: AtomicUsize,
    total_chunks_processed: AtomicUsize,
    total_entities_extracted: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            total_queries: AtomicUsize::new(0),
            answered: AtomicUsize::new(0),
            insufficient: AtomicUsize::new(0),
            escalated: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            guard_retries: AtomicUsize::new(0),
            total_query_time_us: AtomicU64::new(0),
            total_ingest_time_us: AtomicU64::new(0),
            ingest_requests: AtomicUsize::new(0),
            total_chunks_processed: AtomicUsize::new(0),
            total_entities_extracted: AtomicUsize::new(0),
        })
    }

    pub fn record_query(&self, outcome: QueryOutcome, retries: u32, duration: Duration) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            QueryOutcome::Answered => &self.answered,
            QueryOutcome::Insufficient => &self.insufficient,
            QueryOutcome::Escalated => &self.escalated,
            QueryOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.guard_retries.fetch_add(retries as usize, Ordering::Relaxed);
        self.total_query_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_ingest(&self, duration: Duration, chunks: usize, entities: usize) {
        self.ingest_requests.fetch_add(1, Ordering::Relaxed);
        self.total_ingest_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.total_chunks_processed.fetch_add(chunks, Ordering::Relaxed);
        self.total_entities_extracted.fetch_add(entities, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            answered: self.answered.load(Ordering::Relaxed),
            insufficient: self.insufficient.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            guard_retries: self.guard_retries.load(Ordering::Relaxed),
            avg_query_time_ms: avg_time_ms(&self.total_query_time_us, &self.total_queries),
            ingest_requests: self.ingest_requests.load(Ordering::Relaxed),
            avg_ingest_time_ms: avg_time_ms(&self.total_ingest_time_us, &self.ingest_requests),
            total_chunks_processed: self.total_chunks_processed.load(Ordering::Relaxed),
            total_entities_extracted: self.total_entities_extracted.load(Ordering::Relaxed),
        }
    }
}

fn avg_time_ms(total_us: &AtomicU64, count: &AtomicUsize) -> f64 {
    let total = total_us.load(Ordering::Relaxed) as f64;
    let cnt = count.load(Ordering::Relaxed) as f64;
    if cnt > 0.0 {
        total / cnt / 1000.0 // Convert to ms
    } else {
        0.0
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_queries: usize,
    pub answered: usize,
    pub insufficient: usize,
    pub escalated: usize,
    pub failed: usize,
    pub guard_retries: usize,
    pub avg_query_time_ms: f64,
    pub ingest_requests: usize,
    pub avg_ingest_time_ms: f64,
    pub total_chunks_processed: usize,
    pub total_entities_extracted: usize,
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_terminal_stage() {
        assert_eq!(QueryOutcome::from_terminal(Stage::Done), QueryOutcome::Answered);
        assert_eq!(QueryOutcome::from_terminal(Stage::Escalate), QueryOutcome::Escalated);
        assert_eq!(QueryOutcome::from_terminal(Stage::Insufficient), QueryOutcome::Insufficient);
    }

    #[test]
    fn test_snapshot_counts_and_averages() {
        let metrics = Metrics::new();
        metrics.record_query(QueryOutcome::Answered, 0, Duration::from_millis(10));
        metrics.record_query(QueryOutcome::Insufficient, 2, Duration::from_millis(30));
        metrics.record_query(QueryOutcome::Failed, 0, Duration::from_millis(20));
        metrics.record_ingest(Duration::from_millis(100), 4, 7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_queries, 3);
        assert_eq!(snapshot.answered, 1);
        assert_eq!(snapshot.insufficient, 1);
        assert_eq!(snapshot.escalated, 0);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.guard_retries, 2);
        assert!((snapshot.avg_query_time_ms - 20.0).abs() < 1e-9);
        assert_eq!(snapshot.ingest_requests, 1);
        assert_eq!(snapshot.total_chunks_processed, 4);
        assert_eq!(snapshot.total_entities_extracted, 7);
    }

    #[test]
    fn test_empty_snapshot_has_zero_averages() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.avg_query_time_ms, 0.0);
        assert_eq!(snapshot.avg_ingest_time_ms, 0.0);
    }
}
