//! Workflow and capability usage metrics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::instance::WorkflowStatus;

/// Usage statistics of one capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityUsage {
    /// Number of invocations.
    pub calls: u64,
    /// Invocations that returned a result.
    pub successes: u64,
    /// Invocations that failed, timed out, or panicked.
    pub failures: u64,
    /// Running average latency in milliseconds.
    pub average_latency_ms: f64,
}

impl CapabilityUsage {
    fn record(&mut self, success: bool, latency: Duration) {
        self.calls += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / self.calls as f64;
    }

    /// Share of successful calls, 0 to 1.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 { 0.0 } else { self.successes as f64 / self.calls as f64 }
    }
}

/// Point-in-time copy of the orchestrator counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Instances created.
    pub total_workflows: u64,
    /// Instances that completed.
    pub successful_workflows: u64,
    /// Instances that failed.
    pub failed_workflows: u64,
    /// Instances that were cancelled.
    pub cancelled_workflows: u64,
    /// Running average of start-to-finish time of finished workflows, in milliseconds.
    pub average_execution_ms: f64,
    /// Per-capability usage keyed by capability name.
    pub capability_usage: BTreeMap<String, CapabilityUsage>,
}

/// Shared metrics recorder.
#[derive(Debug, Default)]
pub struct WorkflowMetrics {
    inner: Mutex<MetricsSnapshot>,
    timed_workflows: Mutex<u64>,
}

impl WorkflowMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a newly created instance.
    pub async fn record_created(&self) {
        self.inner.lock().await.total_workflows += 1;
    }

    /// Counts a finished instance and folds its execution time into the average.
    pub async fn record_finished(&self, status: WorkflowStatus, execution_time: Option<Duration>) {
        let mut inner = self.inner.lock().await;
        match status {
            WorkflowStatus::Completed => inner.successful_workflows += 1,
            WorkflowStatus::Failed => inner.failed_workflows += 1,
            WorkflowStatus::Cancelled => inner.cancelled_workflows += 1,
            _ => return,
        }
        if let Some(elapsed) = execution_time {
            let mut timed = self.timed_workflows.lock().await;
            *timed += 1;
            let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
            inner.average_execution_ms += (elapsed_ms - inner.average_execution_ms) / *timed as f64;
        }
    }

    /// Records one capability invocation.
    pub async fn record_call(&self, capability: &str, success: bool, latency: Duration) {
        self.inner
            .lock()
            .await
            .capability_usage
            .entry(capability.to_string())
            .or_default()
            .record(success, latency);
    }

    /// Returns a copy of the current counters.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_workflow_counters() {
        let metrics = WorkflowMetrics::new();
        for _ in 0..4 {
            metrics.record_created().await;
        }
        metrics.record_finished(WorkflowStatus::Completed, Some(Duration::from_millis(100))).await;
        metrics.record_finished(WorkflowStatus::Completed, Some(Duration::from_millis(300))).await;
        metrics.record_finished(WorkflowStatus::Failed, None).await;
        metrics.record_finished(WorkflowStatus::Cancelled, None).await;
        metrics.record_finished(WorkflowStatus::Running, Some(Duration::from_secs(9))).await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.total_workflows, 4);
        assert_eq!(snapshot.successful_workflows, 2);
        assert_eq!(snapshot.failed_workflows, 1);
        assert_eq!(snapshot.cancelled_workflows, 1);
        assert!((snapshot.average_execution_ms - 200.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_capability_usage_average() {
        let metrics = WorkflowMetrics::new();
        metrics.record_call("chapter_writer", true, Duration::from_millis(10)).await;
        metrics.record_call("chapter_writer", false, Duration::from_millis(30)).await;
        metrics.record_call("tag_selector", true, Duration::from_millis(5)).await;

        let snapshot = metrics.snapshot().await;
        let writer = &snapshot.capability_usage["chapter_writer"];
        assert_eq!(writer.calls, 2);
        assert_eq!(writer.successes, 1);
        assert_eq!(writer.failures, 1);
        assert!((writer.average_latency_ms - 20.0).abs() < 1e-6);
        assert!((writer.success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.capability_usage["tag_selector"].calls, 1);
    }
}
