//! Shared test capabilities for orchestrator integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use quill_abstraction::{Capability, CapabilityError, Parameters};
use quill_orchestrator::{Orchestrator, OrchestratorConfig, RetryPolicy, SchedulerConfig};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Orchestrator with fast retries suitable for tests.
pub fn orchestrator(max_concurrent_tasks: usize, max_retries: u32, task_timeout: Duration) -> Orchestrator {
    Orchestrator::new(OrchestratorConfig {
        scheduler: SchedulerConfig {
            max_concurrent_tasks,
            task_timeout,
            poll_interval: Duration::from_millis(100),
        },
        retry: RetryPolicy::with_config(max_retries, Duration::from_millis(10), true),
    })
}

pub fn default_orchestrator() -> Orchestrator {
    orchestrator(4, 3, Duration::from_secs(5))
}

/// Log of every invocation, shared by all capabilities of a test.
#[derive(Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<(String, String, Parameters)>>>,
}

impl CallLog {
    pub fn record(&self, step_id: &str, parameters: &Parameters) {
        let workflow_id = parameters.get("workflow_id").and_then(Value::as_str).unwrap_or_default().to_string();
        self.entries.lock().unwrap().push((workflow_id, step_id.to_string(), parameters.clone()));
    }

    /// Step ids invoked for a workflow, in invocation order.
    pub fn steps_for(&self, workflow_id: &str) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(wf, _, _)| wf == workflow_id)
            .map(|(_, step, _)| step.clone())
            .collect()
    }

    /// Parameters of the first invocation of a step.
    pub fn parameters_of(&self, workflow_id: &str, step_id: &str) -> Option<Parameters> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|(wf, step, _)| wf == workflow_id && step == step_id)
            .map(|(_, _, params)| params.clone())
    }

    pub fn count_step(&self, step_id: &str) -> usize {
        self.entries.lock().unwrap().iter().filter(|(_, step, _)| step == step_id).count()
    }
}

/// Succeeds with `{"step", "project"}` after an optional delay.
pub struct Echo {
    pub log: CallLog,
    pub delay: Duration,
}

impl Echo {
    pub fn new(log: &CallLog) -> Arc<Self> {
        Arc::new(Self { log: log.clone(), delay: Duration::ZERO })
    }

    pub fn slow(log: &CallLog, delay: Duration) -> Arc<Self> {
        Arc::new(Self { log: log.clone(), delay })
    }
}

#[async_trait]
impl Capability for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, step_id: &str, parameters: &Parameters) -> Result<Value, CapabilityError> {
        self.log.record(step_id, parameters);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(json!({
            "step": step_id,
            "project": parameters.get("project_id").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// Fails the first `failures` calls, then succeeds.
pub struct Flaky {
    pub failures: u32,
    pub calls: AtomicU32,
}

impl Flaky {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self { failures, calls: AtomicU32::new(0) })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, step_id: &str, _parameters: &Parameters) -> Result<Value, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(CapabilityError::Execution(format!("{step_id} attempt {call} failed")));
        }
        Ok(json!({"step": step_id, "calls": call}))
    }
}

/// Fails while `failing` is set.
pub struct Switch {
    pub failing: AtomicBool,
    pub calls: AtomicU32,
}

impl Switch {
    pub fn new(failing: bool) -> Arc<Self> {
        Arc::new(Self { failing: AtomicBool::new(failing), calls: AtomicU32::new(0) })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for Switch {
    fn name(&self) -> &str {
        "switch"
    }

    async fn execute(&self, step_id: &str, _parameters: &Parameters) -> Result<Value, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CapabilityError::Execution(format!("{step_id} is switched off")));
        }
        Ok(json!({"step": step_id}))
    }
}

/// Panics on every call.
pub struct Panicking;

#[async_trait]
impl Capability for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn execute(&self, _step_id: &str, _parameters: &Parameters) -> Result<Value, CapabilityError> {
        panic!("worker exploded");
    }
}

/// Sleeps while tracking how many invocations overlap, globally and per workflow.
#[derive(Default)]
pub struct ConcurrencyProbe {
    pub delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    per_workflow: Mutex<HashMap<String, (usize, usize)>>,
}

impl ConcurrencyProbe {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, ..Self::default() })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Highest overlap observed within any single workflow.
    pub fn peak_per_workflow(&self) -> usize {
        self.per_workflow.lock().unwrap().values().map(|(_, peak)| *peak).max().unwrap_or(0)
    }
}

#[async_trait]
impl Capability for ConcurrencyProbe {
    fn name(&self) -> &str {
        "probe"
    }

    async fn execute(&self, step_id: &str, parameters: &Parameters) -> Result<Value, CapabilityError> {
        let workflow_id = parameters.get("workflow_id").and_then(Value::as_str).unwrap_or_default().to_string();

        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        {
            let mut per = self.per_workflow.lock().unwrap();
            let entry = per.entry(workflow_id.clone()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }

        tokio::time::sleep(self.delay).await;

        self.current.fetch_sub(1, Ordering::SeqCst);
        if let Some(entry) = self.per_workflow.lock().unwrap().get_mut(&workflow_id) {
            entry.0 -= 1;
        }
        Ok(json!({"step": step_id}))
    }
}

pub fn tags(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}
