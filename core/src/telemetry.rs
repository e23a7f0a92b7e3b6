use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

pub mod events {
    pub const RETRIEVAL: &str = "retrieval";
    pub const RETRIEVAL_RERANK_BYPASSED: &str = "rerank_bypassed";
    pub const AG_METRICS: &str = "ag_metrics";
    pub const AG_UNSUPPORTED_ANSWER: &str = "ag_unsupported_answer";
    pub const EXTRACTION_FAILED_FALLBACK: &str = "extraction_failed_fallback";
    pub const CACHE_FAIL_OPEN: &str = "cache_fail_open";
    pub const INGESTION_COMPLETED: &str = "ingestion_completed";
    pub const INGESTION_FAILED: &str = "ingestion_failed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Succeeded,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub name: String,
    pub outcome: EventOutcome,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl Event {
    pub fn new(name: impl Into<String>, outcome: EventOutcome) -> Self {
        Self {
            sequence: 0,
            name: name.into(),
            outcome,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry sink lock poisoned")]
    LockPoisoned,
    #[error("telemetry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: Event) -> Result<(), TelemetryError>;
}

#[derive(Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<Event>>,
    sequence: AtomicU64,
}

impl InMemoryEventSink {
    pub fn events(&self) -> Result<Vec<Event>, TelemetryError> {
        let events = self
            .events
            .lock()
            .map_err(|_| TelemetryError::LockPoisoned)?;
        Ok(events.clone())
    }

    pub fn events_named(&self, name: &str) -> Result<Vec<Event>, TelemetryError> {
        Ok(self
            .events()?
            .into_iter()
            .filter(|event| event.name == name)
            .collect())
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, mut event: Event) -> Result<(), TelemetryError> {
        let next = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        event.sequence = next;
        let mut events = self
            .events
            .lock()
            .map_err(|_| TelemetryError::LockPoisoned)?;
        events.push(event);
        Ok(())
    }
}

/// Sink that forwards events into the tracing pipeline as structured lines.
#[derive(Default)]
pub struct TracingEventSink {
    sequence: AtomicU64,
}

impl EventSink for TracingEventSink {
    fn record(&self, mut event: Event) -> Result<(), TelemetryError> {
        let next = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        event.sequence = next;
        let fields = serde_json::to_string(&event.fields)?;
        match event.outcome {
            EventOutcome::Succeeded => {
                tracing::info!(event = %event.name, sequence = event.sequence, %fields)
            }
            EventOutcome::Degraded => {
                tracing::warn!(event = %event.name, sequence = event.sequence, %fields)
            }
            EventOutcome::Failed => {
                tracing::error!(event = %event.name, sequence = event.sequence, %fields)
            }
        }
        Ok(())
    }
}

/// Bounded rolling window of latency samples with percentile rollups.
/// Drives both the AG `p95` metric and the reranker circuit breaker.
pub struct LatencyWindow {
    state: Mutex<LatencyState>,
}

struct LatencyState {
    samples: VecDeque<u64>,
    max_samples: usize,
    total_count: u64,
}

impl LatencyWindow {
    pub fn new(max_samples: usize) -> Self {
        Self {
            state: Mutex::new(LatencyState {
                samples: VecDeque::new(),
                max_samples: max_samples.max(1),
                total_count: 0,
            }),
        }
    }

    pub fn record(&self, latency_ms: u64) {
        let mut state = self.state.lock().unwrap();
        state.total_count += 1;
        state.samples.push_back(latency_ms);
        if state.samples.len() > state.max_samples {
            state.samples.pop_front();
        }
    }

    pub fn percentile(&self, p: f32) -> u64 {
        let state = self.state.lock().unwrap();
        let mut sorted: Vec<u64> = state.samples.iter().copied().collect();
        sorted.sort_unstable();
        percentile(&sorted, p)
    }

    pub fn p95(&self) -> u64 {
        self.percentile(95.0)
    }

    pub fn count(&self) -> u64 {
        self.state.lock().unwrap().total_count
    }

    pub fn window_len(&self) -> usize {
        self.state.lock().unwrap().samples.len()
    }
}

fn percentile(sorted: &[u64], p: f32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p / 100.0) * (sorted.len() as f32)).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}
