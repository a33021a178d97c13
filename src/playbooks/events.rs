//! Real-time execution events for dashboards.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::{ExecutionStatus, StepId, StepStatus};

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The execution entered a new lifecycle state
    ExecutionStatus { status: ExecutionStatus },

    /// A step was handed to a worker
    StepDispatched,

    /// A step's final result was applied
    StepFinished { status: StepStatus, attempts: u32 },
}

impl EventKind {
    /// Wire name, matching the serialized `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ExecutionStatus { .. } => "execution_status",
            EventKind::StepDispatched => "step_dispatched",
            EventKind::StepFinished { .. } => "step_finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,

    #[serde(flatten)]
    pub kind: EventKind,

    /// Result sequence for `step_finished`, 0 otherwise
    #[serde(default)]
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn execution(execution_id: Uuid, status: ExecutionStatus) -> Self {
        Self {
            execution_id,
            step_id: None,
            kind: EventKind::ExecutionStatus { status },
            sequence: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn dispatched(execution_id: Uuid, step_id: &str) -> Self {
        Self {
            execution_id,
            step_id: Some(step_id.to_string()),
            kind: EventKind::StepDispatched,
            sequence: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn finished(
        execution_id: Uuid,
        step_id: &str,
        status: StepStatus,
        attempts: u32,
        sequence: u64,
    ) -> Self {
        Self {
            execution_id,
            step_id: Some(step_id.to_string()),
            kind: EventKind::StepFinished { status, attempts },
            sequence,
            timestamp: Utc::now(),
        }
    }
}

/// Counters over published events, reported by the health endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub published: u64,
    /// Events published while nobody was subscribed
    pub undelivered: u64,
    pub subscribers: usize,
    pub capacity: usize,
}

/// Fan-out of execution events to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events rather than stalling coordinators.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
    stats: Arc<RwLock<EventStats>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            stats: Arc::new(RwLock::new(EventStats::default())),
            capacity,
        }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: ExecutionEvent) {
        debug!(
            execution_id = %event.execution_id,
            step_id = ?event.step_id,
            kind = ?event.kind,
            "Publishing execution event"
        );

        let delivered = self.tx.send(event).is_ok();
        let mut stats = self.stats.write();
        stats.published += 1;
        if !delivered {
            stats.undelivered += 1;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            subscribers: self.tx.receiver_count(),
            capacity: self.capacity,
            ..self.stats.read().clone()
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
