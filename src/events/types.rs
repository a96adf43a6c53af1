//! Events emitted by the resilience layer for observability collaborators

use crate::cache::CacheTier;
use crate::degradation::{ServicePriority, SystemState};
use crate::lock::LockMode;
use crate::scheduler::TaskPriority;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every observable transition in the lock, cache, scheduler and degradation subsystems
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    LockAcquired {
        resource: String,
        mode: LockMode,
        instances: usize,
        validity_ms: u64,
    },
    LockRenewed {
        resource: String,
        instances: usize,
        validity_ms: u64,
    },
    LockLost {
        resource: String,
        instances: usize,
        required: usize,
    },
    LockReleased {
        resource: String,
        instances: usize,
    },

    CacheHit {
        namespace: String,
        key: String,
        tier: CacheTier,
        tombstone: bool,
    },
    CacheMiss {
        namespace: String,
        key: String,
    },

    TaskAdded {
        task_id: Uuid,
        task_type: String,
        priority: TaskPriority,
    },
    TaskRunning {
        task_id: Uuid,
        attempt: u32,
    },
    TaskCompleted {
        task_id: Uuid,
        attempt: u32,
    },
    TaskFailed {
        task_id: Uuid,
        attempt: u32,
        error: String,
    },
    TaskRetrying {
        task_id: Uuid,
        attempt: u32,
        delay_ms: u64,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    TaskTimedOut {
        task_id: Uuid,
        attempt: u32,
    },
    QueueHighWater {
        length: usize,
        capacity: usize,
    },

    StateTransition {
        from: SystemState,
        to: SystemState,
    },
    ServiceDegraded {
        service: String,
        priority: ServicePriority,
        manual: bool,
    },
    ServiceRestored {
        service: String,
        priority: ServicePriority,
        manual: bool,
    },

    BackendHealthChanged {
        backend: String,
        healthy: bool,
        error: Option<String>,
    },
    BackendUnavailable {
        backend: String,
        operation: String,
        reason: String,
    },
}

impl ResilienceEvent {
    /// Stable dotted name for logs and routing
    pub fn name(&self) -> &'static str {
        match self {
            Self::LockAcquired { .. } => "lock.acquired",
            Self::LockRenewed { .. } => "lock.renewed",
            Self::LockLost { .. } => "lock.lost",
            Self::LockReleased { .. } => "lock.released",
            Self::CacheHit { .. } => "cache.hit",
            Self::CacheMiss { .. } => "cache.miss",
            Self::TaskAdded { .. } => "task.added",
            Self::TaskRunning { .. } => "task.running",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskFailed { .. } => "task.failed",
            Self::TaskRetrying { .. } => "task.retrying",
            Self::TaskCancelled { .. } => "task.cancelled",
            Self::TaskTimedOut { .. } => "task.timed_out",
            Self::QueueHighWater { .. } => "task.queue_high_water",
            Self::StateTransition { .. } => "degradation.state_transition",
            Self::ServiceDegraded { .. } => "degradation.service_degraded",
            Self::ServiceRestored { .. } => "degradation.service_restored",
            Self::BackendHealthChanged { .. } => "backend.health_changed",
            Self::BackendUnavailable { .. } => "backend.unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_event_tag() {
        let event = ResilienceEvent::StateTransition {
            from: SystemState::Normal,
            to: SystemState::Overloaded,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "state_transition");
        assert_eq!(json["to"], "overloaded");
        assert_eq!(event.name(), "degradation.state_transition");
    }
}
