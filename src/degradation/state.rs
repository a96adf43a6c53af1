//! System load states, service priorities and the hysteresis state machine

use super::signals::LoadSample;
use crate::config::{DegradationConfig, SeverityThresholds};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System-wide load level, least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Normal,
    UnderLoad,
    Overloaded,
    Critical,
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::UnderLoad => "under_load",
            Self::Overloaded => "overloaded",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// How essential a service is; lower priorities are shed first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ServicePriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ServicePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Whether `state` sheds services of `priority`
///
/// | state      | degraded priorities     |
/// |------------|-------------------------|
/// | Normal     | none                    |
/// | UnderLoad  | Low                     |
/// | Overloaded | Low, Medium             |
/// | Critical   | Low, Medium, High       |
///
/// Critical services are never shed by policy.
pub fn degraded_by_policy(state: SystemState, priority: ServicePriority) -> bool {
    match state {
        SystemState::Normal => false,
        SystemState::UnderLoad => priority == ServicePriority::Low,
        SystemState::Overloaded => priority <= ServicePriority::Medium,
        SystemState::Critical => priority != ServicePriority::Critical,
    }
}

fn severity(value: f64, thresholds: &SeverityThresholds) -> SystemState {
    if value >= thresholds.critical {
        SystemState::Critical
    } else if value >= thresholds.overloaded {
        SystemState::Overloaded
    } else if value >= thresholds.under_load {
        SystemState::UnderLoad
    } else {
        SystemState::Normal
    }
}

/// State implied by a sample: the worst level any signal reaches
pub fn classify(sample: &LoadSample, config: &DegradationConfig) -> SystemState {
    [
        severity(sample.cpu_percent, &config.cpu_percent),
        severity(sample.memory_percent, &config.memory_percent),
        severity(sample.latency_ms, &config.latency_ms),
        severity(sample.error_rate_percent, &config.error_rate_percent),
    ]
    .into_iter()
    .max()
    .unwrap_or(SystemState::Normal)
}

/// A change of system state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SystemState,
    pub to: SystemState,
}

/// Hysteresis over classified samples
///
/// Escalation applies on the first worse sample. De-escalation waits for
/// `recovery_threshold` consecutive better samples and then moves to the worst state
/// seen during that streak, so a single quiet sample inside a noisy period cannot skip
/// levels.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: SystemState,
    last_transition_at: DateTime<Utc>,
    consecutive_healthy_checks: u32,
    recovery_target: Option<SystemState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: SystemState::Normal,
            last_transition_at: Utc::now(),
            consecutive_healthy_checks: 0,
            recovery_target: None,
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.last_transition_at
    }

    /// Better samples seen in a row while waiting to de-escalate
    pub fn consecutive_healthy_checks(&self) -> u32 {
        self.consecutive_healthy_checks
    }

    /// Feed one classified sample
    pub fn observe(
        &mut self,
        candidate: SystemState,
        recovery_threshold: u32,
    ) -> Option<Transition> {
        if candidate > self.state {
            return Some(self.transition(candidate));
        }
        if candidate == self.state {
            self.consecutive_healthy_checks = 0;
            self.recovery_target = None;
            return None;
        }

        self.consecutive_healthy_checks += 1;
        let target = self
            .recovery_target
            .map_or(candidate, |seen| seen.max(candidate));
        self.recovery_target = Some(target);

        if self.consecutive_healthy_checks >= recovery_threshold.max(1) {
            Some(self.transition(target))
        } else {
            None
        }
    }

    fn transition(&mut self, to: SystemState) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_transition_at = Utc::now();
        self.consecutive_healthy_checks = 0;
        self.recovery_target = None;
        Transition { from, to }
    }
}
