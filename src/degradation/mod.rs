//! # Service Degradation
//!
//! A system-wide state machine (`Normal < UnderLoad < Overloaded < Critical`) driven by
//! CPU, memory, request latency and error-rate samples, plus a registry of services
//! with a priority and optional fallback. Under load, lower-priority services answer
//! from their fallback so the essential paths keep their capacity.

pub mod controller;
pub mod signals;
pub mod state;

pub use controller::{
    service_fn, DegradationController, FnServiceHandler, ServiceHandler, ServiceState,
    SystemStateSnapshot,
};
pub use signals::{LoadSample, LoadSampler, RequestMetrics, SystemLoadSampler};
pub use state::{
    classify, degraded_by_policy, ServicePriority, StateMachine, SystemState, Transition,
};
