//! Signals Module - Registry & Settlement
//!
//! - `registry`: signal creation, joinable/due queries, investments
//! - `settlement`: periodic exactly-once resolution of expired signals

pub mod registry;
pub mod settlement;

pub use registry::{
    Signal, SignalInvestment, SignalKind, SignalParams, SignalRegistry, StaticBatchSpec,
    MAX_WINDOW_SECS, STATIC_MAX_WORK_SECS, STATIC_SIGNAL_PREFIX,
};
pub use settlement::{
    CycleReport, FixedOutcome, OutcomeSource, RandomOutcome, SettlementConfig, SettlementReport,
    SettlementScheduler,
};
