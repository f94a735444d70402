//! Risk validation pipeline and its persisted circuit breakers.

mod checks;
mod manager;
mod state;
mod store;

pub use checks::{RiskCheckResult, RiskCheckType, RiskValidationResult};
pub use manager::RiskManager;
pub use state::{RiskState, LOSS_LATCH_ACTOR};
pub use store::{
    DailyStats, EmergencyStopState, JsonStateStore, StateError, StateStore, EMERGENCY_STOP_FILE,
};

#[cfg(test)]
pub(crate) use manager::tests as fixtures;
