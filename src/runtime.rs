//! The contract between an execution context and the code it runs.

use std::time::Duration;

use crate::analysis::AudioFrame;
use crate::error::RuntimeFault;

/// A dynamic parameter that failed while code was already running. The
/// runtime has substituted a fallback and kept going.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamFault {
    pub message: String,
    pub param_name: Option<String>,
}

pub trait Runtime {
    /// Evaluate new code. On error the previously running code keeps running.
    fn evaluate(&mut self, code: &str) -> Result<(), RuntimeFault>;

    /// Clear accumulated counters (time, phases, delay lines).
    fn soft_reset(&mut self);

    fn on_audio(&mut self, _frame: &AudioFrame) {}

    /// Let wall-clock time pass for the running code.
    fn advance(&mut self, _elapsed: Duration) {}

    /// Faults raised since the last call.
    fn poll_faults(&mut self) -> Vec<ParamFault> {
        Vec::new()
    }
}
