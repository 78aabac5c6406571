//! The built-in gateway model.
//!
//! A gateway has no local physics; the external driver is the
//! physics. Its step simply accepts the granted window by advancing
//! the reported model time to the stop time.

use crate::error::Result;
use crate::model::{Model, ModelSignals};
use crate::types::{SimTime, StepOutcome};

#[derive(Debug, Default)]
pub struct GatewayModel;

impl GatewayModel {
    pub fn new() -> Self {
        Self
    }
}

impl Model for GatewayModel {
    fn step(
        &mut self,
        _signals: &mut ModelSignals<'_>,
        model_time: &mut SimTime,
        stop_time: SimTime,
    ) -> Result<StepOutcome> {
        *model_time = stop_time;
        Ok(StepOutcome::Continue)
    }
}
