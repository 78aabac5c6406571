//! Mock models for tests and benchmarks.

use crate::error::Result;
use crate::model::{Model, ModelSignals};
use crate::types::{SimTime, StepOutcome};

/// Increments one scalar signal by 1.0 on every step.
#[derive(Debug)]
pub struct CounterModel {
    channel: String,
    signal: String,
}

impl CounterModel {
    pub fn new(channel: impl Into<String>, signal: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            signal: signal.into(),
        }
    }
}

impl Model for CounterModel {
    fn step(
        &mut self,
        signals: &mut ModelSignals<'_>,
        _model_time: &mut SimTime,
        _stop_time: SimTime,
    ) -> Result<StepOutcome> {
        if let Some(ch) = signals.channel(&self.channel) {
            if let Some(idx) = ch.index_of(&self.signal) {
                ch.set_scalar(idx, ch.scalar(idx) + 1.0);
            }
        }
        Ok(StepOutcome::Continue)
    }
}

/// Echoes every received binary payload back onto the same signal on
/// the following step.
#[derive(Debug)]
pub struct BinaryEchoModel {
    channel: String,
}

impl BinaryEchoModel {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

impl Model for BinaryEchoModel {
    fn step(
        &mut self,
        signals: &mut ModelSignals<'_>,
        _model_time: &mut SimTime,
        _stop_time: SimTime,
    ) -> Result<StepOutcome> {
        if let Some(ch) = signals.channel(&self.channel) {
            for idx in 0..ch.signal_count() {
                if ch.binary(idx).is_empty() {
                    continue;
                }
                let payload = ch.binary(idx).to_vec();
                ch.reset_binary(idx);
                ch.append_binary(idx, &payload);
            }
        }
        Ok(StepOutcome::Continue)
    }
}
