//! The step coordinator: the per-tick state machine and the run loop.
//!
//! Every tick runs marshal-out, the bus ready/start exchange,
//! marshal-in, and the model functions, then advances model time to
//! the granted stop time. Within one tick all marshalling of a
//! direction completes before the opposite direction begins, so no
//! model observes another model's in-tick writes; they become visible
//! only after the bus exchange.
//!
//! The run loop checks the asynchronous stop flag at tick boundaries
//! only; a long step handler runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::adapter::Adapter;
use crate::error::{Error, Result};
use crate::marshal::{marshal, MarshalDir};
use crate::model::{ModelApi, ModelSignals};
use crate::runtime::ModelInstance;
use crate::types::{RunStatus, SimTime, StepOutcome};

/// Counters collected by the coordinator.
#[derive(Clone, Debug, Default)]
pub struct ControllerStats {
    /// Completed ticks.
    pub ticks: u64,
    /// Model function invocations.
    pub function_steps: u64,
    /// Bus timeouts surfaced to the caller.
    pub bus_timeouts: u64,
}

/// The process-wide orchestrator of the tick loop.
///
/// Owns the adapter; the stop flag is shared with the shutdown handle
/// and may be set from interrupt context.
#[derive(Debug)]
pub struct Controller {
    adapter: Adapter,
    stop: Arc<AtomicBool>,
    stats: ControllerStats,
}

impl Controller {
    pub fn new(adapter: Adapter, stop: Arc<AtomicBool>) -> Self {
        Self {
            adapter,
            stop,
            stats: ControllerStats::default(),
        }
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut Adapter {
        &mut self.adapter
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Forwards an interrupt to the adapter. Called from the shutdown
    /// path after the stop flag is set.
    pub fn interrupt(&mut self) {
        self.adapter.interrupt();
    }

    /// Brings the bus up: endpoint resources, model announcement, and
    /// signal registration. In async mode this is the last step before
    /// handing the time loop to the external driver.
    pub fn bus_ready(&mut self, step_size: SimTime, timeout: SimTime) -> Result<()> {
        self.adapter.start_endpoint()?;
        self.adapter.connect(step_size, timeout, 5)?;
        if self.stop_requested() {
            return Ok(());
        }
        self.adapter.register()
    }

    /// Executes one tick of the coordinator state machine.
    ///
    /// Returns `Finished` when a model requested exit or `end_time`
    /// was reached (a strictly positive end time is required, so zero
    /// or negative disables termination for open-ended runs). Bus
    /// timeouts propagate verbatim; step errors carry the offending
    /// model and function.
    pub fn step(
        &mut self,
        instances: &mut [ModelInstance],
        end_time: SimTime,
    ) -> Result<StepOutcome> {
        marshal(MarshalDir::ModelToAdapter, instances, &mut self.adapter)?;

        if let Err(err) = self.adapter.ready() {
            if matches!(err, Error::BusTimeout) {
                self.stats.bus_timeouts += 1;
                tracing::warn!("timeout waiting for bus grant");
            }
            return Err(err);
        }

        marshal(MarshalDir::AdapterToModel, instances, &mut self.adapter)?;

        let mut model_time = end_time;
        let mut finished = false;
        for inst in instances.iter_mut() {
            let (entry_time, stop_time) = {
                let am = self
                    .adapter
                    .model(inst.uid)
                    .ok_or_else(|| Error::Config(format!("no adapter model for uid {}", inst.uid)))?;
                (am.model_time, am.stop_time)
            };
            let outcome = step_instance(inst, entry_time, stop_time, &mut self.stats)?;

            let am = self.adapter.model_mut(inst.uid).expect("looked up above");
            am.model_time = am.stop_time;
            model_time = am.model_time;

            if outcome == StepOutcome::Finished {
                tracing::info!(instance = %inst.name, "model requested exit");
                finished = true;
                break;
            }
        }

        self.stats.ticks += 1;

        if finished || (end_time > 0.0 && end_time <= model_time) {
            return Ok(StepOutcome::Finished);
        }
        Ok(StepOutcome::Continue)
    }

    /// Runs ticks until end-of-run, an error, or a stop request.
    pub fn run(&mut self, instances: &mut [ModelInstance], end_time: SimTime) -> Result<RunStatus> {
        loop {
            if self.stop_requested() {
                tracing::info!("run loop cancelled by stop request");
                return Ok(RunStatus::Cancelled);
            }
            if self.step(instances, end_time)? == StepOutcome::Finished {
                return Ok(RunStatus::Finished);
            }
        }
    }

    /// Tears the instances down in reverse order, then the adapter.
    pub fn exit(&mut self, instances: &mut [ModelInstance]) -> Result<()> {
        for inst in instances.iter_mut().rev() {
            if let Some(api) = inst.controller_model.api.as_mut() {
                match api {
                    ModelApi::Vtable(model) => model.destroy(),
                    ModelApi::SetupExit { exit, .. } => {
                        if let Some(exit) = exit.as_mut() {
                            if let Err(err) = exit() {
                                tracing::error!(instance = %inst.name, %err, "model exit failed");
                            }
                        }
                    }
                }
            }
        }
        tracing::info!("controller exit");
        self.adapter.exit()
    }

    pub fn export_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "ticks": self.stats.ticks,
            "function_steps": self.stats.function_steps,
            "bus_timeouts": self.stats.bus_timeouts,
            "models": self.adapter.model_count(),
        })
    }
}

/// Invokes every function of one instance with `(model_time,
/// stop_time)`. Each handler gets its own copy of the entry time.
fn step_instance(
    inst: &mut ModelInstance,
    model_time: SimTime,
    stop_time: SimTime,
    stats: &mut ControllerStats,
) -> Result<StepOutcome> {
    let cm = &mut inst.controller_model;
    let api = &mut cm.api;
    for (fname, mf) in cm.functions.iter_mut() {
        let mut time = model_time;
        let mut signals = ModelSignals::new(&mut mf.channels);
        let result = match mf.handler.as_mut() {
            Some(handler) => handler(&mut signals, &mut time, stop_time),
            None => match api {
                Some(ModelApi::Vtable(model)) => model.step(&mut signals, &mut time, stop_time),
                _ => Ok(StepOutcome::Continue),
            },
        };
        stats.function_steps += 1;

        match result {
            Ok(StepOutcome::Continue) => {}
            Ok(StepOutcome::Finished) => return Ok(StepOutcome::Finished),
            Err(err) => {
                let rc = match &err {
                    Error::Step { rc, .. } => *rc,
                    _ => -1,
                };
                tracing::error!(model = %inst.name, function = %fname, rc, "step handler failed");
                return Err(Error::Step {
                    model: inst.name.clone(),
                    function: fname.clone(),
                    rc,
                });
            }
        }
    }
    Ok(StepOutcome::Continue)
}
