//! The gateway facade: embedded mode with an external time source.
//!
//! A gateway lets a foreign simulation environment participate on the
//! bus without handing over its time loop. The driver calls `setup`
//! once, then repeatedly marshals its values into the gateway's signal
//! vectors, calls `sync(t)` with its own model time, and marshals the
//! updated values back out. When the driver's time falls behind the
//! bus, `sync` reports [`Error::GatewayBehind`] without doing any
//! work; the driver advances its own time and retries until the
//! condition clears.
//!
//! # Example
//!
//! ```no_run
//! use cosim::gateway::ModelGateway;
//!
//! # fn main() -> cosim::Result<()> {
//! let mut gw = ModelGateway::setup(
//!     "gateway",
//!     &["resources/gateway.yaml".into()],
//!     None,
//!     0.05,
//!     0.2,
//! )?;
//!
//! let mut model_time = 0.0;
//! let mut foo = 0.0;
//! while model_time < 0.2 {
//!     gw.set_scalar("scalar", "foo", foo)?;
//!     match gw.sync(model_time) {
//!         Err(cosim::Error::GatewayBehind) => {}
//!         other => {
//!             other?;
//!         }
//!     }
//!     foo = gw.scalar("scalar", "foo")? + 1.0;
//!     model_time += 0.05;
//! }
//! gw.exit()?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::model::FunctionChannel;
use crate::runtime::{RuntimeArgs, Simulation};
use crate::types::{SimTime, StepOutcome};

/// Gateway descriptor: owns the simulation it wraps.
///
/// A default-constructed (or already exited) gateway is inert; `exit`
/// on it is a no-op.
#[derive(Default)]
pub struct ModelGateway {
    sim: Option<Simulation>,
    instance_name: String,
    argv: Vec<String>,
}

impl ModelGateway {
    /// Configures and starts the gateway.
    ///
    /// Synthesises the runner-shaped invocation (`gateway --name=<n>
    /// <yaml files...>`), configures the simulation, starts it in
    /// async mode, and completes one bus exchange so the first step
    /// grant is established.
    pub fn setup(
        name: &str,
        yaml_files: &[PathBuf],
        log_level: Option<tracing::Level>,
        step_size: SimTime,
        end_time: SimTime,
    ) -> Result<Self> {
        if let Some(level) = log_level {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
        }

        let mut argv: Vec<String> = vec!["gateway".to_string(), format!("--name={name}")];
        argv.extend(yaml_files.iter().map(|p| p.display().to_string()));
        tracing::info!("gateway arguments:");
        for arg in &argv {
            tracing::info!("  {arg}");
        }

        let args = parse_gateway_args(&argv, step_size, end_time)?;
        let mut sim = Simulation::configure(args)?;
        sim.run_async()?;
        sim.sync()?;

        Ok(Self {
            sim: Some(sim),
            instance_name: name.to_string(),
            argv,
        })
    }

    /// Synchronises the gateway with the bus at the caller's time.
    ///
    /// If the caller is behind the bus, returns
    /// [`Error::GatewayBehind`] and the caller must advance and retry.
    /// Otherwise the coordinator steps until the bus is strictly past
    /// `model_time`; each iteration advances the bus by one step size.
    /// Coordinator results propagate verbatim, including end-of-run.
    pub fn sync(&mut self, model_time: SimTime) -> Result<StepOutcome> {
        let instance_name = self.instance_name.clone();
        let sim = self.sim_mut()?;

        let bus_time = sim
            .bus_time(&instance_name)
            .ok_or_else(|| Error::Config(format!("gateway instance {instance_name} not running")))?;
        if model_time < bus_time {
            return Err(Error::GatewayBehind);
        }

        loop {
            let bus_time = sim
                .bus_time(&instance_name)
                .ok_or_else(|| Error::Config("gateway adapter model lost".to_string()))?;
            if bus_time > model_time {
                return Ok(StepOutcome::Continue);
            }
            tracing::debug!(bus_time, caller_time = model_time, "gateway steps the model");
            if sim.sync()? == StepOutcome::Finished {
                return Ok(StepOutcome::Finished);
            }
        }
    }

    /// Terminates the gateway and releases everything it owns:
    /// simulation exit (destroying the instance), then the signal
    /// accessors, then the argv storage, and the document list last.
    ///
    /// Idempotent: a second call returns `Ok` without side effects.
    pub fn exit(&mut self) -> Result<()> {
        if let Some(mut sim) = self.sim.take() {
            sim.exit()?;
            drop(sim);
        }
        self.argv.clear();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.sim.is_some()
    }

    /// The simulation wrapped by this gateway.
    pub fn simulation(&self) -> Option<&Simulation> {
        self.sim.as_ref()
    }

    /// Current bus time of the gateway's adapter model.
    pub fn bus_time(&self) -> Option<SimTime> {
        self.sim.as_ref()?.bus_time(&self.instance_name)
    }

    /// Reads a scalar from the gateway's signal vector.
    pub fn scalar(&self, channel: &str, signal: &str) -> Result<f64> {
        let (fc, idx) = self.signal_ref(channel, signal)?;
        Ok(fc.scalar(idx))
    }

    /// Writes a scalar into the gateway's signal vector.
    pub fn set_scalar(&mut self, channel: &str, signal: &str, value: f64) -> Result<()> {
        let (fc, idx) = self.signal_ref_mut(channel, signal)?;
        fc.set_scalar(idx, value);
        Ok(())
    }

    /// Reads the binary payload of a signal.
    pub fn binary(&self, channel: &str, signal: &str) -> Result<&[u8]> {
        let (fc, idx) = self.signal_ref(channel, signal)?;
        Ok(fc.binary(idx))
    }

    /// Appends payload bytes to a signal.
    pub fn append_binary(&mut self, channel: &str, signal: &str, data: &[u8]) -> Result<()> {
        let (fc, idx) = self.signal_ref_mut(channel, signal)?;
        fc.append_binary(idx, data);
        Ok(())
    }

    /// Marks a signal's payload consumed.
    pub fn reset_binary(&mut self, channel: &str, signal: &str) -> Result<()> {
        let (fc, idx) = self.signal_ref_mut(channel, signal)?;
        fc.reset_binary(idx);
        Ok(())
    }

    fn sim_mut(&mut self) -> Result<&mut Simulation> {
        self.sim
            .as_mut()
            .ok_or_else(|| Error::Config("gateway is not set up".to_string()))
    }

    fn signal_ref(&self, channel: &str, signal: &str) -> Result<(&FunctionChannel, usize)> {
        let sim = self
            .sim
            .as_ref()
            .ok_or_else(|| Error::Config("gateway is not set up".to_string()))?;
        let fc = sim
            .function_channel(&self.instance_name, &self.instance_name, channel)
            .ok_or_else(|| Error::Config(format!("channel {channel} not bound")))?;
        let idx = fc
            .index_of(signal)
            .ok_or_else(|| Error::Config(format!("signal {signal} not on channel {channel}")))?;
        Ok((fc, idx))
    }

    fn signal_ref_mut(
        &mut self,
        channel: &str,
        signal: &str,
    ) -> Result<(&mut FunctionChannel, usize)> {
        let instance_name = self.instance_name.clone();
        let sim = self.sim_mut()?;
        let fc = sim
            .function_channel_mut(&instance_name, &instance_name, channel)
            .ok_or_else(|| Error::Config(format!("channel {channel} not bound")))?;
        let idx = fc
            .index_of(signal)
            .ok_or_else(|| Error::Config(format!("signal {signal} not on channel {channel}")))?;
        Ok((fc, idx))
    }
}

/// Parses the gateway's synthesised argv: the literal program name,
/// `--name=<instance>`, then YAML file paths.
fn parse_gateway_args(argv: &[String], step_size: SimTime, end_time: SimTime) -> Result<RuntimeArgs> {
    let mut name = None;
    let mut files = Vec::new();
    for arg in argv.iter().skip(1) {
        if let Some(n) = arg.strip_prefix("--name=") {
            name = Some(n.to_string());
        } else {
            files.push(PathBuf::from(arg));
        }
    }
    let name = name.ok_or_else(|| Error::Config("missing --name argument".to_string()))?;

    let mut args = RuntimeArgs::new(name, step_size, end_time);
    args.yaml_files = files;
    Ok(args)
}
