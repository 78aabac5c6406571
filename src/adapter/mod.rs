//! The bus-facing side of one process.
//!
//! The [`Adapter`] owns one [`AdapterModel`] per model instance, keyed
//! by model UID in configured order, and drives the bus protocol
//! through an [`AdapterVtable`]: connect, register, and the per-tick
//! ready/start exchange that publishes local signal deltas and waits
//! for the next step grant. Concrete wire transports are external; the
//! in-process loopback variant lives in [`loopback`].

pub mod loopback;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::signal::Channel;
use crate::types::{SimTime, Uid};

/// Per-instance view of the bus: current and next step times plus the
/// per-channel signal table.
#[derive(Debug)]
pub struct AdapterModel {
    pub model_uid: Uid,

    /// Simulation time of the most recent grant.
    pub model_time: SimTime,

    /// Target time of the next step.
    pub stop_time: SimTime,

    channels: Vec<Channel>,
}

impl AdapterModel {
    pub fn new(model_uid: Uid) -> Self {
        Self {
            model_uid,
            model_time: 0.0,
            stop_time: 0.0,
            channels: Vec::new(),
        }
    }

    /// Initialises a channel, allocating slots for any previously
    /// unseen signals. Returns the channel for further configuration.
    pub fn init_channel(&mut self, name: &str, signal_names: &[String]) -> &mut Channel {
        let ch = self.channel_entry(name);
        ch.ensure_signals(signal_names);
        ch
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name() == name)
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.name() == name)
    }

    /// Returns the channel, creating it on first use.
    pub fn channel_entry(&mut self, name: &str) -> &mut Channel {
        if let Some(idx) = self.channels.iter().position(|c| c.name() == name) {
            return &mut self.channels[idx];
        }
        self.channels.push(Channel::new(name));
        self.channels.last_mut().expect("just pushed")
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [Channel] {
        &mut self.channels
    }
}

/// Bus protocol operations, implemented per transport family.
///
/// `ready` publishes a model's pending signal deltas; `start` blocks
/// until the bus grants the next step, updating the model's signal
/// table and `stop_time`. A timeout surfaces as
/// [`Error::BusTimeout`] and is forwarded verbatim to the caller.
pub trait AdapterVtable: Send + std::fmt::Debug {
    fn connect(&mut self, am: &mut AdapterModel, step_size: SimTime, timeout: SimTime)
        -> Result<()>;

    fn register(&mut self, am: &mut AdapterModel) -> Result<()>;

    fn ready(&mut self, am: &mut AdapterModel) -> Result<()>;

    fn start(&mut self, am: &mut AdapterModel) -> Result<()>;

    fn exit(&mut self, am: &mut AdapterModel) -> Result<()> {
        let _ = am;
        Ok(())
    }

    fn interrupt(&mut self) {}
}

/// The bus-facing side of one process: endpoint, protocol vtable, and
/// the adapter models in configured order.
#[derive(Debug)]
pub struct Adapter {
    endpoint: Box<dyn Endpoint>,
    vtable: Box<dyn AdapterVtable>,
    models: Vec<AdapterModel>,
    stop_request: bool,
}

impl Adapter {
    pub fn new(endpoint: Box<dyn Endpoint>, vtable: Box<dyn AdapterVtable>) -> Self {
        Self {
            endpoint,
            vtable,
            models: Vec::new(),
            stop_request: false,
        }
    }

    pub fn endpoint_uid(&self) -> Uid {
        self.endpoint.uid()
    }

    /// Adds the adapter model for a model UID.
    pub fn add_model(&mut self, model_uid: Uid) -> Result<&mut AdapterModel> {
        if self.models.iter().any(|m| m.model_uid == model_uid) {
            return Err(Error::AlreadyExists(format!("adapter model uid {model_uid}")));
        }
        self.models.push(AdapterModel::new(model_uid));
        Ok(self.models.last_mut().expect("just pushed"))
    }

    pub fn model(&self, model_uid: Uid) -> Option<&AdapterModel> {
        self.models.iter().find(|m| m.model_uid == model_uid)
    }

    pub fn model_mut(&mut self, model_uid: Uid) -> Option<&mut AdapterModel> {
        self.models.iter_mut().find(|m| m.model_uid == model_uid)
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// Starts the endpoint resources.
    pub fn start_endpoint(&mut self) -> Result<()> {
        self.endpoint.start()
    }

    /// Announces every model to the bus, retrying transient failures.
    pub fn connect(&mut self, step_size: SimTime, timeout: SimTime, retry_count: u32) -> Result<()> {
        let Self {
            vtable,
            models,
            stop_request,
            ..
        } = self;
        for am in models.iter_mut() {
            let mut last = Ok(());
            for _ in 0..retry_count.max(1) {
                tracing::debug!(model_uid = am.model_uid, step_size, "ModelRegister -->");
                last = vtable.connect(am, step_size, timeout);
                if last.is_ok() || *stop_request {
                    break;
                }
                tracing::debug!(model_uid = am.model_uid, "connect retry");
            }
            last?;
        }
        Ok(())
    }

    /// Registers every model's signals with the bus (UID assignment).
    pub fn register(&mut self) -> Result<()> {
        let Self { vtable, models, .. } = self;
        for am in models.iter_mut() {
            tracing::debug!(model_uid = am.model_uid, "SignalIndex -->");
            vtable.register(am)?;
        }
        Ok(())
    }

    /// One bus exchange: publish all models' deltas, then wait for the
    /// next step grant for each of them.
    ///
    /// Any protocol error is propagated verbatim; a timeout is the
    /// common recoverable case.
    pub fn ready(&mut self) -> Result<()> {
        let Self { vtable, models, .. } = self;
        for am in models.iter_mut() {
            tracing::trace!(model_uid = am.model_uid, model_time = am.model_time, "Notify/ModelReady -->");
            vtable.ready(am)?;
        }
        for am in models.iter_mut() {
            vtable.start(am)?;
            tracing::trace!(
                model_uid = am.model_uid,
                model_time = am.model_time,
                stop_time = am.stop_time,
                "Notify/ModelStart <--"
            );
        }
        Ok(())
    }

    /// Requests an interrupt of any blocking bus wait. Called from the
    /// shutdown path; must not allocate or block.
    pub fn interrupt(&mut self) {
        self.stop_request = true;
        self.endpoint.interrupt();
        self.vtable.interrupt();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_request
    }

    /// Sends the exit notification for every model and disconnects the
    /// endpoint.
    pub fn exit(&mut self) -> Result<()> {
        let Self {
            vtable,
            models,
            endpoint,
            ..
        } = self;
        for am in models.iter_mut() {
            tracing::debug!(model_uid = am.model_uid, "ModelExit -->");
            vtable.exit(am)?;
        }
        endpoint.disconnect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::LoopbackEndpoint;
    use super::loopback::LoopbackAdapter;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_adapter_model_channels() {
        let mut am = AdapterModel::new(10042);
        am.init_channel("data", &names(&["x", "y"]));
        am.init_channel("data", &names(&["y", "z"]));

        assert_eq!(am.channels().len(), 1);
        assert_eq!(am.channel("data").unwrap().len(), 3);
        assert!(am.channel("other").is_none());
    }

    #[test]
    fn test_adapter_model_lookup_by_uid() {
        let endpoint = Box::new(LoopbackEndpoint::with_uid(42));
        let mut adapter = Adapter::new(endpoint, Box::new(LoopbackAdapter::new()));

        adapter.add_model(42).unwrap();
        adapter.add_model(10042).unwrap();
        assert!(adapter.add_model(42).is_err());

        assert_eq!(adapter.model_count(), 2);
        assert_eq!(adapter.model(10042).unwrap().model_uid, 10042);
        assert!(adapter.model(7).is_none());
    }

    #[test]
    fn test_interrupt_sets_stop() {
        let endpoint = Box::new(LoopbackEndpoint::with_uid(42));
        let mut adapter = Adapter::new(endpoint, Box::new(LoopbackAdapter::new()));

        assert!(!adapter.stop_requested());
        adapter.interrupt();
        assert!(adapter.stop_requested());
    }
}
