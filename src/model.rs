//! Model functions, channel bindings, and the model plug-in interface.
//!
//! A model instance contributes one or more *model functions*: named
//! units that run during each step. Every function binds channels, and
//! each binding carries function-local signal buffers (scalar or
//! binary) that the marshaller exchanges with the adapter's signal
//! table around every bus exchange.
//!
//! Two generations of the plug-in contract exist and are unified here
//! behind [`ModelApi`]: the newer vtable interface (create/step/destroy,
//! used by dynlibs, built-in models, and the gateway) and the older
//! setup/exit interface whose setup registers its own functions with
//! per-function step handlers.

use std::collections::BTreeMap;

use crate::adapter::AdapterModel;
use crate::config::{self, ChannelNode};
use crate::error::{Error, Result};
use crate::types::{SimTime, StepOutcome, Uid};

/// Signal vector representation of a channel binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    Scalar,
    Binary,
}

/// Function-local buffers for one channel binding.
///
/// Exactly one of the scalar or binary vectors is present, and its
/// length equals the signal count. Binary entries keep their capacity
/// across ticks; an empty entry means "no new data".
#[derive(Debug)]
pub struct FunctionChannel {
    channel_name: String,
    signal_names: Vec<String>,
    scalars: Option<Vec<f64>>,
    binaries: Option<Vec<Vec<u8>>>,
}

impl FunctionChannel {
    pub(crate) fn new(
        channel_name: impl Into<String>,
        signal_names: Vec<String>,
        kind: SignalKind,
    ) -> Self {
        let count = signal_names.len();
        let (scalars, binaries) = match kind {
            SignalKind::Scalar => (Some(vec![0.0; count]), None),
            SignalKind::Binary => (None, Some(vec![Vec::new(); count])),
        };
        Self {
            channel_name: channel_name.into(),
            signal_names,
            scalars,
            binaries,
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn signal_names(&self) -> &[String] {
        &self.signal_names
    }

    pub fn signal_count(&self) -> usize {
        self.signal_names.len()
    }

    pub fn is_binary(&self) -> bool {
        self.binaries.is_some()
    }

    /// Binding index of a signal name.
    pub fn index_of(&self, signal: &str) -> Option<usize> {
        self.signal_names.iter().position(|s| s == signal)
    }

    /// Scalar value at a binding index (0.0 for binary bindings).
    pub fn scalar(&self, idx: usize) -> f64 {
        self.scalars.as_ref().map(|v| v[idx]).unwrap_or_default()
    }

    /// Writes a scalar value at a binding index.
    pub fn set_scalar(&mut self, idx: usize, value: f64) {
        if let Some(v) = self.scalars.as_mut() {
            v[idx] = value;
        }
    }

    pub fn scalars(&self) -> Option<&[f64]> {
        self.scalars.as_deref()
    }

    /// Binary payload at a binding index (empty for scalar bindings).
    pub fn binary(&self, idx: usize) -> &[u8] {
        self.binaries
            .as_ref()
            .map(|v| v[idx].as_slice())
            .unwrap_or_default()
    }

    /// Appends payload bytes at a binding index, growing the buffer.
    pub fn append_binary(&mut self, idx: usize, data: &[u8]) {
        if let Some(v) = self.binaries.as_mut() {
            v[idx].extend_from_slice(data);
        }
    }

    /// Marks the payload at a binding index consumed. Capacity is
    /// retained.
    pub fn reset_binary(&mut self, idx: usize) {
        if let Some(v) = self.binaries.as_mut() {
            v[idx].clear();
        }
    }

    /// Releases the payload storage at a binding index.
    pub fn release_binary(&mut self, idx: usize) {
        if let Some(v) = self.binaries.as_mut() {
            v[idx] = Vec::new();
        }
    }

    pub(crate) fn scalars_mut(&mut self) -> Option<&mut Vec<f64>> {
        self.scalars.as_mut()
    }

    pub(crate) fn binaries_mut(&mut self) -> Option<&mut Vec<Vec<u8>>> {
        self.binaries.as_mut()
    }
}

/// Mutable view over a function's channel bindings, handed to step
/// handlers.
pub struct ModelSignals<'a> {
    channels: &'a mut BTreeMap<String, FunctionChannel>,
}

impl<'a> ModelSignals<'a> {
    pub(crate) fn new(channels: &'a mut BTreeMap<String, FunctionChannel>) -> Self {
        Self { channels }
    }

    pub fn channel(&mut self, name: &str) -> Option<&mut FunctionChannel> {
        self.channels.get_mut(name)
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub(crate) fn channels_mut(&mut self) -> &mut BTreeMap<String, FunctionChannel> {
        self.channels
    }
}

/// A per-function step handler (older setup/exit interface).
pub type StepHandler = Box<
    dyn FnMut(&mut ModelSignals<'_>, &mut SimTime, SimTime) -> Result<StepOutcome> + Send,
>;

/// Setup entry point of the older interface; registers the model's
/// functions and channels through the context.
pub type SetupHandler = Box<dyn FnOnce(&mut ModelContext<'_>) -> Result<()> + Send>;

/// Optional exit entry point of the older interface.
pub type ExitHandler = Box<dyn FnMut() -> Result<()> + Send>;

/// A unit that runs during a step.
pub struct ModelFunction {
    pub name: String,
    pub step_size: SimTime,
    pub(crate) channels: BTreeMap<String, FunctionChannel>,
    /// Per-function handler; `None` dispatches to the instance's
    /// vtable-kind model.
    pub(crate) handler: Option<StepHandler>,
}

impl ModelFunction {
    pub fn channel(&self, name: &str) -> Option<&FunctionChannel> {
        self.channels.get(name)
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut FunctionChannel> {
        self.channels.get_mut(name)
    }

    pub fn channels(&self) -> impl Iterator<Item = &FunctionChannel> {
        self.channels.values()
    }
}

impl std::fmt::Debug for ModelFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelFunction")
            .field("name", &self.name)
            .field("step_size", &self.step_size)
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// The model plug-in interface (newer vtable generation).
///
/// `create` runs once after loading; it may register further functions
/// and channels through the context (the default function and the
/// YAML-declared channels are configured by the loader beforehand).
/// `step` advances the model toward `stop_time`.
pub trait Model: Send {
    fn create(&mut self, ctx: &mut ModelContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn step(
        &mut self,
        signals: &mut ModelSignals<'_>,
        model_time: &mut SimTime,
        stop_time: SimTime,
    ) -> Result<StepOutcome>;

    fn destroy(&mut self) {}
}

/// The loaded plug-in interface of an instance, one of the two
/// contract generations.
pub enum ModelApi {
    /// Newer interface: create/step/destroy behind a trait object
    /// (dynlib wrapper, registered built-in, or the gateway).
    Vtable(Box<dyn Model>),
    /// Older interface: a setup entry point that registers its own
    /// functions, plus an optional exit entry point.
    SetupExit {
        setup: Option<SetupHandler>,
        exit: Option<ExitHandler>,
    },
}

impl std::fmt::Debug for ModelApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelApi::Vtable(_) => f.write_str("ModelApi::Vtable"),
            ModelApi::SetupExit { .. } => f.write_str("ModelApi::SetupExit"),
        }
    }
}

/// Per-instance view of the plug-in: the loaded interface plus the
/// registered model functions.
#[derive(Debug, Default)]
pub struct ControllerModel {
    pub(crate) api: Option<ModelApi>,
    pub(crate) functions: BTreeMap<String, ModelFunction>,
}

impl ControllerModel {
    pub fn function(&self, name: &str) -> Option<&ModelFunction> {
        self.functions.get(name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut ModelFunction> {
        self.functions.get_mut(name)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

/// Registration context threaded through plug-in create/setup calls.
///
/// The plug-in contract passes no global state; everything a model
/// needs during registration is reachable from here.
pub struct ModelContext<'a> {
    instance_name: &'a str,
    uid: Uid,
    default_step_size: SimTime,
    functions: &'a mut BTreeMap<String, ModelFunction>,
    adapter_model: &'a mut AdapterModel,
    model_channels: &'a [ChannelNode],
    instance_channels: &'a [ChannelNode],
}

impl<'a> ModelContext<'a> {
    pub(crate) fn new(
        instance_name: &'a str,
        uid: Uid,
        default_step_size: SimTime,
        functions: &'a mut BTreeMap<String, ModelFunction>,
        adapter_model: &'a mut AdapterModel,
        model_channels: &'a [ChannelNode],
        instance_channels: &'a [ChannelNode],
    ) -> Self {
        Self {
            instance_name,
            uid,
            default_step_size,
            functions,
            adapter_model,
            model_channels,
            instance_channels,
        }
    }

    pub fn instance_name(&self) -> &str {
        self.instance_name
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The simulation step size, the default for registered functions.
    pub fn step_size(&self) -> SimTime {
        self.default_step_size
    }

    pub(crate) fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Channel bindings of the default function (named after the
    /// instance).
    pub(crate) fn default_function_channels_mut(
        &mut self,
    ) -> Option<&mut BTreeMap<String, FunctionChannel>> {
        let name = self.instance_name;
        self.functions.get_mut(name).map(|f| &mut f.channels)
    }

    /// Registers a model function.
    ///
    /// `handler` is the per-function step handler of the older
    /// interface; vtable-kind models pass `None` to dispatch through
    /// their own `step`.
    pub fn register_function(
        &mut self,
        name: &str,
        step_size: SimTime,
        handler: Option<StepHandler>,
    ) -> Result<()> {
        if self.functions.contains_key(name) {
            tracing::error!(function = name, "model function already registered");
            return Err(Error::AlreadyExists(format!("model function {name}")));
        }
        self.functions.insert(
            name.to_string(),
            ModelFunction {
                name: name.to_string(),
                step_size,
                channels: BTreeMap::new(),
                handler,
            },
        );
        Ok(())
    }

    /// Configures a channel binding on a registered function, taking
    /// the signal list from the model definition (falling back to the
    /// instance node).
    pub fn configure_channel(&mut self, function_name: &str, channel_name: &str) -> Result<()> {
        tracing::info!(channel = channel_name, "configure channel");
        let (resolved, signals, binary) = config::resolve_channel_signals(
            self.model_channels,
            self.instance_channels,
            channel_name,
        )?;
        let kind = if binary {
            SignalKind::Binary
        } else {
            SignalKind::Scalar
        };
        self.init_channel(function_name, &resolved, &signals, kind)
    }

    /// Binds a channel with an explicit signal-name vector, allocating
    /// adapter slots for any previously unseen signals.
    pub fn init_channel(
        &mut self,
        function_name: &str,
        channel_name: &str,
        signal_names: &[String],
        kind: SignalKind,
    ) -> Result<()> {
        let function = self.functions.get_mut(function_name).ok_or_else(|| {
            Error::Config(format!("model function {function_name} not registered"))
        })?;

        if function.channels.contains_key(channel_name) {
            tracing::info!(channel = channel_name, "previously configured channel");
            return Ok(());
        }

        tracing::info!(channel = channel_name, signals = signal_names.len(), "init channel");
        self.adapter_model.init_channel(channel_name, signal_names);

        function.channels.insert(
            channel_name.to_string(),
            FunctionChannel::new(channel_name, signal_names.to_vec(), kind),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_scalar_binding() {
        let mut fc = FunctionChannel::new("data", names(&["a", "b"]), SignalKind::Scalar);
        assert_eq!(fc.signal_count(), 2);
        assert!(!fc.is_binary());
        assert_eq!(fc.index_of("b"), Some(1));

        fc.set_scalar(1, 4.5);
        assert_eq!(fc.scalar(1), 4.5);
        assert_eq!(fc.scalar(0), 0.0);
        assert!(fc.binary(0).is_empty());
    }

    #[test]
    fn test_binary_binding() {
        let mut fc = FunctionChannel::new("raw", names(&["frame"]), SignalKind::Binary);
        assert!(fc.is_binary());

        fc.append_binary(0, &[1, 2]);
        fc.append_binary(0, &[3]);
        assert_eq!(fc.binary(0), &[1, 2, 3]);

        let cap = {
            let bins = fc.binaries_mut().unwrap();
            bins[0].capacity()
        };
        fc.reset_binary(0);
        assert!(fc.binary(0).is_empty());
        assert_eq!(fc.binaries_mut().unwrap()[0].capacity(), cap);

        fc.release_binary(0);
        assert_eq!(fc.binaries_mut().unwrap()[0].capacity(), 0);
    }

    #[test]
    fn test_register_function_duplicate() {
        let mut functions = BTreeMap::new();
        let mut am = AdapterModel::new(1);
        let mut ctx = ModelContext::new("inst", 1, 0.5, &mut functions, &mut am, &[], &[]);

        ctx.register_function("work", 0.5, None).unwrap();
        let err = ctx.register_function("work", 0.5, None).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_init_channel_allocates_adapter_slots() {
        let mut functions = BTreeMap::new();
        let mut am = AdapterModel::new(1);
        let mut ctx = ModelContext::new("inst", 1, 0.5, &mut functions, &mut am, &[], &[]);

        ctx.register_function("work", 0.5, None).unwrap();
        ctx.init_channel("work", "data", &names(&["x", "y"]), SignalKind::Scalar)
            .unwrap();

        assert_eq!(am.channel("data").unwrap().len(), 2);
        let fc = functions["work"].channel("data").unwrap();
        assert_eq!(fc.signal_count(), 2);
    }

    #[test]
    fn test_init_channel_requires_function() {
        let mut functions = BTreeMap::new();
        let mut am = AdapterModel::new(1);
        let mut ctx = ModelContext::new("inst", 1, 0.5, &mut functions, &mut am, &[], &[]);

        let err = ctx
            .init_channel("ghost", "data", &names(&["x"]), SignalKind::Scalar)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_model_signals_view() {
        let mut channels = BTreeMap::new();
        channels.insert(
            "data".to_string(),
            FunctionChannel::new("data", names(&["x"]), SignalKind::Scalar),
        );
        let mut signals = ModelSignals::new(&mut channels);

        assert!(signals.channel("missing").is_none());
        let ch = signals.channel("data").unwrap();
        ch.set_scalar(0, 2.0);
        assert_eq!(ch.scalar(0), 2.0);
    }
}
