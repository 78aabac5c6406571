//! Simulation lifecycle: configure, run, sync, exit.
//!
//! The [`Simulation`] is the top-level container. `configure` parses
//! the descriptor documents and builds the ordered model instances;
//! `run`/`run_async` bring the endpoint and controller up and either
//! drive the tick loop or hand it to an external driver; `exit` tears
//! everything down in reverse order, releasing the document list only
//! after the adapter is gone.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::adapter::loopback::LoopbackAdapter;
use crate::adapter::Adapter;
use crate::config::{self, ChannelNode, Document, StackModel};
use crate::controller::Controller;
use crate::endpoint::{create_endpoint, RetryPolicy};
use crate::error::{Error, Result};
use crate::loader::{self, ModelRegistry};
use crate::model::{ControllerModel, FunctionChannel};
use crate::types::{RunStatus, SimTime, StepOutcome, Uid};

/// Default per-model timeout in seconds.
const MODEL_TIMEOUT: f64 = 60.0;

/// Arguments for configuring a simulation, the programmatic
/// equivalent of the runner's command line.
#[derive(Clone, Debug)]
pub struct RuntimeArgs {
    pub transport: String,
    pub uri: String,
    pub uid: Uid,
    pub timeout: f64,
    pub step_size: SimTime,
    pub end_time: SimTime,
    /// Instance names, semicolon separated.
    pub name: String,
    /// Development overrides for the model package path and dynlib
    /// file; these win over the model definition.
    pub path: Option<String>,
    pub file: Option<String>,
    pub yaml_files: Vec<PathBuf>,
    pub retry: RetryPolicy,
    /// In-process model implementations, consulted when a model
    /// definition names neither a dynlib nor a gateway runtime.
    pub registry: ModelRegistry,
}

impl RuntimeArgs {
    pub fn new(name: impl Into<String>, step_size: SimTime, end_time: SimTime) -> Self {
        Self {
            transport: "loopback".to_string(),
            uri: "loopback".to_string(),
            uid: 0,
            timeout: MODEL_TIMEOUT,
            step_size,
            end_time,
            name: name.into(),
            path: None,
            file: None,
            yaml_files: Vec::new(),
            retry: RetryPolicy::default(),
            registry: ModelRegistry::new(),
        }
    }

    pub fn with_yaml_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.yaml_files.push(path.into());
        self
    }
}

/// Resolved model definition of one instance.
#[derive(Clone, Debug, Default)]
pub struct ModelDefinition {
    /// Model name (matches `Model.metadata.name`).
    pub name: String,
    /// Model package path (where `model.yaml` lives).
    pub path: Option<String>,
    /// Dynlib file, relative to `path`.
    pub file: Option<String>,
    /// Combined path and file.
    pub full_path: Option<PathBuf>,
    /// The model is a gateway runtime (no dynlib).
    pub gateway: bool,
}

/// One running model within a simulation.
#[derive(Debug)]
pub struct ModelInstance {
    pub name: String,
    pub uid: Uid,
    pub model_definition: ModelDefinition,
    /// The instance node from the stack document.
    pub(crate) spec: StackModel,
    /// Channel declarations from the model definition document.
    pub(crate) model_channels: Vec<ChannelNode>,
    pub(crate) controller_model: ControllerModel,
}

impl ModelInstance {
    pub fn controller_model(&self) -> &ControllerModel {
        &self.controller_model
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str, uid: Uid) -> Self {
        Self {
            name: name.to_string(),
            uid,
            model_definition: ModelDefinition::default(),
            spec: StackModel::default(),
            model_channels: Vec::new(),
            controller_model: ControllerModel::default(),
        }
    }
}

/// Handle for requesting an interrupt-safe shutdown.
///
/// `request_stop` performs atomic stores only, so it may be called
/// from signal-handler context. The run loop observes the flag at
/// tick boundaries; the endpoint retry loop observes it between
/// attempts.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// The top-level simulation container.
#[derive(Debug)]
pub struct Simulation {
    transport: String,
    uri: String,
    uid: Uid,
    timeout: f64,
    step_size: SimTime,
    end_time: SimTime,
    retry: RetryPolicy,
    instances: Vec<ModelInstance>,
    registry: ModelRegistry,
    controller: Option<Controller>,
    stop: Arc<AtomicBool>,
    ep_interrupt: Arc<AtomicBool>,
    /// Parsed descriptor documents. Instances and the adapter resolve
    /// against this list, so it is released last.
    doc_list: Vec<Document>,
}

impl Simulation {
    /// Builds a simulation from parsed descriptors.
    ///
    /// For each semicolon-separated instance name, the matching stack
    /// node is located, its model definition resolved (loading the
    /// package's `model.yaml` into the document list), and the dynlib
    /// selected for the current platform. A missing dynlib is fatal
    /// unless the model is a gateway runtime.
    pub fn configure(args: RuntimeArgs) -> Result<Self> {
        let names: Vec<String> = args
            .name
            .split(';')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        tracing::debug!(count = names.len(), "parsed model names from {}", args.name);
        if names.is_empty() {
            tracing::error!("no model names parsed from arguments");
            return Err(Error::Config(format!(
                "no model names parsed from: {}",
                args.name
            )));
        }

        let timeout = if args.timeout <= 0.0 {
            MODEL_TIMEOUT
        } else {
            args.timeout
        };
        if args.step_size > args.end_time {
            return Err(Error::Config(format!(
                "step size {} is greater than end time {}",
                args.step_size, args.end_time
            )));
        }

        tracing::info!(
            step_size = args.step_size,
            end_time = args.end_time,
            timeout,
            "simulation parameters"
        );
        tracing::info!(transport = %args.transport, uri = %args.uri, "transport");
        tracing::info!(
            os = config::platform_os(),
            arch = config::platform_arch(),
            "platform"
        );

        let mut doc_list = Vec::new();
        for file in &args.yaml_files {
            doc_list.extend(config::load_file(file)?);
        }

        let mut instances = Vec::with_capacity(names.len());
        for name in &names {
            instances.push(configure_instance(name, &args, &mut doc_list)?);
        }

        Ok(Self {
            transport: args.transport,
            uri: args.uri,
            uid: args.uid,
            timeout,
            step_size: args.step_size,
            end_time: args.end_time,
            retry: args.retry,
            instances,
            registry: args.registry,
            controller: None,
            stop: Arc::new(AtomicBool::new(false)),
            ep_interrupt: Arc::new(AtomicBool::new(false)),
            doc_list,
        })
    }

    pub fn step_size(&self) -> SimTime {
        self.step_size
    }

    pub fn end_time(&self) -> SimTime {
        self.end_time
    }

    pub fn timeout(&self) -> f64 {
        self.timeout
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn instances(&self) -> &[ModelInstance] {
        &self.instances
    }

    pub fn instance(&self, name: &str) -> Option<&ModelInstance> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn instance_mut(&mut self, name: &str) -> Option<&mut ModelInstance> {
        self.instances.iter_mut().find(|i| i.name == name)
    }

    pub fn documents(&self) -> &[Document] {
        &self.doc_list
    }

    /// Registers an in-process model implementation for a model
    /// definition name.
    pub fn register_model<F>(&mut self, model_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn crate::model::Model> + Send + Sync + 'static,
    {
        self.registry.register(model_name, factory);
    }

    pub fn registry_mut(&mut self) -> &mut ModelRegistry {
        &mut self.registry
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            interrupt: Arc::clone(&self.ep_interrupt),
        }
    }

    /// Requests a stop and interrupts the adapter. The equivalent of
    /// the shutdown handle for callers that still own the simulation.
    pub fn shutdown(&mut self) {
        self.shutdown_handle().request_stop();
        if let Some(controller) = self.controller.as_mut() {
            controller.interrupt();
        }
    }

    pub fn controller(&self) -> Option<&Controller> {
        self.controller.as_ref()
    }

    /// The bus time of an instance's adapter model.
    pub fn bus_time(&self, instance_name: &str) -> Option<SimTime> {
        let uid = self.instance(instance_name)?.uid;
        let controller = self.controller.as_ref()?;
        Some(controller.adapter().model(uid)?.model_time)
    }

    /// A function's channel binding, for caller-side marshalling.
    pub fn function_channel(
        &self,
        instance: &str,
        function: &str,
        channel: &str,
    ) -> Option<&FunctionChannel> {
        self.instance(instance)?
            .controller_model
            .function(function)?
            .channel(channel)
    }

    pub fn function_channel_mut(
        &mut self,
        instance: &str,
        function: &str,
        channel: &str,
    ) -> Option<&mut FunctionChannel> {
        self.instance_mut(instance)?
            .controller_model
            .function_mut(function)?
            .channel_mut(channel)
    }

    /// Brings up the endpoint and controller and loads every model.
    fn start(&mut self) -> Result<()> {
        if self.controller.is_some() {
            return Ok(());
        }

        tracing::info!("create the endpoint ...");
        let endpoint = create_endpoint(
            &self.transport,
            &self.uri,
            self.uid,
            self.retry,
            &self.stop,
            &self.ep_interrupt,
        )?;
        if self.uid == 0 {
            self.uid = endpoint.uid();
        }
        tracing::debug!(sim_uid = self.uid, "simulation uid");

        for (index, inst) in self.instances.iter_mut().enumerate() {
            if inst.uid == 0 {
                inst.uid = (index as Uid) * 10000 + self.uid;
            }
            tracing::debug!(instance = %inst.name, uid = inst.uid, "model uid");
        }

        tracing::info!("create the controller ...");
        let mut adapter = Adapter::new(endpoint, Box::new(LoopbackAdapter::new()));
        for inst in &self.instances {
            adapter.add_model(inst.uid)?;
        }
        let mut controller = Controller::new(adapter, Arc::clone(&self.stop));

        tracing::info!("load and configure the simulation models ...");
        for inst in self.instances.iter_mut() {
            let api = loader::load_model(inst, &self.registry)?;
            inst.controller_model.api = Some(api);
            let am = controller
                .adapter_mut()
                .model_mut(inst.uid)
                .expect("adapter model added above");
            loader::create_model(inst, am, self.step_size)?;
        }

        self.controller = Some(controller);
        Ok(())
    }

    /// Runs the simulation synchronously until end-of-run, an error,
    /// or a stop request.
    pub fn run(&mut self) -> Result<RunStatus> {
        self.start()?;
        let controller = self.controller.as_mut().expect("started");
        controller.bus_ready(self.step_size, self.timeout)?;
        tracing::info!("run the simulation ...");
        controller.run(&mut self.instances, self.end_time)
    }

    /// Brings the simulation up in async mode: after the bus-ready
    /// handshake the external driver owns the time loop and advances
    /// it with [`Simulation::sync`].
    pub fn run_async(&mut self) -> Result<()> {
        self.start()?;
        tracing::info!("setup for async simulation run ...");
        let controller = self.controller.as_mut().expect("started");
        controller.bus_ready(self.step_size, self.timeout)
    }

    /// Executes one coordinator tick.
    pub fn sync(&mut self) -> Result<StepOutcome> {
        let controller = self
            .controller
            .as_mut()
            .ok_or_else(|| Error::Config("simulation is not running".to_string()))?;
        controller.step(&mut self.instances, self.end_time)
    }

    pub fn stats(&self) -> Option<&crate::controller::ControllerStats> {
        self.controller.as_ref().map(|c| c.stats())
    }

    pub fn export_stats(&self) -> serde_json::Value {
        match self.controller.as_ref() {
            Some(controller) => controller.export_stats(),
            None => serde_json::json!({}),
        }
    }

    /// Tears the simulation down: model exit/destroy in reverse
    /// instance order, then the adapter, then the instances. The
    /// document list stays with the simulation object and outlives
    /// all of them.
    pub fn exit(&mut self) -> Result<()> {
        if let Some(controller) = self.controller.as_mut() {
            controller.exit(&mut self.instances)?;
        }
        self.controller = None;
        self.instances.clear();
        Ok(())
    }
}

/// Resolves one instance from the stack and model documents.
fn configure_instance(
    name: &str,
    args: &RuntimeArgs,
    doc_list: &mut Vec<Document>,
) -> Result<ModelInstance> {
    let stack_model = config::find_stack_model(doc_list, name)
        .cloned()
        .ok_or_else(|| {
            tracing::error!(instance = name, "model instance not found in stack");
            Error::Config(format!("model instance {name} not found in stack"))
        })?;

    let model_name = stack_model.model.name.clone();
    if model_name.is_empty() {
        tracing::error!(instance = name, "model definition not found");
        return Err(Error::Config(format!(
            "model definition not found for instance {name}"
        )));
    }

    // Load the model package definition referenced by the instance.
    let mut def_path = stack_model.model.metadata.annotations.get("path").cloned();
    if let Some(pkg) = &def_path {
        let md_file = Path::new(pkg).join("model.yaml");
        doc_list.extend(config::load_file(&md_file)?);
    }

    let mut file = None;
    let mut gateway = false;
    let mut model_channels = Vec::new();
    if let Some(md) = config::find_model_doc(doc_list, &model_name) {
        if let Some(dl) = config::select_dynlib(&md.spec.runtime) {
            file = Some(dl.path.clone());
        }
        gateway = md.spec.runtime.gateway.is_some();
        model_channels = md.spec.channels.clone();
        if def_path.is_none() {
            def_path = md.metadata.annotations.get("path").cloned();
        }
    }

    // CLI overrides, development use case.
    if args.file.is_some() {
        file = args.file.clone();
    }
    if args.path.is_some() {
        def_path = args.path.clone();
    }

    let full_path = file.as_ref().map(|f| match &def_path {
        Some(p) => Path::new(p).join(f),
        None => PathBuf::from(f),
    });
    if full_path.is_none() && !gateway && !args.registry.contains(&model_name) {
        tracing::error!(instance = name, "model path not found in model definition");
        return Err(Error::Config(format!(
            "model path not found in model definition for {name}"
        )));
    }

    tracing::info!(
        instance = name,
        uid = stack_model.uid,
        model = %model_name,
        path = def_path.as_deref().unwrap_or("-"),
        file = file.as_deref().unwrap_or("-"),
        "model instance"
    );

    Ok(ModelInstance {
        name: name.to_string(),
        uid: stack_model.uid,
        model_definition: ModelDefinition {
            name: model_name,
            path: def_path,
            file,
            full_path,
            gateway,
        },
        spec: stack_model,
        model_channels,
        controller_model: ControllerModel::default(),
    })
}
