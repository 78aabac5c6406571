//! Plug-in loading.
//!
//! A model instance gets its plug-in interface from one of three
//! sources, resolved in order:
//!
//! 1. **Dynlib** — the model definition names a shared library; the
//!    entry points are resolved by their exact symbol names
//!    (`model_create`, `model_step`, `model_destroy`, with the older
//!    `model_setup`/`model_exit` generation as fallback).
//! 2. **Gateway** — the model definition carries the
//!    `spec.runtime.gateway` key and no dynlib; the built-in gateway
//!    entry points are bound.
//! 3. **Registry** — an in-process model implementation registered by
//!    the embedding application under the model definition name.
//!
//! After loading, [`create_model`] registers the default model
//! function, configures the YAML-declared channels, and hands control
//! to the plug-in's create/setup entry point.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::AdapterModel;
use crate::error::{Error, Result};
use crate::model::{Model, ModelApi, ModelContext};
use crate::models::gateway::GatewayModel;
use crate::runtime::ModelInstance;
use crate::types::SimTime;

/// Factory producing the plug-in interface of one instance.
pub type ApiFactory = Arc<dyn Fn() -> ModelApi + Send + Sync>;

/// Registry of in-process model implementations, keyed by model
/// definition name.
///
/// # Example
///
/// ```
/// use cosim::loader::ModelRegistry;
/// use cosim::models::mock::CounterModel;
///
/// let mut registry = ModelRegistry::new();
/// registry.register("Counter", || Box::new(CounterModel::new("data", "counter")));
/// assert!(registry.contains("Counter"));
/// ```
#[derive(Clone, Default)]
pub struct ModelRegistry {
    factories: HashMap<String, ApiFactory>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a vtable-kind model implementation.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Model> + Send + Sync + 'static,
    {
        self.factories
            .insert(name.into(), Arc::new(move || ModelApi::Vtable(factory())));
    }

    /// Registers a factory producing any plug-in interface kind; used
    /// for models of the older setup/exit generation.
    pub fn register_api<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> ModelApi + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Produces the plug-in interface for a model name.
    pub fn create(&self, name: &str) -> Option<ModelApi> {
        self.factories.get(name).map(|f| f())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("registered", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Binds the plug-in interface for an instance.
pub(crate) fn load_model(inst: &ModelInstance, registry: &ModelRegistry) -> Result<ModelApi> {
    if let Some(path) = &inst.model_definition.full_path {
        tracing::info!(path = %path.display(), "loading dynamic model");
        return dynlib::load(path);
    }
    if inst.model_definition.gateway {
        tracing::info!(instance = %inst.name, "using gateway symbols");
        return Ok(ModelApi::Vtable(Box::new(GatewayModel::new())));
    }
    if let Some(api) = registry.create(&inst.model_definition.name) {
        tracing::info!(model = %inst.model_definition.name, "using registered model");
        return Ok(api);
    }
    Err(Error::PluginLoad {
        path: inst.model_definition.name.clone(),
        reason: "no dynlib path, gateway runtime, or registered model".to_string(),
    })
}

/// Runs the plug-in's create/setup entry point, after registering the
/// default model function (named after the instance, stepping at the
/// simulation step size) and configuring the instance's YAML-declared
/// channels. The older setup/exit generation registers its own
/// functions instead.
pub(crate) fn create_model(
    inst: &mut ModelInstance,
    am: &mut AdapterModel,
    step_size: SimTime,
) -> Result<()> {
    let ModelInstance {
        name,
        uid,
        spec,
        model_channels,
        controller_model,
        ..
    } = inst;

    let mut ctx = ModelContext::new(
        name,
        *uid,
        step_size,
        &mut controller_model.functions,
        am,
        model_channels,
        &spec.channels,
    );

    match controller_model.api.as_mut() {
        Some(ModelApi::Vtable(model)) => {
            if !ctx.has_function(name) {
                ctx.register_function(name, step_size, None)?;
            }
            for node in &spec.channels {
                if let Some(selector) = node.selector() {
                    ctx.configure_channel(name, selector)?;
                }
            }
            model.create(&mut ctx)
        }
        Some(ModelApi::SetupExit { setup, .. }) => {
            let setup = setup.take().ok_or_else(|| Error::PluginLoad {
                path: name.clone(),
                reason: "model_setup entry point already consumed".to_string(),
            })?;
            setup(&mut ctx)
        }
        None => Err(Error::PluginLoad {
            path: name.clone(),
            reason: "plugin interface not loaded".to_string(),
        }),
    }
}

/// C ABI shared with dynamic model libraries.
///
/// A foreign model cannot link back into the host, so the descriptor
/// passed to every entry point carries the signal-vector views and the
/// callbacks a model needs: payload append/reset during steps, and
/// function registration during create/setup. The host owns every
/// descriptor; a model keeps private state through the `user` field.
pub mod abi {
    use std::os::raw::{c_char, c_void};

    pub const MODEL_CREATE_FUNC_NAME: &[u8] = b"model_create\0";
    pub const MODEL_STEP_FUNC_NAME: &[u8] = b"model_step\0";
    pub const MODEL_DESTROY_FUNC_NAME: &[u8] = b"model_destroy\0";
    pub const MODEL_SETUP_FUNC_NAME: &[u8] = b"model_setup\0";
    pub const MODEL_EXIT_FUNC_NAME: &[u8] = b"model_exit\0";

    /// One binary payload reference.
    #[repr(C)]
    pub struct BinaryRef {
        pub data: *const u8,
        pub len: u32,
    }

    /// One channel's signal vector view.
    #[repr(C)]
    pub struct SignalVectorDesc {
        pub name: *const c_char,
        pub count: u32,
        pub is_binary: u8,
        /// Scalar values (`count` entries), null for binary vectors.
        pub scalar: *mut f64,
        /// Payload references (`count` entries), null for scalar
        /// vectors.
        pub binary: *mut BinaryRef,
        /// Host handle backing the callbacks below. Valid for the
        /// duration of the entry-point call.
        pub handle: *mut c_void,
        pub append:
            Option<unsafe extern "C" fn(*mut SignalVectorDesc, u32, *const u8, u32) -> i32>,
        pub reset: Option<unsafe extern "C" fn(*mut SignalVectorDesc, u32) -> i32>,
    }

    /// Step handler registered by a setup-generation model.
    pub type DoStepFn = unsafe extern "C" fn(model_time: *mut f64, stop_time: f64) -> i32;

    /// Model descriptor passed to every entry point.
    #[repr(C)]
    pub struct ModelDesc {
        pub uid: u32,
        pub name: *const c_char,
        pub sv_count: u32,
        pub sv: *mut SignalVectorDesc,
        /// Registration handle, valid during create/setup only.
        pub host: *mut c_void,
        pub register_function: Option<
            unsafe extern "C" fn(
                host: *mut c_void,
                name: *const c_char,
                step_size: f64,
                handler: Option<DoStepFn>,
            ) -> i32,
        >,
        /// Private model state; written by `model_create`, passed back
        /// on every later call.
        pub user: *mut c_void,
    }

    pub type ModelCreateFn = unsafe extern "C" fn(*mut ModelDesc) -> *mut ModelDesc;
    pub type ModelStepFn = unsafe extern "C" fn(*mut ModelDesc, *mut f64, f64) -> i32;
    pub type ModelDestroyFn = unsafe extern "C" fn(*mut ModelDesc);
    pub type ModelSetupFn = unsafe extern "C" fn(*mut ModelDesc) -> i32;
    pub type ModelExitFn = unsafe extern "C" fn(*mut ModelDesc) -> i32;
}

mod dynlib {
    use std::collections::BTreeMap;
    use std::ffi::{CStr, CString};
    use std::os::raw::{c_char, c_void};
    use std::path::Path;
    use std::ptr;
    use std::sync::Arc;

    use libloading::Library;

    use super::abi;
    use crate::error::{Error, Result};
    use crate::model::{
        ExitHandler, FunctionChannel, Model, ModelApi, ModelContext, ModelSignals, SetupHandler,
        StepHandler,
    };
    use crate::types::{SimTime, StepOutcome};

    fn plugin_err(path: &str, reason: impl Into<String>) -> Error {
        Error::PluginLoad {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    fn map_rc(rc: i32, path: &str) -> Result<StepOutcome> {
        match rc {
            0 => Ok(StepOutcome::Continue),
            rc if rc > 0 => Ok(StepOutcome::Finished),
            rc => Err(Error::Step {
                model: path.to_string(),
                function: String::new(),
                rc,
            }),
        }
    }

    /// Functions registered by a foreign model during create/setup,
    /// collected through the descriptor callback and applied to the
    /// context afterwards.
    #[derive(Default)]
    struct RegistrationSink {
        entries: Vec<(String, f64, Option<abi::DoStepFn>)>,
    }

    unsafe extern "C" fn host_register_function(
        host: *mut c_void,
        name: *const c_char,
        step_size: f64,
        handler: Option<abi::DoStepFn>,
    ) -> i32 {
        if host.is_null() || name.is_null() {
            return -1;
        }
        let sink = &mut *(host as *mut RegistrationSink);
        let name = CStr::from_ptr(name).to_string_lossy().into_owned();
        sink.entries.push((name, step_size, handler));
        0
    }

    unsafe extern "C" fn sv_append(
        sv: *mut abi::SignalVectorDesc,
        index: u32,
        data: *const u8,
        len: u32,
    ) -> i32 {
        if sv.is_null() || data.is_null() {
            return -1;
        }
        let fc = (*sv).handle as *mut FunctionChannel;
        if fc.is_null() || index >= (*sv).count {
            return -1;
        }
        let bytes = std::slice::from_raw_parts(data, len as usize);
        (*fc).append_binary(index as usize, bytes);
        0
    }

    unsafe extern "C" fn sv_reset(sv: *mut abi::SignalVectorDesc, index: u32) -> i32 {
        if sv.is_null() {
            return -1;
        }
        let fc = (*sv).handle as *mut FunctionChannel;
        if fc.is_null() || index >= (*sv).count {
            return -1;
        }
        (*fc).reset_binary(index as usize);
        0
    }

    /// Per-call storage backing the descriptor views. Must stay alive
    /// across the entry-point call.
    struct SvStorage {
        _names: Vec<CString>,
        binrefs: Vec<Vec<abi::BinaryRef>>,
        descs: Vec<abi::SignalVectorDesc>,
    }

    fn build_svs(channels: &mut BTreeMap<String, FunctionChannel>) -> SvStorage {
        let mut names = Vec::with_capacity(channels.len());
        let mut binrefs = Vec::with_capacity(channels.len());
        let mut descs = Vec::with_capacity(channels.len());

        for (name, fc) in channels.iter_mut() {
            let cname = CString::new(name.as_str()).unwrap_or_default();
            let count = fc.signal_count() as u32;
            let handle = fc as *mut FunctionChannel as *mut c_void;

            let (scalar, refs) = if fc.is_binary() {
                let refs: Vec<abi::BinaryRef> = (0..fc.signal_count())
                    .map(|i| {
                        let b = fc.binary(i);
                        abi::BinaryRef {
                            data: b.as_ptr(),
                            len: b.len() as u32,
                        }
                    })
                    .collect();
                (ptr::null_mut(), refs)
            } else {
                let scalar = fc
                    .scalars_mut()
                    .map(|v| v.as_mut_ptr())
                    .unwrap_or(ptr::null_mut());
                (scalar, Vec::new())
            };

            descs.push(abi::SignalVectorDesc {
                name: cname.as_ptr(),
                count,
                is_binary: u8::from(fc.is_binary()),
                scalar,
                binary: ptr::null_mut(),
                handle,
                append: Some(sv_append),
                reset: Some(sv_reset),
            });
            names.push(cname);
            binrefs.push(refs);
        }

        let mut storage = SvStorage {
            _names: names,
            binrefs,
            descs,
        };
        for (desc, refs) in storage.descs.iter_mut().zip(storage.binrefs.iter_mut()) {
            if !refs.is_empty() {
                desc.binary = refs.as_mut_ptr();
            }
        }
        storage
    }

    fn wrap_ffi_handler(f: abi::DoStepFn) -> StepHandler {
        Box::new(move |_signals, model_time, stop_time| {
            let rc = unsafe { f(model_time, stop_time) };
            match rc {
                0 => Ok(StepOutcome::Continue),
                rc if rc > 0 => Ok(StepOutcome::Finished),
                rc => Err(Error::Step {
                    model: String::new(),
                    function: String::new(),
                    rc,
                }),
            }
        })
    }

    fn apply_sink(sink: RegistrationSink, ctx: &mut ModelContext<'_>) -> Result<()> {
        for (name, step_size, handler) in sink.entries {
            ctx.register_function(&name, step_size, handler.map(wrap_ffi_handler))?;
        }
        Ok(())
    }

    /// A dynamically loaded model of the vtable generation.
    pub(super) struct DynlibModel {
        path: String,
        create: Option<abi::ModelCreateFn>,
        step: Option<abi::ModelStepFn>,
        destroy: Option<abi::ModelDestroyFn>,
        user: *mut c_void,
        _lib: Library,
    }

    // The core is single-threaded cooperative; `user` is private model
    // state confined to the owning instance.
    unsafe impl Send for DynlibModel {}

    impl DynlibModel {
        fn desc(
            &self,
            name: &CString,
            uid: u32,
            svs: &mut SvStorage,
            host: *mut c_void,
        ) -> abi::ModelDesc {
            abi::ModelDesc {
                uid,
                name: name.as_ptr(),
                sv_count: svs.descs.len() as u32,
                sv: if svs.descs.is_empty() {
                    ptr::null_mut()
                } else {
                    svs.descs.as_mut_ptr()
                },
                host,
                register_function: if host.is_null() {
                    None
                } else {
                    Some(host_register_function)
                },
                user: self.user,
            }
        }
    }

    impl Model for DynlibModel {
        fn create(&mut self, ctx: &mut ModelContext<'_>) -> Result<()> {
            let Some(create) = self.create else {
                return Ok(());
            };
            let name = CString::new(ctx.instance_name()).unwrap_or_default();
            let uid = ctx.uid();
            let mut sink = RegistrationSink::default();
            let mut svs = ctx
                .default_function_channels_mut()
                .map(build_svs)
                .unwrap_or_else(|| build_svs(&mut BTreeMap::new()));
            let mut desc = self.desc(
                &name,
                uid,
                &mut svs,
                &mut sink as *mut RegistrationSink as *mut c_void,
            );

            let ret = unsafe { create(&mut desc) };
            if ret.is_null() && desc.user.is_null() {
                tracing::debug!(path = %self.path, "model_create returned no state");
            }
            self.user = desc.user;
            apply_sink(sink, ctx)
        }

        fn step(
            &mut self,
            signals: &mut ModelSignals<'_>,
            model_time: &mut SimTime,
            stop_time: SimTime,
        ) -> Result<StepOutcome> {
            let Some(step) = self.step else {
                return Err(plugin_err(&self.path, "model_step not loaded"));
            };
            let name = CString::new("").unwrap_or_default();
            let mut svs = build_svs(signals.channels_mut());
            let mut desc = self.desc(&name, 0, &mut svs, ptr::null_mut());

            let rc = unsafe { step(&mut desc, model_time, stop_time) };
            map_rc(rc, &self.path)
        }

        fn destroy(&mut self) {
            if let Some(destroy) = self.destroy {
                let name = CString::new("").unwrap_or_default();
                let mut svs = build_svs(&mut BTreeMap::new());
                let mut desc = self.desc(&name, 0, &mut svs, ptr::null_mut());
                unsafe { destroy(&mut desc) };
            }
        }
    }

    /// Wraps the older setup/exit symbol generation.
    fn legacy_api(
        lib: Library,
        setup: abi::ModelSetupFn,
        exit: Option<abi::ModelExitFn>,
        path: String,
    ) -> ModelApi {
        let lib = Arc::new(lib);

        let setup_lib = Arc::clone(&lib);
        let setup_path = path.clone();
        let setup_handler: SetupHandler = Box::new(move |ctx| {
            let _keep_loaded = &setup_lib;
            let name = CString::new(ctx.instance_name()).unwrap_or_default();
            let mut sink = RegistrationSink::default();
            let mut desc = abi::ModelDesc {
                uid: ctx.uid(),
                name: name.as_ptr(),
                sv_count: 0,
                sv: ptr::null_mut(),
                host: &mut sink as *mut RegistrationSink as *mut c_void,
                register_function: Some(host_register_function),
                user: ptr::null_mut(),
            };
            let rc = unsafe { setup(&mut desc) };
            if rc != 0 {
                return Err(plugin_err(&setup_path, format!("model_setup failed (rc={rc})")));
            }
            apply_sink(sink, ctx)
        });

        let exit_handler: Option<ExitHandler> = exit.map(|f| {
            let exit_lib = Arc::clone(&lib);
            let exit_path = path;
            Box::new(move || {
                let _keep_loaded = &exit_lib;
                let mut desc = abi::ModelDesc {
                    uid: 0,
                    name: ptr::null(),
                    sv_count: 0,
                    sv: ptr::null_mut(),
                    host: ptr::null_mut(),
                    register_function: None,
                    user: ptr::null_mut(),
                };
                let rc = unsafe { f(&mut desc) };
                if rc != 0 {
                    return Err(plugin_err(&exit_path, format!("model_exit failed (rc={rc})")));
                }
                Ok(())
            }) as ExitHandler
        });

        ModelApi::SetupExit {
            setup: Some(setup_handler),
            exit: exit_handler,
        }
    }

    /// Resolves the plug-in entry points from a shared library.
    ///
    /// A missing `model_destroy` is tolerated; a library exporting
    /// neither `model_create` nor `model_step` falls back to the
    /// older setup/exit generation, and failing that the interface is
    /// incomplete.
    pub(crate) fn load(path: &Path) -> Result<ModelApi> {
        let path_display = path.display().to_string();
        let lib = unsafe { Library::new(path) }
            .map_err(|e| plugin_err(&path_display, e.to_string()))?;

        unsafe {
            let create = lib
                .get::<abi::ModelCreateFn>(abi::MODEL_CREATE_FUNC_NAME)
                .map(|s| *s)
                .ok();
            let step = lib
                .get::<abi::ModelStepFn>(abi::MODEL_STEP_FUNC_NAME)
                .map(|s| *s)
                .ok();
            let destroy = lib
                .get::<abi::ModelDestroyFn>(abi::MODEL_DESTROY_FUNC_NAME)
                .map(|s| *s)
                .ok();
            tracing::info!(
                create = create.is_some(),
                step = step.is_some(),
                destroy = destroy.is_some(),
                "loading symbols"
            );

            if create.is_none() && step.is_none() {
                let setup = lib
                    .get::<abi::ModelSetupFn>(abi::MODEL_SETUP_FUNC_NAME)
                    .map(|s| *s)
                    .ok();
                if let Some(setup) = setup {
                    let exit = lib
                        .get::<abi::ModelExitFn>(abi::MODEL_EXIT_FUNC_NAME)
                        .map(|s| *s)
                        .ok();
                    tracing::info!(exit = exit.is_some(), "loading legacy symbols");
                    return Ok(legacy_api(lib, setup, exit, path_display));
                }
                tracing::error!(path = %path_display, "model interface not complete");
                return Err(plugin_err(
                    &path_display,
                    "model interface not complete (model_create, model_step)",
                ));
            }

            Ok(ModelApi::Vtable(Box::new(DynlibModel {
                path: path_display,
                create,
                step,
                destroy,
                user: ptr::null_mut(),
                _lib: lib,
            })))
        }
    }
}
