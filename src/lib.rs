//! # cosim
//!
//! A model-controller core for distributed co-simulation. A simulation
//! composes independently authored *models* (plug-ins implementing a
//! fixed interface) that exchange time-varying *signals* over a shared
//! bus under a globally coordinated stepping protocol. One process
//! hosts one or more model instances; many such processes federate
//! across a network.
//!
//! ## Design Principles
//!
//! - **Descriptor-Driven**: simulations are declared in YAML `Stack`
//!   and `Model` documents; the lifecycle manager resolves instances,
//!   plug-ins, and channels from them.
//! - **Coordinated Stepping**: every tick runs marshal-out, a bus
//!   ready/start exchange, marshal-in, and the model step handlers,
//!   so a value written at tick k becomes visible to peers at tick
//!   k+1, never within the same tick.
//! - **Two Plug-in Generations**: the vtable interface
//!   (create/step/destroy) and the older setup/exit interface are
//!   unified behind one tagged plug-in kind; dynlibs, in-process
//!   models, and the built-in gateway all load through it.
//! - **Embedded Mode**: the gateway facade lets an external driver own
//!   the time loop through a `setup → sync(t) → exit` surface with an
//!   explicit "behind the bus" feedback signal.
//! - **Single-Threaded Cooperative**: all marshalling, stepping, and
//!   bus I/O run on the caller's thread; the only concurrency is the
//!   interrupt-safe stop request.

pub mod adapter;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod loader;
mod marshal;
pub mod model;
pub mod models;
pub mod runtime;
pub mod signal;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use gateway::ModelGateway;
pub use loader::ModelRegistry;
pub use model::{FunctionChannel, Model, ModelContext, ModelSignals, SignalKind, StepHandler};
pub use runtime::{ModelInstance, RuntimeArgs, ShutdownHandle, Simulation};
pub use types::{RunStatus, SimTime, StepOutcome, Uid};
