//! Error types for the co-simulation runtime.
//!
//! One crate-wide error enum covers the failure taxonomy: configuration
//! faults are fatal for setup, plug-in load faults are fatal for the
//! affected instance, bus timeouts and the gateway behind condition are
//! recoverable by the caller, and a cancelled run is a normal
//! termination carrying its own indicator.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or incomplete configuration (missing stack node,
    /// unresolved model path, bad simulation parameters).
    #[error("configuration error: {0}")]
    Config(String),

    /// A name was registered twice (model function, channel binding).
    #[error("already registered: {0}")]
    AlreadyExists(String),

    /// A model plug-in could not be loaded or its interface is
    /// incomplete. Carries the underlying loader message.
    #[error("failed to load model plugin {path}: {reason}")]
    PluginLoad { path: String, reason: String },

    /// Timeout while waiting for the bus to grant the next step.
    /// Recoverable; the caller may retry or initiate a graceful exit.
    #[error("timed out waiting for the simulation bus")]
    BusTimeout,

    /// The gateway caller's time is behind the bus time. The caller
    /// must advance its own time and retry.
    #[error("gateway time is behind the simulation bus")]
    GatewayBehind,

    /// A step handler reported an error.
    #[error("step failed in {model}:{function} (rc={rc})")]
    Step {
        model: String,
        function: String,
        rc: i32,
    },

    /// A stop request interrupted the operation.
    #[error("cancelled by stop request")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
