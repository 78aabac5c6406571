//! Configuration documents for the co-simulation runtime.
//!
//! Simulations are described by multi-document YAML files. The runtime
//! reads two document kinds:
//!
//! - `Stack` — the composition: which model instances run, their UIDs,
//!   and the channels each instance binds.
//! - `Model` — one model package: where its shared library lives (per
//!   OS/architecture), whether it is a gateway runtime, and the signals
//!   its channels expose.
//!
//! Documents of any other kind are carried through un-parsed so that
//! mixed files (deployment manifests, signal groups of external tools)
//! do not fail the load.
//!
//! # Document Structure
//!
//! ```yaml
//! kind: Stack
//! metadata:
//!   name: default
//! spec:
//!   models:
//!     - name: counter_inst
//!       uid: 42
//!       model:
//!         name: Counter
//!       channels:
//!         - name: data
//! ---
//! kind: Model
//! metadata:
//!   name: Counter
//! spec:
//!   runtime:
//!     dynlib:
//!       - os: linux
//!         arch: amd64
//!         path: lib/counter.so
//!   channels:
//!     - name: data
//!       signals:
//!         - signal: counter
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Uid;

/// Metadata block common to all document kinds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Document name (matched against references).
    #[serde(default)]
    pub name: String,

    /// Free-form annotations. The runtime reads `path` (location of a
    /// model package) when resolving model definitions.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// A signal entry of a channel node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalNode {
    /// The signal name as exchanged on the bus.
    pub signal: String,
}

/// A channel declaration, either on a model definition or on a model
/// instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChannelNode {
    /// Channel name on the bus.
    #[serde(default)]
    pub name: Option<String>,

    /// Alternative name used to select the channel.
    #[serde(default)]
    pub alias: Option<String>,

    /// Signals exposed on this channel, in declaration order.
    #[serde(default)]
    pub signals: Vec<SignalNode>,

    /// Signal vector representation: scalar by default, `binary` for
    /// payload channels.
    #[serde(default)]
    pub vector_type: Option<String>,
}

impl ChannelNode {
    /// The name used to select this channel (alias wins over name).
    pub fn selector(&self) -> Option<&str> {
        self.alias.as_deref().or(self.name.as_deref())
    }

    /// Returns true if either name or alias matches `wanted`.
    pub fn matches(&self, wanted: &str) -> bool {
        self.name.as_deref() == Some(wanted) || self.alias.as_deref() == Some(wanted)
    }
}

/// Reference from a stack model instance to its model definition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelRef {
    /// Name of the `Model` document implementing this instance.
    #[serde(default)]
    pub name: String,

    /// Metadata of the referenced model; `annotations.path` locates the
    /// model package (its `model.yaml`).
    #[serde(default)]
    pub metadata: Metadata,
}

/// One model instance entry under `Stack.spec.models`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StackModel {
    /// Instance name, unique within the stack.
    pub name: String,

    /// Pre-assigned model UID; zero lets the runtime derive one.
    #[serde(default)]
    pub uid: Uid,

    /// The model definition this instance runs.
    #[serde(default)]
    pub model: ModelRef,

    /// Channels this instance binds.
    #[serde(default)]
    pub channels: Vec<ChannelNode>,
}

/// `Stack` document spec.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StackSpec {
    #[serde(default)]
    pub models: Vec<StackModel>,
}

/// A `Stack` document: the simulation composition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StackDoc {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: StackSpec,
}

/// One dynlib entry of a model runtime, selected by platform.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DynlibSpec {
    pub os: String,
    pub arch: String,
    pub path: String,
}

/// `Model.spec.runtime`: how the model is brought into the process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Shared-library candidates, one per (os, arch).
    #[serde(default)]
    pub dynlib: Vec<DynlibSpec>,

    /// Present (any value) when the model is a gateway: the runtime
    /// binds the built-in gateway entry points instead of a dynlib.
    #[serde(default)]
    pub gateway: Option<serde_yaml::Value>,
}

/// `Model` document spec.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub runtime: RuntimeSpec,

    /// Channels the model exposes, with their signal lists.
    #[serde(default)]
    pub channels: Vec<ChannelNode>,
}

/// A `Model` document: one model package.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelDoc {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: ModelSpec,
}

/// A parsed YAML document, dispatched on its `kind`.
#[derive(Clone, Debug)]
pub enum Document {
    Stack(StackDoc),
    Model(ModelDoc),
    /// Any other kind, kept so callers can see what was loaded.
    Other { kind: String },
}

/// Parses all documents of a multi-document YAML string.
pub fn parse_documents(text: &str) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(de)?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();
        let doc = match kind.as_str() {
            "Stack" => Document::Stack(serde_yaml::from_value(value)?),
            "Model" => Document::Model(serde_yaml::from_value(value)?),
            _ => Document::Other { kind },
        };
        docs.push(doc);
    }
    Ok(docs)
}

/// Loads all documents from a YAML file.
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Vec<Document>> {
    let path = path.as_ref();
    tracing::info!(file = %path.display(), "load YAML file");
    let text = std::fs::read_to_string(path)?;
    parse_documents(&text)
}

/// Finds a stack model instance node by instance name.
pub fn find_stack_model<'a>(docs: &'a [Document], name: &str) -> Option<&'a StackModel> {
    docs.iter().find_map(|doc| match doc {
        Document::Stack(stack) => stack.spec.models.iter().find(|m| m.name == name),
        _ => None,
    })
}

/// Finds a model definition document by `metadata.name`.
pub fn find_model_doc<'a>(docs: &'a [Document], name: &str) -> Option<&'a ModelDoc> {
    docs.iter().find_map(|doc| match doc {
        Document::Model(model) if model.metadata.name == name => Some(model),
        _ => None,
    })
}

/// Platform OS string used for dynlib selection.
pub fn platform_os() -> &'static str {
    std::env::consts::OS
}

/// Platform architecture string used for dynlib selection.
///
/// Model packages conventionally use `amd64`/`arm64`; the raw Rust
/// spelling is also accepted when matching.
pub fn platform_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Selects the dynlib entry matching the current platform.
pub fn select_dynlib(runtime: &RuntimeSpec) -> Option<&DynlibSpec> {
    runtime.dynlib.iter().find(|dl| {
        dl.os.eq_ignore_ascii_case(platform_os())
            && (dl.arch.eq_ignore_ascii_case(platform_arch())
                || dl.arch.eq_ignore_ascii_case(std::env::consts::ARCH))
    })
}

/// Looks up the channel signal list for `channel_name`, searching the
/// model definition channels first and falling back to the instance
/// node channels.
///
/// Returns the resolved channel name, the signal names in declaration
/// order, and whether the channel carries binary payloads.
pub fn resolve_channel_signals(
    model_channels: &[ChannelNode],
    instance_channels: &[ChannelNode],
    channel_name: &str,
) -> Result<(String, Vec<String>, bool)> {
    let node = model_channels
        .iter()
        .find(|c| c.matches(channel_name) && !c.signals.is_empty())
        .or_else(|| {
            instance_channels
                .iter()
                .find(|c| c.matches(channel_name) && !c.signals.is_empty())
        })
        .ok_or_else(|| {
            Error::Config(format!(
                "signals for channel {channel_name} not found in model definition or instance"
            ))
        })?;

    let resolved = node
        .name
        .as_deref()
        .unwrap_or(channel_name)
        .to_string();
    let signals = node.signals.iter().map(|s| s.signal.clone()).collect();
    let binary = node.vector_type.as_deref() == Some("binary");
    Ok((resolved, signals, binary))
}
