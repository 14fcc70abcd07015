#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod identity;
pub mod options;
pub mod plugin;
pub mod snapshot;

pub use self::{
    identity::{InvalidIdentity, NodeIdentity},
    options::Options,
    plugin::{BasePort, BaseService, PluginConfig, PluginConfigError, PluginModel},
    snapshot::{to_any, PublishError, ResourceType, Snapshot, SnapshotSink},
};
pub use envoy_types::pb;

/// The label value that marks resources managed by the platform.
pub const DEFAULT_CREATOR: &str = "kato";
