//! KATO xDS resource index
//!
//! The controller watches three kinds of cluster resources, all selected by
//! the platform's `creator` label:
//!
//! - Each `Service` describes a mesh port of an application, labeled with its
//!   alias, service id, and protocol.
//! - Each `Endpoints` lists the addresses backing a Service.
//! - Each plugin `ConfigMap` describes the dependencies and exposed ports of
//!   one sidecar.
//!
//! ```text
//! [ Service ] <- [ Endpoints ]
//!      ^
//!      | depend_service_id
//! [ ConfigMap ] -> [ NodeConfig ] -> [ Snapshot ]
//! ```
//!
//! Watch events update a shared [`Index`] and, when they change something the
//! mesh consumes, enqueue a [`Task`]. A single worker drains the queue into
//! the [`Registry`], which rebuilds the affected sidecars' Envoy resources and
//! publishes them to a [`SnapshotSink`](kato_xds_controller_core::SnapshotSink).
//! Failed tasks are retried after a delay.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
pub mod metrics;
mod node_config;
pub mod queue;
mod registry;
mod task;


pub use self::{
    index::{index_config_maps, Index, SharedIndex},
    node_config::NodeConfig,
    queue::{Handler, Queue, Worker},
    registry::Registry,
    task::{EventKind, Resource, Task},
};
