//! Serves Envoy xDS snapshots over gRPC.
//!
//! Each sidecar identifies itself by its `node.cluster` string and receives
//! whatever snapshot the registry last published under that key. Only the
//! state-of-the-world protocol variants are served.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
pub mod metrics;
mod server;
mod sotw;

pub use self::{
    cache::{SnapshotCache, SnapshotRx},
    server::XdsServer,
};
