#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use kato_xds_controller_core as core;
pub use kato_xds_controller_grpc as grpc;
pub use kato_xds_controller_k8s_api as k8s;
pub use kato_xds_controller_k8s_index as index;

mod args;

pub use self::args::Args;
