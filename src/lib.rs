#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::unwrap_used)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod client;
pub mod cloud;
mod cluster;
mod compression;
mod connection;
pub mod error;
pub mod events;
mod frame;
pub mod options;
pub mod policies;
mod prepared;
pub mod results;
mod runtime;
pub mod statement;

pub use client::{
    auth::{Authenticator, AuthenticatorProvider},
    Client,
    QueryPager,
};
pub use cluster::{ClusterSnapshot, Host, HostDistance, Token};
pub use prepared::PreparedStatement;
pub use statement::{Batch, BatchType, Statement, Value};

/// The driver name sent to the server in STARTUP options.
pub const DRIVER_NAME: &str = "Rust Cassandra Driver";

/// The driver version sent to the server in STARTUP options.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
