//! Write-cached append log and PTY block controller for a terminal
//! workspace server.
//!
//! A [`filestore::Filestore`] gives named, zoned files (plain, circular, or
//! JSON-command-log) an in-memory write-back cache over a
//! [`partstore::PartStore`] persistence layer. A [`controller::Controller`]
//! supervises one shell process per "block", writing its PTY output into a
//! circular `term` file and exchanging an in-band control protocol
//! ([`ptydemux`]) over the same stream. State changes on either side are
//! announced through a shared [`broker::Broker`].

pub mod broker;
pub mod config;
pub mod controller;
pub mod error;
pub mod filestore;
pub mod partstore;
pub mod ptydemux;

pub use broker::Broker;
pub use config::Config;
pub use controller::Controller;
pub use filestore::Filestore;
pub use partstore::PartStore;

/// Initialize the `env_logger` backend from `RUST_LOG`, if not already set
/// up by the embedding process. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::try_init();
}
