//! URL transfer plugins for the stagehand transfer engine
//!
//! Out-of-band transports are external helper binaries keyed by URL
//! scheme. This crate discovers them ([`PluginRegistry`]), probes their
//! capabilities, and invokes them one URL at a time or as batches
//! ([`PluginInvoker`]), shaping their attribute-record output into the
//! engine's statistics types.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod invoker;
pub mod registry;

pub use invoker::{
    PluginEnvironment, PluginInvoker, PluginPrivilege, PluginRequest,
};
pub use registry::PluginRegistry;
