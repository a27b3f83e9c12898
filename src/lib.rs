//! `SessionFs`
//!
//! An AFS-style network file system: a central server owns an
//! authoritative file tree, clients keep whole-file disk caches and
//! serve reads locally. Coherence follows session semantics: writes
//! become visible to other clients when the writer closes the file,
//! helped along by server-driven invalidation notifications.

#![deny(
    anonymous_parameters,
    bare_trait_objects,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_extern_crates,
    unused_import_braces
)]
#![allow(
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions  // multi-version dependency crates is not able to fix
)]

pub mod client;
pub mod common;
/// Configurations
pub mod config;
pub mod rpc;
pub mod server;

#[cfg(test)]
mod tests;
