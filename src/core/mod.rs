//! Shared primitives: record envelopes and their store, checksums and
//! signatures, identity, git plumbing, and the ambient config/logging layer.

pub mod config;
pub mod crypto;
pub mod error;
pub mod git;
pub mod identity;
pub mod integrity;
pub mod logging;
pub mod output;
pub mod schemas;
pub mod store;
pub mod time;
