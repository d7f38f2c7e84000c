//! `deepsurf` crate (library surface).
//!
//! The primary entrypoint for end users is the `deepsurf` binary (CLI + HTTP event stream).
//! The library exposes the research orchestrator and the runtime wiring so both can be embedded.

pub mod http;
pub mod research;
pub mod runtime;

pub use deepsurf_core as core;
pub use deepsurf_local as local;
