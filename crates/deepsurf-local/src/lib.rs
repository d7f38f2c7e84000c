//! Local implementations of the `deepsurf-core` service traits.
//!
//! The browser search backend lives here (ports, sessions, workers, the agent pool and the
//! fallback cascade), next to the HTTP engines, full-text extraction, YouTube transcripts and
//! the OpenAI-compatible planning client.

pub mod config;
pub mod extract;
pub mod fallback;
pub mod openai_compat;
pub mod playwright;
pub mod pool;
pub mod ports;
pub mod retry;
pub mod search;
pub mod session;
pub mod shellout;
pub mod worker;
pub mod youtube;

pub use config::{Config, SecondaryEngine};
pub use fallback::{CascadeTrace, FallbackSearchService};
pub use pool::{AgentPool, PoolConfig, PoolStatus};
pub use ports::{PortAllocator, PortReservation};
