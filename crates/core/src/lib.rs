//! cmbridge core library.
//!
//! A version-control adapter that manages a local sandbox against a
//! centralized repository with server-side workspaces, pending changes,
//! checkin locks and numbered changesets. The crate provides status
//! derivation, conflict detection and resolution, revision handling,
//! feature capability sets, and an in-memory reference repository.

pub mod adapter;
pub mod backend;
pub mod batch;
pub mod checkin;
pub mod config;
pub mod conflict;
pub mod digest;
pub mod errors;
pub mod factory;
pub mod features;
pub mod logging;
pub mod memory;
pub mod revision;
pub mod session;
pub mod status;

// Re-exports for convenience.
pub use adapter::WorkingCopyAdapter;
pub use config::AdapterConfig;
pub use errors::AdapterError;
pub use factory::AdapterFactory;
pub use features::{Feature, FeatureSet};
pub use memory::MemoryRepository;
pub use session::Session;
pub use status::{FileState, LocalStatus};
