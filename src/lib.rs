// =============================================
// lib.rs
// =============================================
pub mod attention;
pub mod batch;
pub mod config;
pub mod dataset;
pub mod model;
pub mod train;
pub mod vocab;

// Re-export key structs for easier access
pub use batch::{BatchTensors, Example, MemoryEntry, MemoryTensors};
pub use config::Config;
pub use model::{DecodePolicy, Summarizer};
pub use vocab::Vocab;
