//! # Utility Functions (`utils`)
//!
//! Checkpoint serialization and data-parallel updates.

pub mod parallel;
pub mod serialization;

pub use parallel::DataParallel;
pub use serialization::{load, save, SerializationError, TensorState};
