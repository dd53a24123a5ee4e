//! # Algorithms
//!
//! Concrete [`TrainerHooks`](crate::trainer::TrainerHooks) implementations.

pub mod bc;

pub use bc::{BcConfig, BcHooks, BcTrainer};
