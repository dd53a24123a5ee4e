//! # Language Bindings
//!
//! Only compiled with the `python` feature.

#[cfg(feature = "python")]
pub mod python;
