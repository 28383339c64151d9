//! Shared types for Propsd.
//!
//! This crate provides:
//! - The common error type used across the workspace
//! - Property-tree utilities (deep merge, dotted-path lookup, overlays,
//!   content signatures)
//! - `{{ dotted.path }}` string templating

pub mod error;
pub mod properties;
pub mod template;

pub use error::{Error, Result};
