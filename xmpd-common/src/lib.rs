//! Shared primitives used by all `xmpd` crates.
//!
//! This crate sits at the bottom of the dependency graph: error model, configuration and the
//! identifier newtypes that cross crate boundaries.

pub mod config;
pub mod error;
pub mod ids;
