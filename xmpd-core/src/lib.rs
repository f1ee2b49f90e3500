//! Stanza processing core: element tree, handler chains, phase dispatch and the worker pool
//! that runs blocking handler work off the reactor thread.

pub mod bridge;
pub mod chain;
pub mod containers;
pub mod dispatch;
pub mod handler;
pub mod runtime;
pub mod tree;
pub mod value;
pub mod write;

#[cfg(test)]
mod testkit;
