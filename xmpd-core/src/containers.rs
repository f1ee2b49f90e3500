//! Hash container aliases used by registries and connection tables.
//!
//! Container choices stay centralized here so handler and dispatch modules never name the
//! hashing crate directly.

use hashbrown::HashMap as HbMap;

/// Hash map used by lookup tables on the reactor thread.
pub type HotMap<K, V> = HbMap<K, V>;
