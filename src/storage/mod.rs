//! Key-value persistence collaborator.
//!
//! The request list, request queue and session pool persist their state
//! through this interface. Two implementations ship with the engine: a
//! local file-backed store rooted at the configured storage directory and
//! an in-memory store for tests and ephemeral runs.

pub mod kv;

pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
