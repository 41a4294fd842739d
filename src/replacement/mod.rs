//! Page cache replacement policy.
//!
//! The cache uses a single policy, LRU-K with K = 2, whose score is boosted
//! by usage hints that callers attach to a page while they hold it.
//!
//! # Interface
//!
//! `PolicyState` exposes:
//! - `record_hit()`: rotates a slot's access generations on a cache hit
//! - `on_slot_assigned()`: starts the history of a slot that just faulted in a page
//! - `score()`: recomputes a slot's eviction score from its history and hints
//! - `evict_slot()`: picks the lowest-scoring candidate

mod lru_k;

pub use lru_k::{CacheHints, History, PolicyState};
