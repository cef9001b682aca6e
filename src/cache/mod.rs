// src/cache/mod.rs

//! Caching layers for the data-access plane.
//!
//! Two independent caches cooperate under the worker pool:
//! 1. File cache: content-addressed disk cache of downloaded data files
//! 2. Query result cache: bounded in-memory map + persistent table with TTL

pub mod file_cache;
pub mod query_cache;

pub use file_cache::{FileCache, FileCacheStats};
pub use query_cache::{MemoryQueryCache, PersistentQueryCache, query_cache_key};
