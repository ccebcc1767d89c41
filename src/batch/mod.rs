//! Batched per-item fetching.
//!
//! This module provides the aggregator that turns a collection of items
//! into concurrent fetches and publishes their results in batches, along
//! with the cache, retry policy and input normalization it relies on.

pub mod aggregator;
pub mod cache;
pub mod input;
pub mod retry;
pub mod state;

pub use aggregator::{AggregatorHandle, BatchedAggregator, ItemFetcher};
pub use cache::QueryCache;
pub use input::ItemSource;
pub use retry::RetryPolicy;
