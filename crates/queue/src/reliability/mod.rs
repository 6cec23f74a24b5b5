//! Reliability patterns for the queue engine
//!
//! This module provides:
//! - [`RetryPolicy`] - Exponential or fixed backoff applied to failed entries

mod retry;

pub use retry::{RetryDecision, RetryPolicy};
