pub mod client;
pub mod rate_limit;

pub use client::{KrakenRestClient, PageResponse, TradesApi};
pub use rate_limit::{RateLimitSnapshot, RateLimitTracker};
