pub mod cache;
pub mod cache_manager;
pub mod config;
pub mod discoverer;
pub mod error;
pub mod mdns;
pub mod shutdown;

pub use discoverer::{Discoverer, DiscoverySettings};
pub use error::ClientError;
