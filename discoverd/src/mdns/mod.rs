pub mod advertise;
pub mod aggregator;
pub mod client;
pub mod interfaces;
pub mod wire;

pub use aggregator::{Aggregator, RecordPayload, ServiceRecord};
pub use client::{lookup, Capabilities, MdnsClient, QueryParams, RoundReport};
