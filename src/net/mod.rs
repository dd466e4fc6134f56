//! Outbound networking: the client Sentinel uses to talk to monitored
//! instances and peer Sentinels.

pub mod client;

pub use client::SentinelClient;
