pub mod error;
pub mod config;
pub mod metrics;

pub mod hashrate;
pub mod keepalive;
pub mod vardiff;

pub mod jobs;
pub mod store;

pub mod shares;
pub mod stratum;
