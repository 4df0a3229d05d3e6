//! The pool's external collaborators: the coin node (RPC), the
//! relational store (durable attribution/records), and the fast KV
//! cache (counters/stats).

pub mod cache;
pub mod persistent;
pub mod rpc_client;

pub use cache::Cache;
pub use persistent::PersistentStore;
pub use rpc_client::CoinRpcClient;
