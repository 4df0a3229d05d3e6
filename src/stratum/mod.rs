pub mod connection;
pub mod multiplexer;
pub mod server;
pub mod v1;
pub mod v2;

pub use connection::{ConnectionState, MiningConnection, ProtocolVariant};
pub use multiplexer::{detect, respond_http_probe, DetectedProtocol};
pub use server::ServerCore;
