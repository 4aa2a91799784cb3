//! Shared building blocks for the spigot services: address and hash
//! types, a JSON-RPC transport, and logging/config helpers.

pub mod rpc;
pub mod types;
pub mod utils;

pub use rpc::{parse_quantity, RpcError, RpcTransport};
pub use types::{Address, AddressParseError, Hash};
