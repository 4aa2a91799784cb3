pub mod store;

pub use store::{decode, decode_u128, encode, DurableStore, StorageError, StorageResult, StoreConfig};
