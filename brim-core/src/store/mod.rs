//! Durable order store and snapshot persistence.

pub mod order_store;
pub mod snapshot;

pub use order_store::OrderStore;
pub use snapshot::{decode_orders, encode_orders, write_atomic, SnapshotWriter};
