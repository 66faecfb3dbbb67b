//! Order lifecycle management: the single writer of exchange mutations.

pub mod writer;

pub use writer::LifecycleWriter;
