//! Operational risk: tri-state guards and the signal hub feeding them.

pub mod guards;
pub mod signals;

pub use guards::{GuardEngine, GuardLevel, GuardSignals, GuardState};
pub use signals::{Ema, SignalHub};
