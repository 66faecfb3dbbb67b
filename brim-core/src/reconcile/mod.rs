//! Periodic store/exchange reconciliation.

pub mod reconciler;

pub use reconciler::{ReconcileReport, Reconciler, REASON_HARD_DESYNC, REASON_RECONCILE_FAILED};
