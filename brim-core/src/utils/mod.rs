//! Ambient utilities: logging with redaction, credential resolution.

pub mod logging;
pub mod secrets;

pub use logging::init_logging;
pub use secrets::{resolve as resolve_credentials, Credentials, Redactor, Secret};
