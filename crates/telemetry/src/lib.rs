//! Logging and startup audit records for dbstrap.

pub mod audit;
pub mod logging;

pub use audit::append_audit_record;
pub use logging::{init_logging, LogFormat};
