//! REST API endpoint modules.

pub mod audit;
pub mod status;
pub mod webhooks;
