//! HTTP route handlers

pub mod health;
pub mod mutations;
pub mod status;

pub use health::health_check;
pub use mutations::{dispatch, error_response, Route, API_PREFIX};
pub use status::status_check;
