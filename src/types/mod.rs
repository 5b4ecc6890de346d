//! Shared types for feedline

pub mod error;

pub use error::{FeedError, Result};
