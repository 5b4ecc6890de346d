//! Stored document layout

pub mod metadata;

pub use metadata::Metadata;

/// Field holding [`Metadata`] in every stored document
pub const METADATA_FIELD: &str = "metadata";
