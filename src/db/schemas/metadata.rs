//! Write-path metadata kept beside every stored entity

use bson::DateTime;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    /// Version of the job that last wrote this document
    #[serde(default)]
    pub version: i64,

    /// Tombstone flag; deleted documents stay until a newer create
    #[serde(default)]
    pub is_deleted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime>,
}

impl Metadata {
    /// Metadata for a live document written at `version`
    pub fn live(version: u64) -> Self {
        Self {
            version: version as i64,
            is_deleted: false,
            deleted_at: None,
            updated_at: Some(DateTime::now()),
        }
    }

    /// Metadata for a tombstone written at `version`
    pub fn tombstone(version: u64) -> Self {
        let now = DateTime::now();
        Self {
            version: version as i64,
            is_deleted: true,
            deleted_at: Some(now),
            updated_at: Some(now),
        }
    }

    /// Whether a write at `version` wins over this document
    pub fn accepts(&self, version: u64) -> bool {
        (version as i64) > self.version
    }
}
