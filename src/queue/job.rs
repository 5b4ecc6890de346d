//! Durable write jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::entity::{EntityKind, Fields, UpdateMode};
use crate::types::Result;

/// Subject prefix for write jobs; the entity kind is appended
pub const WRITE_SUBJECT_PREFIX: &str = "feed.writes";

/// Subject prefix for dead-lettered jobs
pub const DEAD_SUBJECT_PREFIX: &str = "feed.dead";

static LAST_VERSION: AtomicU64 = AtomicU64::new(0);

/// Next submission stamp for this process.
///
/// Microseconds since the epoch, bumped past the previous stamp when two
/// calls land in the same microsecond, so stamps are strictly increasing.
pub fn next_version() -> u64 {
    let now = Utc::now().timestamp_micros().max(0) as u64;
    let previous = LAST_VERSION
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or_else(|last| last);
    now.max(previous + 1)
}

/// Closed set of durable write operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WriteOp {
    /// Insert or replace the entity with `value`
    Create {
        kind: EntityKind,
        key: String,
        value: Fields,
    },
    /// Replace the stored entity with the post-mutation snapshot `value`.
    ///
    /// `mode` records how the change set was applied to the cache.
    Update {
        kind: EntityKind,
        key: String,
        value: Fields,
        #[serde(default)]
        mode: UpdateMode,
    },
    /// Set the notification `read` flag
    MarkNotificationRead { key: String },
    /// Remove the entity
    Delete { kind: EntityKind, key: String },
}

impl WriteOp {
    /// Canonical operation name, e.g. `updatePostInDB`
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { kind, .. } => kind.create_job(),
            Self::Update { kind, .. } => kind.update_job(),
            Self::MarkNotificationRead { .. } => "updateNotification",
            Self::Delete { kind, .. } => kind.delete_job(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Create { kind, .. } | Self::Update { kind, .. } | Self::Delete { kind, .. } => {
                *kind
            }
            Self::MarkNotificationRead { .. } => EntityKind::Notification,
        }
    }

    /// Entity id the job targets
    pub fn key(&self) -> &str {
        match self {
            Self::Create { key, .. }
            | Self::Update { key, .. }
            | Self::MarkNotificationRead { key }
            | Self::Delete { key, .. } => key,
        }
    }

    /// Entity snapshot carried by the job, if any
    pub fn value(&self) -> Option<&Fields> {
        match self {
            Self::Create { value, .. } | Self::Update { value, .. } => Some(value),
            Self::MarkNotificationRead { .. } | Self::Delete { .. } => None,
        }
    }
}

/// A unit of deferred persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteJob {
    pub job_id: Uuid,
    /// Last-write-wins ordering key
    pub version: u64,
    pub submitted_at: DateTime<Utc>,
    pub op: WriteOp,
}

impl WriteJob {
    /// Stamp a new job for `op`
    pub fn new(op: WriteOp) -> Self {
        Self::with_version(op, next_version())
    }

    /// Job for `op` carrying a version stamped earlier, under the cache write
    pub fn with_version(op: WriteOp, version: u64) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            version,
            submitted_at: Utc::now(),
            op,
        }
    }

    pub fn name(&self) -> &'static str {
        self.op.name()
    }

    pub fn key(&self) -> &str {
        self.op.key()
    }

    /// Subject this job is published on
    pub fn subject(&self) -> String {
        format!("{}.{}", WRITE_SUBJECT_PREFIX, self.op.kind().label())
    }

    /// Subject this job is dead-lettered to
    pub fn dead_subject(&self) -> String {
        format!("{}.{}", DEAD_SUBJECT_PREFIX, self.op.kind().label())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
