//! Entity model for the feed write path
//!
//! Entities are JSON documents identified by their `_id` field. Each entity
//! type is described by an [`EntityKind`], which carries everything the write
//! path needs to know about it: cache key prefix, durable collection, broadcast
//! event names and topic, and the canonical queue operation names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field holding the entity id in every document
pub const ID_FIELD: &str = "_id";

/// A JSON object: either a full entity or a change set
pub type Fields = Map<String, Value>;

/// Read the entity id out of a document
pub fn entity_id(fields: &Fields) -> Option<&str> {
    fields.get(ID_FIELD).and_then(Value::as_str)
}

/// How a change set is applied onto an existing entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Only the fields present in the change set are written
    #[default]
    Merge,
    /// The change set becomes the new field set; `_id` is kept
    Replace,
}

impl UpdateMode {
    /// Apply `changes` onto `current` in place.
    ///
    /// `_id` in the change set is ignored; `id` is always written back so the
    /// result stays addressable.
    pub fn apply(self, current: &mut Fields, changes: &Fields, id: &str) {
        if self == UpdateMode::Replace {
            current.clear();
        }
        for (field, value) in changes {
            if field != ID_FIELD {
                current.insert(field.clone(), value.clone());
            }
        }
        current.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    }
}

/// Closed set of entity types handled by the write path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Post,
    Notification,
    Comment,
    Reaction,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Post,
        EntityKind::Notification,
        EntityKind::Comment,
        EntityKind::Reaction,
    ];

    /// Singular label used in event names and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Notification => "notification",
            Self::Comment => "comment",
            Self::Reaction => "reaction",
        }
    }

    /// Prefix for fast cache keys
    pub fn cache_prefix(&self) -> &'static str {
        self.collection()
    }

    /// Durable store collection name
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Post => "posts",
            Self::Notification => "notifications",
            Self::Comment => "comments",
            Self::Reaction => "reactions",
        }
    }

    /// Broadcast room scoping events of this kind, if the kind is grouped.
    ///
    /// Comments and reactions are shown inside the feed, so they share the
    /// post room. Notifications go to everyone connected.
    pub fn topic(&self) -> Option<&'static str> {
        match self {
            Self::Post | Self::Comment | Self::Reaction => Some("posts"),
            Self::Notification => None,
        }
    }

    pub fn add_event(&self) -> &'static str {
        match self {
            Self::Post => "add post",
            Self::Notification => "insert notification",
            Self::Comment => "add comment",
            Self::Reaction => "add reaction",
        }
    }

    pub fn update_event(&self) -> &'static str {
        match self {
            Self::Post => "update post",
            Self::Notification => "update notification",
            Self::Comment => "update comment",
            Self::Reaction => "update reaction",
        }
    }

    pub fn delete_event(&self) -> &'static str {
        match self {
            Self::Post => "delete post",
            Self::Notification => "delete notification",
            Self::Comment => "delete comment",
            Self::Reaction => "remove reaction",
        }
    }

    /// Canonical queue operation name for creates
    pub fn create_job(&self) -> &'static str {
        match self {
            Self::Post => "addPostToDB",
            Self::Notification => "addNotificationToDB",
            Self::Comment => "addCommentToDB",
            Self::Reaction => "addReactionToDB",
        }
    }

    /// Canonical queue operation name for updates
    pub fn update_job(&self) -> &'static str {
        match self {
            Self::Post => "updatePostInDB",
            Self::Notification => "updateNotificationInDB",
            Self::Comment => "updateCommentInDB",
            Self::Reaction => "updateReactionInDB",
        }
    }

    /// Canonical queue operation name for deletes
    pub fn delete_job(&self) -> &'static str {
        match self {
            Self::Post => "deletePostFromDB",
            Self::Notification => "deleteNotification",
            Self::Comment => "deleteCommentFromDB",
            Self::Reaction => "removeReactionFromDB",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Type-level entity descriptor for the generic coordinator
pub trait EntityType: Send + Sync + 'static {
    const KIND: EntityKind;
}

/// Feed post
pub struct Post;

/// User notification (supports the lightweight mark-read mutation)
pub struct Notification;

/// Comment on a post
pub struct Comment;

/// Reaction on a post
pub struct Reaction;

impl EntityType for Post {
    const KIND: EntityKind = EntityKind::Post;
}

impl EntityType for Notification {
    const KIND: EntityKind = EntityKind::Notification;
}

impl EntityType for Comment {
    const KIND: EntityKind = EntityKind::Comment;
}

impl EntityType for Reaction {
    const KIND: EntityKind = EntityKind::Reaction;
}
