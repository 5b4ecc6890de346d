//! Feed mutation routes
//!
//! Handlers parse the request, call the matching coordinator and shape the
//! JSON response. A queue failure after the cache write still answers with
//! the success message, as `202 Accepted` and `"degraded": true`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Response, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cache::compute_etag;
use crate::db::schemas::METADATA_FIELD;
use crate::entity::{entity_id, Fields, UpdateMode};
use crate::server::AppState;
use crate::types::{FeedError, Result};

pub const API_PREFIX: &str = "/api/v1/";

const MAX_ID_LEN: usize = 128;

/// Routed API call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    CreatePost,
    GetPost(&'a str),
    PatchPost(&'a str),
    PutPost(&'a str),
    PutPostImage(&'a str),
    DeletePost(&'a str),
    AddComment,
    AddReaction,
    RemoveReaction(&'a str),
    MarkNotificationRead(&'a str),
    DeleteNotification(&'a str),
}

impl<'a> Route<'a> {
    pub fn parse(method: &Method, path: &'a str) -> Option<Self> {
        let rest = path.strip_prefix(API_PREFIX)?.trim_end_matches('/');

        if let Some(post) = rest.strip_prefix("post") {
            return match (method, post) {
                (&Method::POST, "") => Some(Self::CreatePost),
                (&Method::POST, "/comment") => Some(Self::AddComment),
                (&Method::POST, "/reaction") => Some(Self::AddReaction),
                (&Method::PUT, p) if p.starts_with("/image/") => {
                    single_segment(&p["/image/".len()..]).map(Self::PutPostImage)
                }
                (&Method::DELETE, p) if p.starts_with("/reaction/") => {
                    single_segment(&p["/reaction/".len()..]).map(Self::RemoveReaction)
                }
                (m, p) if p.starts_with('/') => {
                    let id = single_segment(&p[1..])?;
                    match *m {
                        Method::GET => Some(Self::GetPost(id)),
                        Method::PATCH => Some(Self::PatchPost(id)),
                        Method::PUT => Some(Self::PutPost(id)),
                        Method::DELETE => Some(Self::DeletePost(id)),
                        _ => None,
                    }
                }
                _ => None,
            };
        }

        if let Some(id) = rest.strip_prefix("notification/") {
            let id = single_segment(id)?;
            return match *method {
                Method::PUT => Some(Self::MarkNotificationRead(id)),
                Method::DELETE => Some(Self::DeleteNotification(id)),
                _ => None,
            };
        }

        None
    }
}

fn single_segment(s: &str) -> Option<&str> {
    if s.is_empty() || s.contains('/') {
        None
    } else {
        Some(s)
    }
}

/// Handle an API request; `None` when no route matches
pub async fn dispatch(
    state: &AppState,
    method: &Method,
    path: &str,
    body: &[u8],
) -> Option<Response<Full<Bytes>>> {
    let route = Route::parse(method, path)?;
    Some(match handle(state, route, body).await {
        Ok(response) => response,
        Err((e, message)) if e.is_degraded_success() => degraded_response(message),
        Err((e, _)) => error_response(&e),
    })
}

type Handled = std::result::Result<Response<Full<Bytes>>, (FeedError, &'static str)>;

async fn handle(state: &AppState, route: Route<'_>, body: &[u8]) -> Handled {
    match route {
        Route::CreatePost => {
            const MSG: &str = "Post created successfully";
            let (id, fields) = new_entity(body).map_err(|e| (e, MSG))?;
            let post = state.posts.create(&id, &fields).await.map_err(|e| (e, MSG))?;
            Ok(success(StatusCode::CREATED, MSG, Some(("post", post))))
        }
        Route::GetPost(id) => {
            let id = valid_id(id).map_err(|e| (e, ""))?;
            match state.posts.get(id).await.map_err(|e| (e, ""))? {
                Some(post) => Ok(entity_response(post)),
                None => Err((FeedError::NotFound(format!("post {}", id)), "")),
            }
        }
        Route::PatchPost(id) => {
            const MSG: &str = "Post updated successfully";
            let post = update_post(state, id, body, UpdateMode::Merge)
                .await
                .map_err(|e| (e, MSG))?;
            Ok(success(StatusCode::OK, MSG, Some(("post", post))))
        }
        Route::PutPost(id) => {
            const MSG: &str = "Post updated successfully";
            let post = update_post(state, id, body, UpdateMode::Replace)
                .await
                .map_err(|e| (e, MSG))?;
            Ok(success(StatusCode::OK, MSG, Some(("post", post))))
        }
        Route::PutPostImage(id) => {
            const MSG: &str = "Post with image updated successfully";
            let post = async {
                let id = valid_id(id)?;
                let changes = parse_object(body)?;
                state
                    .posts
                    .apply_with_media(id, &changes, state.uploader.as_ref())
                    .await
            }
            .await
            .map_err(|e| (e, MSG))?;
            Ok(success(StatusCode::OK, MSG, Some(("post", post))))
        }
        Route::DeletePost(id) => {
            const MSG: &str = "Post deleted successfully";
            let id = valid_id(id).map_err(|e| (e, MSG))?;
            state.posts.delete(id).await.map_err(|e| (e, MSG))?;
            Ok(success(StatusCode::OK, MSG, None))
        }
        Route::AddComment => {
            const MSG: &str = "Comment added successfully";
            let (id, fields) = new_child_entity(body).map_err(|e| (e, MSG))?;
            let comment = state.comments.create(&id, &fields).await.map_err(|e| (e, MSG))?;
            Ok(success(StatusCode::CREATED, MSG, Some(("comment", comment))))
        }
        Route::AddReaction => {
            const MSG: &str = "Reaction added successfully";
            let (id, fields) = new_child_entity(body).map_err(|e| (e, MSG))?;
            let reaction = state.reactions.create(&id, &fields).await.map_err(|e| (e, MSG))?;
            Ok(success(StatusCode::CREATED, MSG, Some(("reaction", reaction))))
        }
        Route::RemoveReaction(id) => {
            const MSG: &str = "Reaction removed from post";
            let id = valid_id(id).map_err(|e| (e, MSG))?;
            state.reactions.delete(id).await.map_err(|e| (e, MSG))?;
            Ok(success(StatusCode::OK, MSG, None))
        }
        Route::MarkNotificationRead(id) => {
            const MSG: &str = "Notification marked as read";
            let id = valid_id(id).map_err(|e| (e, MSG))?;
            state.notifications.mark_read(id).await.map_err(|e| (e, MSG))?;
            Ok(success(StatusCode::OK, MSG, None))
        }
        Route::DeleteNotification(id) => {
            const MSG: &str = "Notification deleted successfully";
            let id = valid_id(id).map_err(|e| (e, MSG))?;
            state.notifications.delete(id).await.map_err(|e| (e, MSG))?;
            Ok(success(StatusCode::OK, MSG, None))
        }
    }
}

async fn update_post(state: &AppState, id: &str, body: &[u8], mode: UpdateMode) -> Result<Fields> {
    let id = valid_id(id)?;
    let changes = parse_object(body)?;
    state.posts.apply(id, &changes, mode).await
}

fn valid_id(id: &str) -> Result<&str> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(FeedError::BadRequest(format!("Invalid id: {:?}", id)));
    }
    Ok(id)
}

/// Request body as a JSON object
fn parse_object(body: &[u8]) -> Result<Fields> {
    if body.is_empty() {
        return Err(FeedError::BadRequest("Request body is required".into()));
    }
    match serde_json::from_slice::<Value>(body)? {
        Value::Object(fields) => {
            check_field_names(&fields)?;
            Ok(fields)
        }
        _ => Err(FeedError::BadRequest("Request body must be a JSON object".into())),
    }
}

/// Top-level names must be plain document fields the store can write as-is
fn check_field_names(fields: &Fields) -> Result<()> {
    for name in fields.keys() {
        if name.is_empty() || name == METADATA_FIELD || name.starts_with('$') || name.contains('.') {
            return Err(FeedError::BadRequest(format!("Invalid field name: {:?}", name)));
        }
    }
    Ok(())
}

/// Fields for a new entity; the id comes from `_id` or is generated
fn new_entity(body: &[u8]) -> Result<(String, Fields)> {
    let fields = parse_object(body)?;
    let id = match entity_id(&fields) {
        Some(id) => valid_id(id)?.to_string(),
        None => Uuid::new_v4().to_string(),
    };
    Ok((id, fields))
}

/// Like [`new_entity`], for entities attached to a post
fn new_child_entity(body: &[u8]) -> Result<(String, Fields)> {
    let (id, fields) = new_entity(body)?;
    match fields.get("postId") {
        Some(Value::String(post_id)) if !post_id.is_empty() => Ok((id, fields)),
        _ => Err(FeedError::BadRequest("postId is required".into())),
    }
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn success(status: StatusCode, message: &str, entity: Option<(&str, Fields)>) -> Response<Full<Bytes>> {
    let mut body = json!({ "message": message });
    if let (Some((name, fields)), Some(object)) = (entity, body.as_object_mut()) {
        object.insert(name.to_string(), Value::Object(fields));
    }
    json_response(status, body)
}

/// Cached entity with an ETag over its JSON form
fn entity_response(fields: Fields) -> Response<Full<Bytes>> {
    let json_body = Value::Object(fields).to_string();
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .header("ETag", compute_etag(json_body.as_bytes()))
        .body(Full::new(Bytes::from(json_body)))
        .unwrap()
}

/// Mutation visible in cache and broadcast, durable write not yet queued
fn degraded_response(message: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::ACCEPTED,
        json!({ "message": message, "degraded": true }),
    )
}

/// JSON error body with the status of the error kind
pub fn error_response(err: &FeedError) -> Response<Full<Bytes>> {
    json_response(
        err.status_code(),
        json!({ "error": err.kind(), "message": err.to_string() }),
    )
}
