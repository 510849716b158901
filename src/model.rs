use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use mongodb::bson::oid::ObjectId;

pub const FAVORITA: &str = "favorita";
pub const VISTA: &str = "vista";

/// Keys of a movie document that are owned by the store, never by the client.
pub const RESERVED_KEYS: &[&str] = &["_id", "usuario", "title", "titulo", "tipo"];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    #[serde(rename = "usuario")]
    pub username: String,
    /// A bcrypt hash, or the plaintext password for accounts created before
    /// passwords were hashed.
    #[serde(rename = "contraseña")]
    pub password: String,
}

impl User {
    pub fn verify_password(&self, password: &str) -> bool {
        match bcrypt::verify(password, &self.password) {
            Ok(matches) => matches,
            Err(_) => self.password == password,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Movie {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "usuario")]
    pub owner: String,
    pub title: String,
    #[serde(rename = "tipo")]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// A movie as submitted by a client, before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMovie {
    pub owner: String,
    pub title: String,
    pub tags: Vec<String>,
    pub details: Map<String, Value>,
}

impl NewMovie {
    pub fn new(
        owner: String,
        title: String,
        tags: Vec<String>,
        mut details: Map<String, Value>,
    ) -> Self {
        details.retain(|key, _| is_detail_key(key));
        NewMovie {
            owner,
            title,
            tags: merge_tags(&[], &tags),
            details,
        }
    }

    pub fn into_movie(self, id: ObjectId) -> Movie {
        Movie {
            id: id.to_hex(),
            owner: self.owner,
            title: self.title,
            tags: self.tags,
            details: self.details,
        }
    }
}

/// Detail keys must not shadow store-owned fields, and must be plain field
/// names for MongoDB (no `$` prefix, no `.` path separator).
fn is_detail_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('$')
        && !key.contains('.')
        && !RESERVED_KEYS.contains(&key)
}

/// A category value: either a single tag or a list of tags.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Tags {
    One(String),
    Many(Vec<String>),
}

impl Tags {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Tags::One(tag) => vec![tag],
            Tags::Many(tags) => merge_tags(&[], &tags),
        }
    }
}

/// Set union of two tag lists. Existing tags keep their position, new ones
/// are appended in arrival order.
pub fn merge_tags(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(existing.len() + incoming.len());
    for tag in existing.iter().chain(incoming) {
        if !merged.contains(tag) {
            merged.push(tag.clone());
        }
    }
    merged
}
