mod embedded;
mod mongo;

use crate::model::*;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("BSON error: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("unsupported database url: {0}")]
    UnsupportedUrl(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait UserDb: Send + Sync {
    /// Stores a new user. Returns `false` without touching the store if the
    /// username is already taken.
    async fn add_user(&self, user: &User) -> Result<bool>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
}

#[async_trait]
pub trait MovieDb: Send + Sync {
    /// Creates the movie, or merges its tags into the record that already
    /// exists for the same owner and title. Returns the stored record.
    async fn save_movie(&self, movie: NewMovie) -> Result<Movie>;

    /// Replaces the tag set of a movie. `None` if no movie has that id or
    /// the stored tags were already equal to `tags`.
    async fn change_category(&self, id: ObjectId, tags: Vec<String>) -> Result<Option<Movie>>;

    /// Returns the number of movies removed, 0 or 1.
    async fn delete_movie(&self, id: ObjectId) -> Result<u64>;

    async fn get_movie(&self, id: ObjectId) -> Result<Option<Movie>>;

    async fn movies_by_tag(&self, owner: &str, tag: &str) -> Result<Vec<Movie>>;
}

pub trait Store: UserDb + MovieDb {}

impl<T: UserDb + MovieDb> Store for T {}

/// Opens the store named by `url`: `mongodb://` and `mongodb+srv://` urls
/// connect to MongoDB, `sled:<path>` opens an embedded database (temporary
/// if the path is empty).
pub async fn open(url: &str) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> =
        if url.starts_with("mongodb://") || url.starts_with("mongodb+srv://") {
            Arc::new(mongo::connect(url).await?)
        } else if let Some(path) = url.strip_prefix("sled:") {
            if path.is_empty() {
                Arc::new(sled::Config::new().temporary(true).open()?)
            } else {
                Arc::new(sled::open(path)?)
            }
        } else {
            return Err(Error::UnsupportedUrl(url.to_owned()));
        };
    Ok(store)
}
