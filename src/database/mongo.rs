use super::{Error, MovieDb, Result, UserDb};
use crate::model::*;
use async_trait::async_trait;
use futures::TryStreamExt;
use log::{info, warn};
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, Database, IndexModel};

const DEFAULT_DATABASE: &str = "mispelis";
const USERS: &str = "usuariosmp";
const MOVIES: &str = "pelis";
const DUPLICATE_KEY: i32 = 11000;

/// Connects to the database named in the url path, or `mispelis`. The
/// returned handle owns the driver's connection pool and is cheap to share.
pub async fn connect(url: &str) -> Result<Database> {
    let client = Client::with_uri_str(url).await?;
    let db = client
        .default_database()
        .unwrap_or_else(|| client.database(DEFAULT_DATABASE));
    info!("Using MongoDB database {}", db.name());
    ensure_indexes(&db).await;
    Ok(db)
}

/// Unique indexes backing the one-user-per-name and one-movie-per-owner-and-title
/// rules. Existing duplicates make index creation fail; the service still
/// starts, without the guarantee.
async fn ensure_indexes(db: &Database) {
    let unique = || IndexOptions::builder().unique(true).build();
    let users = IndexModel::builder()
        .keys(doc! { "usuario": 1 })
        .options(unique())
        .build();
    if let Err(err) = users_collection(db).create_index(users, None).await {
        warn!("Could not create unique index on {}.usuario: {}", USERS, err);
    }
    let movies = IndexModel::builder()
        .keys(doc! { "usuario": 1, "title": 1 })
        .options(unique())
        .build();
    if let Err(err) = movies_collection(db).create_index(movies, None).await {
        warn!("Could not create unique index on {}.(usuario, title): {}", MOVIES, err);
    }
}

fn users_collection(db: &Database) -> Collection<User> {
    db.collection(USERS)
}

fn movies_collection(db: &Database) -> Collection<Document> {
    db.collection(MOVIES)
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY
        }
        _ => false,
    }
}

fn take_string(doc: &mut Document, key: &str) -> Option<String> {
    match doc.remove(key) {
        Some(Bson::String(value)) => Some(value),
        _ => None,
    }
}

/// Reads a stored movie. Documents written by older clients may carry the
/// title under `titulo` and a single tag as a plain string.
fn movie_from_document(mut doc: Document) -> Result<Movie> {
    let id = match doc.remove("_id") {
        Some(Bson::ObjectId(id)) => id.to_hex(),
        other => return Err(Error::Malformed(format!("movie without ObjectId: {:?}", other))),
    };
    let owner = take_string(&mut doc, "usuario")
        .ok_or_else(|| Error::Malformed(format!("movie {} without usuario", id)))?;
    let legacy_title = take_string(&mut doc, "titulo");
    let title = take_string(&mut doc, "title")
        .or(legacy_title)
        .ok_or_else(|| Error::Malformed(format!("movie {} without title", id)))?;
    let tags = match doc.remove("tipo") {
        Some(Bson::Array(values)) => values
            .into_iter()
            .filter_map(|value| match value {
                Bson::String(tag) => Some(tag),
                _ => None,
            })
            .collect(),
        Some(Bson::String(tag)) => vec![tag],
        _ => Vec::new(),
    };
    let details = doc
        .into_iter()
        .map(|(key, value)| (key, value.into_relaxed_extjson()))
        .collect();
    Ok(Movie {
        id,
        owner,
        title,
        tags,
        details,
    })
}

/// Update pipeline for save-or-merge. A stored `tipo` may be an array or, in
/// documents written by older clients, a single string; either way it ends up
/// an array holding the previous tags followed by the new ones. Details are
/// only written when the upsert creates the document, i.e. `tipo` is still
/// missing. Detail keys are plain field names (see `NewMovie::new`).
fn merge_pipeline(movie: &NewMovie) -> Result<Vec<Document>> {
    let mut stages = Vec::new();
    if !movie.details.is_empty() {
        let created = doc! { "$eq": [{ "$type": "$tipo" }, "missing"] };
        let mut fields = Document::new();
        for (key, value) in &movie.details {
            let value = bson::to_bson(value)?;
            fields.insert(
                key.clone(),
                doc! { "$cond": [created.clone(), { "$literal": value }, format!("${}", key)] },
            );
        }
        stages.push(doc! { "$set": fields });
    }
    let previous = doc! {
        "$cond": [
            { "$isArray": ["$tipo"] },
            "$tipo",
            { "$cond": [{ "$eq": [{ "$type": "$tipo" }, "string"] }, ["$tipo"], []] }
        ]
    };
    let added = doc! {
        "$filter": {
            "input": { "$literal": movie.tags.clone() },
            "cond": { "$not": [{ "$in": ["$$this", "$$previous"] }] }
        }
    };
    stages.push(doc! {
        "$set": {
            "tipo": {
                "$let": {
                    "vars": { "previous": previous },
                    "in": { "$concatArrays": ["$$previous", added] }
                }
            }
        }
    });
    Ok(stages)
}

#[async_trait]
impl UserDb for Database {
    async fn add_user(&self, user: &User) -> Result<bool> {
        let users = users_collection(self);
        if users.find_one(doc! { "usuario": user.username.as_str() }, None).await?.is_some() {
            return Ok(false);
        }
        match users.insert_one(user, None).await {
            Ok(_) => Ok(true),
            Err(err) if is_duplicate_key(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(users_collection(self)
            .find_one(doc! { "usuario": username }, None)
            .await?)
    }
}

#[async_trait]
impl MovieDb for Database {
    async fn save_movie(&self, movie: NewMovie) -> Result<Movie> {
        let filter = doc! { "usuario": movie.owner.as_str(), "title": movie.title.as_str() };
        let update = merge_pipeline(&movie)?;
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let saved = movies_collection(self)
            .find_one_and_update(filter, update, options)
            .await?
            .ok_or_else(|| {
                Error::Malformed(format!("upsert of {:?} returned nothing", movie.title))
            })?;
        movie_from_document(saved)
    }

    async fn change_category(&self, id: ObjectId, tags: Vec<String>) -> Result<Option<Movie>> {
        let movies = movies_collection(self);
        let result = movies
            .update_one(doc! { "_id": id }, doc! { "$set": { "tipo": tags } }, None)
            .await?;
        if result.modified_count != 1 {
            return Ok(None);
        }
        match movies.find_one(doc! { "_id": id }, None).await? {
            Some(doc) => Ok(Some(movie_from_document(doc)?)),
            None => Ok(None),
        }
    }

    async fn delete_movie(&self, id: ObjectId) -> Result<u64> {
        let result = movies_collection(self)
            .delete_one(doc! { "_id": id }, None)
            .await?;
        Ok(result.deleted_count)
    }

    async fn get_movie(&self, id: ObjectId) -> Result<Option<Movie>> {
        match movies_collection(self).find_one(doc! { "_id": id }, None).await? {
            Some(doc) => Ok(Some(movie_from_document(doc)?)),
            None => Ok(None),
        }
    }

    async fn movies_by_tag(&self, owner: &str, tag: &str) -> Result<Vec<Movie>> {
        let options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        let docs: Vec<Document> = movies_collection(self)
            .find(doc! { "usuario": owner, "tipo": tag }, options)
            .await?
            .try_collect()
            .await?;
        docs.into_iter().map(movie_from_document).collect()
    }
}
