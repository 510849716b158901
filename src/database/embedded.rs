use super::{Error, MovieDb, Result, UserDb};
use crate::model::*;
use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};

const USERS: &[u8] = b"usuariosmp";
const MOVIES: &[u8] = b"pelis";
const MOVIES_OWNER_TITLE: &[u8] = b"pelis_usuario_title";

impl From<TransactionError<serde_json::Error>> for Error {
    fn from(err: TransactionError<serde_json::Error>) -> Self {
        match err {
            TransactionError::Storage(e) => Error::Sled(e),
            TransactionError::Abort(e) => Error::Json(e),
        }
    }
}

type Abortable<T> = std::result::Result<T, ConflictableTransactionError<serde_json::Error>>;

/// Owner length (big endian u64), owner, title. The length prefix keeps
/// owners and titles containing NUL bytes from colliding.
fn owner_title_key(owner: &str, title: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + owner.len() + title.len());
    key.extend_from_slice(&(owner.len() as u64).to_be_bytes());
    key.extend_from_slice(owner.as_bytes());
    key.extend_from_slice(title.as_bytes());
    key
}

fn decode_movie(bytes: &[u8]) -> Abortable<Movie> {
    serde_json::from_slice(bytes).map_err(ConflictableTransactionError::Abort)
}

fn encode_movie(movie: &Movie) -> Abortable<Vec<u8>> {
    serde_json::to_vec(movie).map_err(ConflictableTransactionError::Abort)
}

#[async_trait]
impl UserDb for sled::Db {
    async fn add_user(&self, user: &User) -> Result<bool> {
        let users = self.open_tree(USERS)?;
        let value = serde_json::to_vec(user)?;
        let created: std::result::Result<bool, TransactionError<serde_json::Error>> =
            users.transaction(|users| {
                if users.get(user.username.as_bytes())?.is_some() {
                    return Ok(false);
                }
                users.insert(user.username.as_bytes(), value.as_slice())?;
                Ok(true)
            });
        Ok(created?)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let users = self.open_tree(USERS)?;
        match users.get(username.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MovieDb for sled::Db {
    async fn save_movie(&self, movie: NewMovie) -> Result<Movie> {
        let movies = self.open_tree(MOVIES)?;
        let movies_owner_title = self.open_tree(MOVIES_OWNER_TITLE)?;
        let key = owner_title_key(&movie.owner, &movie.title);
        let saved = (&movies, &movies_owner_title).transaction(|(movies, movies_owner_title)| {
            let existing = match movies_owner_title.get(&key)? {
                Some(id) => movies.get(&id)?.map(|value| (id, value)),
                None => None,
            };
            let (id, saved) = match existing {
                Some((id, value)) => {
                    let mut stored = decode_movie(&value)?;
                    stored.tags = merge_tags(&stored.tags, &movie.tags);
                    (id.to_vec(), stored)
                }
                None => {
                    let id = ObjectId::new();
                    movies_owner_title.insert(key.as_slice(), &id.bytes()[..])?;
                    (id.bytes().to_vec(), movie.clone().into_movie(id))
                }
            };
            movies.insert(id, encode_movie(&saved)?)?;
            Ok(saved)
        })?;
        Ok(saved)
    }

    async fn change_category(&self, id: ObjectId, tags: Vec<String>) -> Result<Option<Movie>> {
        let movies = self.open_tree(MOVIES)?;
        let key = id.bytes();
        let changed = movies.transaction(|movies| {
            let mut movie = match movies.get(&key[..])? {
                Some(value) => decode_movie(&value)?,
                None => return Ok(None),
            };
            if movie.tags == tags {
                return Ok(None);
            }
            movie.tags = tags.clone();
            movies.insert(&key[..], encode_movie(&movie)?)?;
            Ok(Some(movie))
        })?;
        Ok(changed)
    }

    async fn delete_movie(&self, id: ObjectId) -> Result<u64> {
        let movies = self.open_tree(MOVIES)?;
        let movies_owner_title = self.open_tree(MOVIES_OWNER_TITLE)?;
        let key = id.bytes();
        let deleted = (&movies, &movies_owner_title).transaction(|(movies, movies_owner_title)| {
            let movie = match movies.remove(&key[..])? {
                Some(value) => decode_movie(&value)?,
                None => return Ok(0),
            };
            let index_key = owner_title_key(&movie.owner, &movie.title);
            if movies_owner_title.get(&index_key)?.as_deref() == Some(&key[..]) {
                movies_owner_title.remove(index_key)?;
            }
            Ok(1)
        })?;
        Ok(deleted)
    }

    async fn get_movie(&self, id: ObjectId) -> Result<Option<Movie>> {
        let movies = self.open_tree(MOVIES)?;
        match movies.get(id.bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn movies_by_tag(&self, owner: &str, tag: &str) -> Result<Vec<Movie>> {
        let movies = self.open_tree(MOVIES)?;
        let mut found = Vec::new();
        for value in movies.iter().values() {
            let movie: Movie = serde_json::from_slice(&value?)?;
            if movie.owner == owner && movie.tags.iter().any(|t| t == tag) {
                found.push(movie);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn temporary() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn new_movie(owner: &str, title: &str, t: &[&str]) -> NewMovie {
        NewMovie::new(owner.into(), title.into(), tags(t), Map::new())
    }

    #[actix_rt::test]
    async fn save_creates_record_with_fresh_id() {
        let db = temporary();
        let saved = db.save_movie(new_movie("ana", "Dune", &["favorita"])).await.unwrap();
        assert_eq!(saved.id.len(), 24);
        assert_eq!(saved.tags, tags(&["favorita"]));

        let other = db.save_movie(new_movie("ana", "Alien", &["favorita"])).await.unwrap();
        assert_ne!(saved.id, other.id);
        assert_eq!(db.movies_by_tag("ana", "favorita").await.unwrap().len(), 2);
    }

    #[actix_rt::test]
    async fn save_merges_tags_of_existing_record() {
        let db = temporary();
        let first = db.save_movie(new_movie("ana", "Dune", &["vista"])).await.unwrap();
        let merged = db.save_movie(new_movie("ana", "Dune", &["favorita"])).await.unwrap();
        assert_eq!(merged.id, first.id);
        assert_eq!(merged.tags, tags(&["vista", "favorita"]));

        let again = db.save_movie(new_movie("ana", "Dune", &["favorita"])).await.unwrap();
        assert_eq!(again.tags, tags(&["vista", "favorita"]));

        let vistas = db.movies_by_tag("ana", "vista").await.unwrap();
        assert_eq!(vistas, vec![again]);
    }

    #[actix_rt::test]
    async fn save_keeps_owners_apart() {
        let db = temporary();
        let ana = db.save_movie(new_movie("ana", "Dune", &["vista"])).await.unwrap();
        let luis = db.save_movie(new_movie("luis", "Dune", &["vista"])).await.unwrap();
        assert_ne!(ana.id, luis.id);
        assert_eq!(db.movies_by_tag("luis", "vista").await.unwrap(), vec![luis]);
    }

    #[test]
    fn owner_title_keys_do_not_collide() {
        assert_ne!(owner_title_key("a\0b", "c"), owner_title_key("a", "b\0c"));
        assert_ne!(owner_title_key("ab", "c"), owner_title_key("a", "bc"));
    }

    #[actix_rt::test]
    async fn nul_bytes_do_not_merge_across_owners() {
        let db = temporary();
        let first = db.save_movie(new_movie("a\0b", "c", &["vista"])).await.unwrap();
        let second = db.save_movie(new_movie("a", "b\0c", &["favorita"])).await.unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.owner, "a");
        assert_eq!(second.tags, tags(&["favorita"]));
        assert_eq!(db.movies_by_tag("a", "favorita").await.unwrap(), vec![second.clone()]);
        assert_eq!(db.movies_by_tag("a\0b", "vista").await.unwrap(), vec![first.clone()]);

        let second_id = ObjectId::parse_str(&second.id).unwrap();
        assert_eq!(db.delete_movie(second_id).await.unwrap(), 1);
        let merged = db.save_movie(new_movie("a\0b", "c", &["favorita"])).await.unwrap();
        assert_eq!(merged.id, first.id);
        assert_eq!(merged.tags, tags(&["vista", "favorita"]));
    }

    #[actix_rt::test]
    async fn merge_keeps_details_from_creation() {
        let db = temporary();
        let details = json!({"poster_path": "/dune.jpg"}).as_object().cloned().unwrap();
        let first = NewMovie::new("ana".into(), "Dune".into(), tags(&["vista"]), details);
        db.save_movie(first).await.unwrap();
        let details = json!({"poster_path": "/otro.jpg"}).as_object().cloned().unwrap();
        let second = NewMovie::new("ana".into(), "Dune".into(), tags(&["favorita"]), details);
        let merged = db.save_movie(second).await.unwrap();
        assert_eq!(merged.details["poster_path"], json!("/dune.jpg"));
    }

    #[actix_rt::test]
    async fn change_category_replaces_tags() {
        let db = temporary();
        let saved = db.save_movie(new_movie("ana", "Dune", &["vista", "favorita"])).await.unwrap();
        let id = ObjectId::parse_str(&saved.id).unwrap();
        let changed = db.change_category(id, tags(&["favorita"])).await.unwrap().unwrap();
        assert_eq!(changed.tags, tags(&["favorita"]));
        assert_eq!(db.get_movie(id).await.unwrap().unwrap().tags, tags(&["favorita"]));
        assert!(db.movies_by_tag("ana", "vista").await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn change_category_of_unknown_id_is_not_found() {
        let db = temporary();
        assert_eq!(db.change_category(ObjectId::new(), tags(&["vista"])).await.unwrap(), None);
    }

    #[actix_rt::test]
    async fn change_category_to_same_tags_changes_nothing() {
        let db = temporary();
        let saved = db.save_movie(new_movie("ana", "Dune", &["vista"])).await.unwrap();
        let id = ObjectId::parse_str(&saved.id).unwrap();
        assert_eq!(db.change_category(id, tags(&["vista"])).await.unwrap(), None);
    }

    #[actix_rt::test]
    async fn delete_counts_removed_records() {
        let db = temporary();
        assert_eq!(db.delete_movie(ObjectId::new()).await.unwrap(), 0);

        let saved = db.save_movie(new_movie("ana", "Dune", &["vista"])).await.unwrap();
        let id = ObjectId::parse_str(&saved.id).unwrap();
        assert_eq!(db.delete_movie(id).await.unwrap(), 1);
        assert_eq!(db.get_movie(id).await.unwrap(), None);
        assert_eq!(db.delete_movie(id).await.unwrap(), 0);

        let again = db.save_movie(new_movie("ana", "Dune", &["favorita"])).await.unwrap();
        assert_ne!(again.id, saved.id);
        assert_eq!(again.tags, tags(&["favorita"]));
    }

    #[actix_rt::test]
    async fn duplicate_user_is_rejected() {
        let db = temporary();
        let ana = User {
            username: "ana".into(),
            password: "pw1".into(),
        };
        assert!(db.add_user(&ana).await.unwrap());
        let impostor = User {
            username: "ana".into(),
            password: "otra".into(),
        };
        assert!(!db.add_user(&impostor).await.unwrap());
        assert_eq!(db.get_user_by_username("ana").await.unwrap(), Some(ana));
        assert_eq!(db.get_user_by_username("Ana").await.unwrap(), None);
    }
}
