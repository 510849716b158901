use crate::database::Store;
use crate::model::*;
use actix_web::{http::StatusCode, web, HttpResponse, ResponseError};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

type Db = web::Data<dyn Store>;

const SERVER_ERROR: &str = "Error en el servidor";
const NOT_AUTHENTICATED: &str = "Usuario no autenticado";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    Internal(&'static str),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: &self.to_string(),
        })
    }
}

fn log_error<E: std::fmt::Debug>(err: E, message: &'static str) -> ApiError {
    error!("{}: {:?}", message, err);
    ApiError::Internal(message)
}

/// Registers every route and the shared state they need.
pub fn configure(store: Arc<dyn Store>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg: &mut web::ServiceConfig| {
        cfg.app_data(Db::from(store))
            .app_data(json_config())
            .route("/login", web::post().to(login))
            .route("/registro", web::post().to(register))
            .route("/mispelis/{usuario}/{tipo}", web::get().to(my_movies))
            .route("/pelifavorita", web::post().to(save_favorite))
            .route("/pelivista", web::post().to(save_watched))
            .route("/cambiarcategoria/{id}", web::put().to(change_category))
            .route("/borrarpeli/{id}", web::delete().to(delete_movie));
    }
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, req| {
        debug!("Rejected body for {}: {}", req.path(), err);
        ApiError::BadRequest("error en la petición").into()
    })
}

pub async fn not_found() -> Result<HttpResponse, ApiError> {
    Err(ApiError::NotFound("recurso no encontrado"))
}

/// Movie ids are the 24 lowercase hex digits of an ObjectId.
fn parse_id(id: &str) -> Result<ObjectId, ApiError> {
    let invalid = ApiError::BadRequest("Identificador de película no válido");
    if id.len() != 24 || !id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(invalid);
    }
    ObjectId::parse_str(id).map_err(|_| invalid)
}

#[derive(Deserialize)]
struct Credentials {
    #[serde(rename = "usuario")]
    username: String,
    #[serde(rename = "contraseña")]
    password: String,
}

#[derive(Serialize)]
struct Confirmation<'a> {
    mensaje: &'a str,
    usuario: &'a str,
}

async fn login(credentials: web::Json<Credentials>, db: Db) -> Result<HttpResponse, ApiError> {
    let Credentials { username, password } = credentials.into_inner();
    let user = db
        .get_user_by_username(&username)
        .await
        .map_err(|err| log_error(err, SERVER_ERROR))?
        .ok_or(ApiError::BadRequest("Usuario no encontrado"))?;
    let verified = web::block(move || user.verify_password(&password))
        .await
        .map_err(|err| log_error(err, SERVER_ERROR))?;
    if !verified {
        debug!("Wrong password for {}", username);
        return Err(ApiError::BadRequest("Contraseña incorrecta"));
    }
    Ok(HttpResponse::Ok().json(Confirmation {
        mensaje: "Acceso concedido",
        usuario: &username,
    }))
}

async fn register(credentials: web::Json<Credentials>, db: Db) -> Result<HttpResponse, ApiError> {
    let Credentials { username, password } = credentials.into_inner();
    let taken = ApiError::BadRequest("El nombre de usuario ya existe");
    if db
        .get_user_by_username(&username)
        .await
        .map_err(|err| log_error(err, SERVER_ERROR))?
        .is_some()
    {
        return Err(taken);
    }
    let password_hash = web::block(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .map_err(|err| log_error(err, SERVER_ERROR))?
        .map_err(|err| log_error(err, SERVER_ERROR))?;
    let user = User {
        username,
        password: password_hash,
    };
    if !db
        .add_user(&user)
        .await
        .map_err(|err| log_error(err, SERVER_ERROR))?
    {
        return Err(taken);
    }
    Ok(HttpResponse::Created().json(Confirmation {
        mensaje: "Usuario creado con éxito",
        usuario: &user.username,
    }))
}

async fn my_movies(path: web::Path<(String, String)>, db: Db) -> Result<HttpResponse, ApiError> {
    let (owner, tag) = path.into_inner();
    if owner.is_empty() {
        return Err(ApiError::BadRequest(NOT_AUTHENTICATED));
    }
    let movies = db
        .movies_by_tag(&owner, &tag)
        .await
        .map_err(|err| log_error(err, SERVER_ERROR))?;
    Ok(HttpResponse::Ok().json(movies))
}

/// A movie as posted by the client. Anything besides the owner, title and
/// tags is kept as movie details.
#[derive(Deserialize)]
struct MovieParams {
    #[serde(default, rename = "usuario")]
    owner: Option<String>,
    #[serde(alias = "titulo")]
    title: String,
    #[serde(default, rename = "tipo")]
    tags: Option<Tags>,
    #[serde(flatten)]
    details: Map<String, Value>,
}

async fn save_favorite(params: web::Json<MovieParams>, db: Db) -> Result<HttpResponse, ApiError> {
    save_with_tag(FAVORITA, params.into_inner(), db).await
}

async fn save_watched(params: web::Json<MovieParams>, db: Db) -> Result<HttpResponse, ApiError> {
    save_with_tag(VISTA, params.into_inner(), db).await
}

async fn save_with_tag(tag: &str, params: MovieParams, db: Db) -> Result<HttpResponse, ApiError> {
    let owner = match params.owner {
        Some(owner) if !owner.is_empty() => owner,
        _ => return Err(ApiError::BadRequest(NOT_AUTHENTICATED)),
    };
    let mut tags = vec![tag.to_owned()];
    tags.extend(params.tags.map(Tags::into_vec).unwrap_or_default());
    let movie = NewMovie::new(owner, params.title, tags, params.details);
    let saved = db
        .save_movie(movie)
        .await
        .map_err(|err| log_error(err, SERVER_ERROR))?;
    Ok(HttpResponse::Ok().json(saved))
}

#[derive(Deserialize)]
struct CategoryParams {
    #[serde(rename = "tipo")]
    tags: Tags,
}

async fn change_category(
    id: web::Path<String>,
    params: web::Json<CategoryParams>,
    db: Db,
) -> Result<HttpResponse, ApiError> {
    let id = parse_id(&id)?;
    let tags = params.into_inner().tags.into_vec();
    match db
        .change_category(id, tags)
        .await
        .map_err(|err| log_error(err, SERVER_ERROR))?
    {
        Some(movie) => Ok(HttpResponse::Ok().json(movie)),
        None => Err(ApiError::NotFound("Película no encontrada")),
    }
}

async fn delete_movie(id: web::Path<String>, db: Db) -> Result<HttpResponse, ApiError> {
    let id = parse_id(&id)?;
    let deleted = db
        .delete_movie(id)
        .await
        .map_err(|err| log_error(err, SERVER_ERROR))?;
    if deleted == 0 {
        return Err(ApiError::NotFound("Peli no encontrada"));
    }
    Ok(HttpResponse::NoContent().finish())
}
