use std::sync::Arc;
use axum::{debug_handler, extract::{DefaultBodyLimit, Multipart, Query, State}, http::{HeaderMap, StatusCode}, response::IntoResponse, routing::{delete, get, post, put}, Json, Router};
use serde::Deserialize;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{
    auth::{bearer_from_headers, AuthService},
    images::ImageProcessor,
    listings::{ListingPatch, ListingService, NewListing, MAX_PHOTOS, MAX_PHOTO_BYTES},
    models::{now, split_tags, AppError, CarEnvelope, CarImage, CarSummary, CarsEnvelope, LoginRequest, LoginResponse, MessageResponse, RegisterRequest, User},
    repository::Repositories,
};

/// Request body cap: a full set of photos plus room for the text fields.
pub const MAX_BODY_BYTES: usize = MAX_PHOTOS * MAX_PHOTO_BYTES + 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub repos: Repositories,
    pub auth: Arc<dyn AuthService>,
    pub listings: ListingService,
    pub db: Option<PgPool>,
    pub redis: Option<redis::Client>,
}

impl AppState {
    pub fn new(repos: Repositories, auth: Arc<dyn AuthService>, image_workers: usize, db: Option<PgPool>, redis: Option<redis::Client>) -> Self {
        let listings = ListingService::new(repos.cars.clone(), ImageProcessor::new(image_workers));
        Self { repos, auth, listings, db, redis }
    }
}

pub fn app(state: AppState) -> Router {
    let car_routes = Router::new()
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/add-car", post(add_car))
        .route("/get-cars", get(get_cars))
        .route("/update-car", put(update_car))
        .route("/delete-car", delete(delete_car))
        .route("/global-search", get(global_search));

    Router::new()
        .nest("/cars", car_routes)
        .route("/healthz", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery { token: Option<String> }

#[derive(Debug, Default, Deserialize)]
pub struct GetCarsQuery {
    token: Option<String>,
    #[serde(rename = "carID")]
    car_id: Option<String>,
    keyword: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CarIdQuery {
    token: Option<String>,
    #[serde(rename = "carID")]
    car_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery { keyword: Option<String> }

fn optional_car_id(raw: Option<&str>) -> Result<Option<Uuid>, AppError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => Uuid::parse_str(s).map(Some).map_err(|_| AppError::Validation("invalid carID".into())),
    }
}

fn required_car_id(raw: Option<&str>) -> Result<Uuid, AppError> {
    optional_car_id(raw)?.ok_or_else(|| AppError::Validation("carID is required".into()))
}

/// The session token comes from the Authorization header, or the `token` query parameter.
fn request_token(headers: &HeaderMap, query_token: Option<&str>) -> Result<String, AppError> {
    bearer_from_headers(headers)
        .or_else(|| query_token.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string))
        .ok_or_else(|| AppError::Unauthorized("missing token".into()))
}

async fn current_user(state: &AppState, headers: &HeaderMap, query_token: Option<&str>) -> Result<User, AppError> {
    let token = request_token(headers, query_token)?;
    let user_id = state.auth.user_id_from_token(&token).await?;
    match state.repos.users.find_by_id(user_id).await {
        Err(AppError::UserNotFound) => Err(AppError::Unauthorized("unknown user".into())),
        other => other,
    }
}

#[debug_handler]
pub async fn signup(State(state): State<AppState>, Json(payload): Json<RegisterRequest>) -> Result<impl IntoResponse, AppError> {
    let username = payload.username.trim().to_string();
    let email = payload.email.trim().to_lowercase();
    User::validate_username(&username)?;
    User::validate_email(&email)?;
    if payload.password.is_empty() { return Err(AppError::Validation("password is required".into())); }
    if state.repos.users.exists(&username, &email).await? {
        return Err(AppError::Conflict("username or email already exists".into()));
    }
    let password_hash = state.auth.hash_password(payload.password).await?;
    let user = state.repos.users.create(User { id: Uuid::new_v4(), username, email, password_hash, created_at: now() }).await?;
    tracing::info!(user_id = %user.id, "user registered");
    Ok((StatusCode::CREATED, Json(MessageResponse::new("User registered successfully"))))
}

#[debug_handler]
pub async fn login(State(state): State<AppState>, Json(payload): Json<LoginRequest>) -> Result<impl IntoResponse, AppError> {
    let identifier = payload.identifier().ok_or_else(|| AppError::Validation("email or username is required".into()))?.to_string();
    let user = state.repos.users.find_by_login(&identifier).await?.ok_or(AppError::UserNotFound)?;
    let ok = state.auth.verify_password(payload.password, user.password_hash.clone()).await?;
    if !ok { return Err(AppError::InvalidCredentials); }
    let token = state.auth.generate_token(user.id).await?;
    Ok(Json(LoginResponse { message: "Login successful".into(), user: user.into(), token }))
}

pub async fn logout(State(state): State<AppState>, Query(q): Query<TokenQuery>, headers: HeaderMap) -> Result<impl IntoResponse, AppError> {
    let token = request_token(&headers, q.token.as_deref())?;
    state.auth.logout(&token).await?;
    Ok(Json(MessageResponse::new("Logged out")))
}

/// Text fields and photo parts of an add-car or update-car form.
#[derive(Debug, Default)]
struct ListingForm {
    title: Option<String>,
    description: Option<String>,
    tags: Option<Vec<String>>,
    keep_image_ids: Option<Vec<Uuid>>,
    photos: Vec<CarImage>,
}

fn upload_error(e: axum::extract::multipart::MultipartError) -> AppError { AppError::Upload(e.body_text()) }

/// A `photos` part with a filename is an upload; without one it is the JSON list of image ids to keep.
async fn read_listing_form(mut multipart: Multipart) -> Result<ListingForm, AppError> {
    let mut form = ListingForm::default();
    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let is_file = field.file_name().is_some();
        // Browsers send a file input left blank as `filename=""` with no body.
        let blank_file = field.file_name().map_or(false, |f| f.trim().is_empty());
        match (name.as_str(), is_file) {
            ("photos", true) if blank_file => continue,
            ("photos", true) => {
                if form.photos.len() >= MAX_PHOTOS {
                    return Err(AppError::PayloadTooLarge(format!("at most {} photos per request", MAX_PHOTOS)));
                }
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(upload_error)?;
                if data.is_empty() { continue; }
                if data.len() > MAX_PHOTO_BYTES {
                    return Err(AppError::PayloadTooLarge(format!("photo exceeds the {} byte limit", MAX_PHOTO_BYTES)));
                }
                form.photos.push(CarImage::new(content_type, data.to_vec()));
            }
            ("photos", false) => {
                let raw = field.text().await.map_err(upload_error)?;
                let ids: Vec<String> = serde_json::from_str(&raw).map_err(|_| AppError::Validation("photos must be a JSON array of image ids".into()))?;
                // Ids that do not parse cannot name any stored image.
                form.keep_image_ids = Some(ids.iter().filter_map(|s| Uuid::parse_str(s.trim()).ok()).collect());
            }
            (_, true) => return Err(AppError::Upload(format!("unexpected file field `{}`", name))),
            ("title", false) => form.title = Some(field.text().await.map_err(upload_error)?),
            ("description", false) => form.description = Some(field.text().await.map_err(upload_error)?),
            ("tags", false) | ("tags[]", false) => {
                let raw = field.text().await.map_err(upload_error)?;
                if !raw.trim().is_empty() {
                    form.tags.get_or_insert_with(Vec::new).extend(split_tags(&raw));
                }
            }
            _ => tracing::debug!(field = %name, "ignoring unknown form field"),
        }
    }
    Ok(form)
}

pub async fn add_car(State(state): State<AppState>, Query(q): Query<TokenQuery>, headers: HeaderMap, multipart: Multipart) -> Result<impl IntoResponse, AppError> {
    let user = current_user(&state, &headers, q.token.as_deref()).await?;
    let form = read_listing_form(multipart).await?;
    let input = NewListing { title: form.title, description: form.description, tags: form.tags.unwrap_or_default(), photos: form.photos };
    let car = state.listings.add(user.id, input).await?;
    Ok((StatusCode::CREATED, Json(CarEnvelope { message: "Car added successfully".into(), car: CarSummary::from(car) })))
}

pub async fn get_cars(State(state): State<AppState>, Query(q): Query<GetCarsQuery>, headers: HeaderMap) -> Result<impl IntoResponse, AppError> {
    let user = current_user(&state, &headers, q.token.as_deref()).await?;
    let car_id = optional_car_id(q.car_id.as_deref())?;
    let cars = state.listings.list(user.id, car_id, q.keyword.as_deref()).await?;
    Ok(Json(CarsEnvelope { cars }))
}

pub async fn update_car(State(state): State<AppState>, Query(q): Query<CarIdQuery>, headers: HeaderMap, multipart: Multipart) -> Result<impl IntoResponse, AppError> {
    let car_id = required_car_id(q.car_id.as_deref())?;
    let user = current_user(&state, &headers, q.token.as_deref()).await?;
    let form = read_listing_form(multipart).await?;
    let patch = ListingPatch { title: form.title, description: form.description, tags: form.tags, keep_image_ids: form.keep_image_ids, new_photos: form.photos };
    let car = state.listings.update(user.id, car_id, patch).await?;
    Ok(Json(CarEnvelope { message: "Car updated successfully".into(), car: CarSummary::from(car) }))
}

pub async fn delete_car(State(state): State<AppState>, Query(q): Query<CarIdQuery>, headers: HeaderMap) -> Result<impl IntoResponse, AppError> {
    let car_id = required_car_id(q.car_id.as_deref())?;
    let user = current_user(&state, &headers, q.token.as_deref()).await?;
    state.listings.delete(user.id, car_id).await?;
    Ok(Json(MessageResponse::new("Car deleted successfully.")))
}

pub async fn global_search(State(state): State<AppState>, Query(q): Query<SearchQuery>) -> Result<impl IntoResponse, AppError> {
    let cars = state.listings.global_search(q.keyword.as_deref()).await?;
    Ok(Json(CarsEnvelope { cars }))
}

/// Reports each configured backend; `null` means the backend is not in use.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let postgres = match &state.db {
        Some(pool) => Some(sqlx::query("SELECT 1").fetch_one(pool).await.is_ok()),
        None => None,
    };

    let redis = match &state.redis {
        Some(client) => Some(match client.get_async_connection().await {
            Ok(mut conn) => redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok(),
            Err(_) => false,
        }),
        None => None,
    };

    if postgres.unwrap_or(true) && redis.unwrap_or(true) {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ok", "postgres": postgres, "redis": redis })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "status": "degraded", "postgres": postgres, "redis": redis })))
    }
}
