//! Domain models, request/response DTOs and the application error type.

use axum::{http::StatusCode, response::{IntoResponse, Response}};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Content type recorded for uploads that arrive without one.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    /// bcrypt hash; clients only ever see `UserResponse`.
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn validate_email(email: &str) -> Result<(), AppError> {
        let has_at = email.contains('@');
        let has_dot = email.contains('.');
        let ok_len = email.len() <= 254 && email.len() >= 3;
        if has_at && has_dot && ok_len { Ok(()) } else { Err(AppError::Validation("invalid email format".into())) }
    }

    pub fn validate_username(username: &str) -> Result<(), AppError> {
        let trimmed = username.trim();
        if trimmed.is_empty() { return Err(AppError::Validation("username is required".into())); }
        if trimmed.len() > 64 { return Err(AppError::Validation("username too long (max 64)".into())); }
        Ok(())
    }
}

/// A photo attached to a listing, stored inline as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarImage {
    pub id: Uuid,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl CarImage {
    pub fn new(content_type: Option<String>, data: Vec<u8>) -> Self {
        let content_type = content_type.filter(|c| !c.trim().is_empty()).unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());
        Self { id: Uuid::new_v4(), content_type, data }
    }
}

#[derive(Debug, Clone)]
pub struct Car {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub images: Vec<CarImage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Application-wide error type with variants mapped to HTTP status codes.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")] Validation(String),
    #[error("conflict: {0}")] Conflict(String),
    #[error("user not found")] UserNotFound,
    #[error("invalid password")] InvalidCredentials,
    #[error("not found: {0}")] NotFound(String),
    #[error("unauthorized: {0}")] Unauthorized(String),
    #[error("payload too large: {0}")] PayloadTooLarge(String),
    #[error("error uploading files: {0}")] Upload(String),
    #[error("image processing error: {0}")] Processing(String),
    #[error("jwt error: {0}")] Jwt(String),
    #[error("password error: {0}")] Bcrypt(String),
    #[error("repository error: {0}")] Repo(String),
    #[error("unknown error: {0}")] Unknown(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_)
            | AppError::Conflict(_)
            | AppError::UserNotFound
            | AppError::InvalidCredentials
            | AppError::PayloadTooLarge(_)
            | AppError::Upload(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Processing(_) | AppError::Jwt(_) | AppError::Bcrypt(_) | AppError::Repo(_) | AppError::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show a client. Internal failures collapse to a generic text.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Processing(_) => "error processing car images".into(),
            e if e.status_code().is_server_error() => "server error".into(),
            e => e.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = serde_json::json!({ "error": self.public_message() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<bcrypt::BcryptError> for AppError { fn from(e: bcrypt::BcryptError) -> Self { AppError::Bcrypt(e.to_string()) } }
impl From<jsonwebtoken::errors::Error> for AppError { fn from(e: jsonwebtoken::errors::Error) -> Self { AppError::Jwt(e.to_string()) } }
impl From<sqlx::Error> for AppError { fn from(e: sqlx::Error) -> Self { AppError::Repo(e.to_string()) } }
impl From<image::ImageError> for AppError { fn from(e: image::ImageError) -> Self { AppError::Processing(e.to_string()) } }

// Requests and responses

/// Missing fields deserialize as empty and are rejected by validation, not by the JSON extractor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// Either `email` or `username` identifies the account; both are matched against both columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: String,
}

impl LoginRequest {
    pub fn identifier(&self) -> Option<&str> {
        [self.email.as_deref(), self.username.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self { Self { id: u.id, username: u.username, email: u.email, created_at: u.created_at } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub message: String,
    pub user: UserResponse,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new<M: Into<String>>(message: M) -> Self { Self { message: message.into() } }
}

/// Image metadata returned after a write; the bytes themselves are not echoed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: Uuid,
    pub content_type: String,
    pub size: usize,
}

/// Image as rendered on read paths: resized and inlined as a data URI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderedImage {
    pub id: Uuid,
    pub content_type: String,
    pub src: String,
}

/// Listing as serialized to clients; `I` is the image representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarResponse<I> {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub images: Vec<I>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub type CarSummary = CarResponse<ImageSummary>;
pub type CarView = CarResponse<RenderedImage>;

impl<I> CarResponse<I> {
    pub fn with_images(car: Car, images: Vec<I>) -> Self {
        Self {
            id: car.id,
            owner_id: car.owner_id,
            title: car.title,
            description: car.description,
            tags: car.tags,
            images,
            created_at: car.created_at,
            updated_at: car.updated_at,
        }
    }
}

impl From<Car> for CarSummary {
    fn from(mut car: Car) -> Self {
        let images = std::mem::take(&mut car.images)
            .into_iter()
            .map(|i| ImageSummary { id: i.id, size: i.data.len(), content_type: i.content_type })
            .collect();
        Self::with_images(car, images)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarEnvelope<T> {
    pub message: String,
    pub car: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarsEnvelope {
    pub cars: Vec<CarView>,
}

/// Split a comma-separated tag string, trimming entries and dropping blanks.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|t| !t.is_empty()).map(str::to_string).collect()
}

pub fn now() -> DateTime<Utc> { Utc::now() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation_works() {
        assert!(User::validate_email("a@b.com").is_ok());
        assert!(User::validate_email("invalid").is_err());
    }

    #[test]
    fn login_identifier_prefers_first_non_blank() {
        let req = LoginRequest { email: Some("  ".into()), username: Some("bob".into()), password: "x".into() };
        assert_eq!(req.identifier(), Some("bob"));
        let req = LoginRequest { email: None, username: None, password: "x".into() };
        assert_eq!(req.identifier(), None);
    }

    #[test]
    fn tags_are_trimmed_and_blanks_dropped() {
        assert_eq!(split_tags(" suv, 4x4 ,,blue "), vec!["suv", "4x4", "blue"]);
        assert!(split_tags("").is_empty());
    }

    #[test]
    fn missing_content_type_falls_back() {
        let img = CarImage::new(None, vec![1, 2, 3]);
        assert_eq!(img.content_type, FALLBACK_CONTENT_TYPE);
        let img = CarImage::new(Some("image/png".into()), vec![]);
        assert_eq!(img.content_type, "image/png");
    }

    #[test]
    fn conflict_and_login_failures_are_bad_requests() {
        assert_eq!(AppError::Conflict("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::UserNotFound.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::InvalidCredentials.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NotFound("car".into()).status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn server_errors_are_sanitized() {
        let e = AppError::Repo("connection refused on 10.0.0.3".into());
        assert_eq!(e.public_message(), "server error");
        assert_eq!(AppError::Validation("title is required".into()).public_message(), "validation error: title is required");
    }
}
