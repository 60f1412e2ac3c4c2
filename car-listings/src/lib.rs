// Library crate exposing the application modules so integration tests and the binary share code.
pub mod auth;
pub mod config;
pub mod handlers;
pub mod images;
pub mod listings;
pub mod models;
pub mod repository;
pub mod search;
