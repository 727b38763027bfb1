pub mod auth;
pub mod handler;
pub mod models;
