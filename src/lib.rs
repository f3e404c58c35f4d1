pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pdf;
pub mod routes;
pub mod s3;
pub mod schema;
pub mod signature_image;
pub mod signing;
pub mod state;
pub mod storage;
