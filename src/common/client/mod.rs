pub mod client;
pub mod error;
pub mod models;

pub use client::CivitaiClient;
pub use error::ApiError;
