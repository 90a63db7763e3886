pub mod config;
pub mod documents;
pub mod health;
pub mod jobs;
pub mod query;
pub mod sessions;
