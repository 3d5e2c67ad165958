pub mod api;
pub mod envelope;
pub mod models;
pub mod timestamp;
