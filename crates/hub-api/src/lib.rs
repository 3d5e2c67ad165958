pub mod auth;
pub mod channels;
pub mod middleware;

pub use auth::{AppState, AppStateInner};
