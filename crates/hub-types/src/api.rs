use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- JWT Claims --

/// JWT claims shared across hub-api (token issuing, REST middleware) and
/// hub-gateway (WebSocket upgrade verification).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub exp: usize,
}

// -- Users --

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// Body returned by both user creation and login. The token itself travels
/// in the `Authorization` response header.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub user_id: Uuid,
    pub email: String,
}

// -- Server info --

#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub name: String,
    pub protocol_version: u16,
    pub action_tags: Vec<String>,
}
