use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{error, info, warn};
use uuid::Uuid;

use hub_db::Store;
use hub_gateway::TokenVerifier;
use hub_types::api::{Claims, CreateUserRequest, LoginRequest, UserResponse};
use hub_types::models::User;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: Arc<dyn Store>,
    pub verifier: TokenVerifier,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
}

impl AppStateInner {
    pub fn new(store: Arc<dyn Store>, jwt_secret: String, token_ttl: chrono::Duration) -> Self {
        Self {
            verifier: TokenVerifier::new(&jwt_secret, store.clone()),
            store,
            jwt_secret,
            token_ttl,
        }
    }
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Response, StatusCode> {
    let email = req.email.trim().to_string();
    if !is_plausible_email(&email) || req.password.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Hashing and the insert both block; keep them off the async runtime
    let store = state.store.clone();
    let new_email = email.clone();
    let user = tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
            .to_string();
        store.create_user(&new_email, &password_hash)
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|e| { error!("Failed to create user: {:#}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .ok_or_else(|| {
        warn!("Email {} is already registered", email);
        StatusCode::CONFLICT
    })?;

    info!("Created user {} ({})", user.email, user.id);
    authorized(&state, user)
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, StatusCode> {
    let store = state.store.clone();
    let email = req.email.trim().to_string();
    let user = tokio::task::spawn_blocking(move || {
        let Some((user, password_hash)) = store.get_user_credentials(&email)? else {
            return Ok(None);
        };
        let parsed = PasswordHash::new(&password_hash)
            .map_err(|e| anyhow::anyhow!("stored hash for {} is unreadable: {}", user.id, e))?;
        let valid = Argon2::default()
            .verify_password(req.password.as_bytes(), &parsed)
            .is_ok();
        Ok::<_, anyhow::Error>(valid.then_some(user))
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|e| { error!("Login lookup failed: {:#}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .ok_or(StatusCode::UNAUTHORIZED)?;

    authorized(&state, user)
}

/// `200 OK` with the bearer token in the `Authorization` header.
fn authorized(state: &AppStateInner, user: User) -> Result<Response, StatusCode> {
    let token = create_token(&state.jwt_secret, user.id, &user.email, state.token_ttl)
        .map_err(|e| { error!("Failed to sign token: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?;

    Ok((
        [(header::AUTHORIZATION, format!("Bearer {}", token))],
        Json(UserResponse {
            user_id: user.id,
            email: user.email,
        }),
    )
        .into_response())
}

pub fn create_token(
    secret: &str,
    user_id: Uuid,
    email: &str,
    ttl: chrono::Duration,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        email: email.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && email.len() <= 254 && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{Router, body::Body, http::Request, routing::post};
    use hub_db::Database;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let store: Arc<dyn Store> = Arc::new(Database::open_in_memory().unwrap());
        Arc::new(AppStateInner::new(store, "test-secret".into(), chrono::Duration::hours(1)))
    }

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/api/user/create", post(create_user))
            .route("/api/user/login", post(login))
            .with_state(state)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_user_returns_bearer_header() {
        let state = test_state();
        let resp = app(state.clone())
            .oneshot(post_json(
                "/api/user/create",
                serde_json::json!({"email": "e2e@test.com", "password": "password"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let auth = resp.headers()[header::AUTHORIZATION].to_str().unwrap().to_string();
        let token = auth.strip_prefix("Bearer ").unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["email"], "e2e@test.com");

        let identity = state.verifier.verify(token).await.unwrap();
        assert_eq!(identity.user_id.to_string(), body["user_id"].as_str().unwrap());
    }

    #[tokio::test]
    async fn test_create_user_rejects_bad_input_and_duplicates() {
        let state = test_state();
        let create = |body| app(state.clone()).oneshot(post_json("/api/user/create", body));

        let resp = create(serde_json::json!({"email": "nope", "password": "pw"})).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = create(serde_json::json!({"email": "a@test.com"})).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = create(serde_json::json!({"email": "a@test.com", "password": "pw"})).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = create(serde_json::json!({"email": "a@test.com", "password": "other"})).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_login() {
        let state = test_state();
        let resp = app(state.clone())
            .oneshot(post_json(
                "/api/user/create",
                serde_json::json!({"email": "a@test.com", "password": "correct"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app(state.clone())
            .oneshot(post_json(
                "/api/user/login",
                serde_json::json!({"email": "a@test.com", "password": "correct"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(header::AUTHORIZATION));

        for body in [
            serde_json::json!({"email": "a@test.com", "password": "wrong"}),
            serde_json::json!({"email": "missing@test.com", "password": "correct"}),
        ] {
            let resp = app(state.clone())
                .oneshot(post_json("/api/user/login", body))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn test_email_check() {
        assert!(is_plausible_email("e2e@test.com"));
        assert!(!is_plausible_email("@test.com"));
        assert!(!is_plausible_email("e2e@"));
        assert!(!is_plausible_email("e 2e@test.com"));
    }
}
