use axum::{
    Json,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
    typed_header::TypedHeaderRejection,
};
use tracing::{error, warn};

use hub_gateway::{ActionRouter, GatewayConfig, Session, TokenVerifier, serve_session};
use hub_types::api::InfoResponse;
use hub_types::envelope::{ActionTag, PROTOCOL_VERSION};

#[derive(Clone)]
pub struct GatewayState {
    pub verifier: TokenVerifier,
    pub router: ActionRouter,
    pub config: GatewayConfig,
    pub max_frame_bytes: usize,
}

/// `GET /ws`. The bearer token is checked before the upgrade; a bad or
/// missing token is answered with 401 and no socket is opened.
pub async fn ws_upgrade(
    State(state): State<GatewayState>,
    auth: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    ws: WebSocketUpgrade,
) -> Response {
    let TypedHeader(Authorization(bearer)) = match auth {
        Ok(header) => header,
        Err(e) => {
            warn!("WebSocket upgrade without a usable bearer token: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let identity = match state.verifier.verify(bearer.token()).await {
        Ok(identity) => identity,
        Err(e) if e.is_unauthorized() => {
            warn!("WebSocket upgrade rejected: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(e) => {
            error!("WebSocket upgrade failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let session = Session::new(identity);
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| serve_session(socket, session, state.router, state.config))
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn info() -> Json<InfoResponse> {
    Json(InfoResponse {
        name: env!("CARGO_PKG_NAME").to_string(),
        protocol_version: PROTOCOL_VERSION,
        action_tags: ActionTag::CLIENT_ACTIONS
            .iter()
            .map(|tag| tag.as_str().to_string())
            .collect(),
    })
}
