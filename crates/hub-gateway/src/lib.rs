//! Persistent-connection side of the hub: token verification at upgrade,
//! the session registry, the action router, and the per-connection worker.

pub mod auth;
pub mod connection;
pub mod error;
pub mod registry;
pub mod router;
pub mod session;

pub use auth::{AuthError, Identity, TokenVerifier};
pub use connection::{GatewayConfig, serve_session};
pub use registry::{Registry, SessionLink, Target};
pub use router::ActionRouter;
pub use session::{Session, SessionState};
