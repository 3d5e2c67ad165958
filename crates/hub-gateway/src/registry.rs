use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{RwLock, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hub_types::envelope::Envelope;

use crate::session::Session;

/// Which sessions an outbound envelope goes to.
#[derive(Debug, Clone)]
pub enum Target {
    /// One session.
    Session(Uuid),
    /// Every session of each listed user.
    Users(Vec<Uuid>),
    /// Every session of the channel members, plus the session that caused
    /// the event (which may not belong to a member).
    Channel { members: Vec<Uuid>, origin: Uuid },
    /// Every live session.
    All,
}

/// Worker side of a registration.
pub struct SessionLink {
    /// Serialized frames queued for this session's socket.
    pub outbound: mpsc::Receiver<Utf8Bytes>,
    /// Cancelled when the session is unregistered or the server shuts down.
    pub cancel: CancellationToken,
}

struct SessionHandle {
    user_id: Uuid,
    tx: mpsc::Sender<Utf8Bytes>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Table {
    sessions: HashMap<Uuid, SessionHandle>,
    /// user_id -> live session ids. One user may hold many sessions.
    by_user: HashMap<Uuid, HashSet<Uuid>>,
}

/// Routing table from identity to transport endpoint. Holds no business
/// data. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    table: RwLock<Table>,
    /// Per-session outbound queue capacity. A session that falls this far
    /// behind is evicted.
    outbound_buffer: usize,
    /// Parent of every session token.
    shutdown: CancellationToken,
}

impl Registry {
    pub fn new(outbound_buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                table: RwLock::new(Table::default()),
                outbound_buffer: outbound_buffer.max(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Add a session under its session id and its user id.
    pub async fn register(&self, session: &Session) -> SessionLink {
        let (tx, outbound) = mpsc::channel(self.inner.outbound_buffer);
        let cancel = self.inner.shutdown.child_token();

        let mut table = self.inner.table.write().await;
        table.sessions.insert(
            session.id,
            SessionHandle {
                user_id: session.user_id(),
                tx,
                cancel: cancel.clone(),
            },
        );
        table
            .by_user
            .entry(session.user_id())
            .or_default()
            .insert(session.id);

        debug!(
            "Registered session {} for user {} ({} live)",
            session.id,
            session.user_id(),
            table.sessions.len()
        );

        SessionLink { outbound, cancel }
    }

    /// Remove a session. Idempotent; returns whether it was present.
    /// Cancels the session's token so its worker stops reading and writing.
    pub async fn unregister(&self, session_id: Uuid) -> bool {
        let mut table = self.inner.table.write().await;
        let Some(handle) = table.sessions.remove(&session_id) else {
            return false;
        };

        if let Some(ids) = table.by_user.get_mut(&handle.user_id) {
            ids.remove(&session_id);
            if ids.is_empty() {
                table.by_user.remove(&handle.user_id);
            }
        }
        handle.cancel.cancel();

        debug!(
            "Unregistered session {} ({} live)",
            session_id,
            table.sessions.len()
        );
        true
    }

    /// Serialize once and queue for every matching session. A target whose
    /// queue is closed or full is skipped and unregistered; the rest still
    /// receive the frame. Returns how many sessions it was queued for.
    pub async fn deliver(&self, target: Target, envelope: &Envelope) -> usize {
        let frame: Utf8Bytes = match envelope.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed to encode {} envelope: {}", envelope.action_tag, e);
                return 0;
            }
        };
        self.deliver_frame(target, frame).await
    }

    async fn deliver_frame(&self, target: Target, frame: Utf8Bytes) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        {
            let table = self.inner.table.read().await;
            for session_id in resolve(&table, &target) {
                let Some(handle) = table.sessions.get(&session_id) else {
                    continue;
                };
                match handle.tx.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!("Outbound queue full for session {}, evicting", session_id);
                        failed.push(session_id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!("Session {} is gone, dropping its registration", session_id);
                        failed.push(session_id);
                    }
                }
            }
        }

        for session_id in failed {
            self.unregister(session_id).await;
        }

        delivered
    }

    pub async fn sessions_for_user(&self, user_id: Uuid) -> Vec<Uuid> {
        self.inner
            .table
            .read()
            .await
            .by_user
            .get(&user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn contains(&self, session_id: Uuid) -> bool {
        self.inner.table.read().await.sessions.contains_key(&session_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.table.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cancel every session token. Workers then unregister themselves.
    pub fn close_all(&self) {
        info!("Closing all gateway sessions");
        self.inner.shutdown.cancel();
    }
}

/// Expand a target into distinct session ids, in a stable order.
fn resolve(table: &Table, target: &Target) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |id: Uuid| {
        if seen.insert(id) {
            out.push(id);
        }
    };

    match target {
        Target::Session(id) => push(*id),
        Target::Users(users) => {
            for user_id in users {
                for id in table.by_user.get(user_id).into_iter().flatten() {
                    push(*id);
                }
            }
        }
        Target::Channel { members, origin } => {
            push(*origin);
            for user_id in members {
                for id in table.by_user.get(user_id).into_iter().flatten() {
                    push(*id);
                }
            }
        }
        Target::All => {
            for id in table.sessions.keys() {
                push(*id);
            }
        }
    }

    out
}
