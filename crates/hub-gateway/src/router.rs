use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hub_db::{NewMessage, Store};
use hub_types::envelope::{
    ActionTag, Command, Content, CreateRoomRequest, Envelope, InboundEnvelope, MemberContent,
    MessageContent, MessagesContent, RoomContent,
};
use hub_types::models::ChannelKind;
use hub_types::timestamp::Timestamp;

use crate::error::ActionError;
use crate::registry::{Registry, Target};
use crate::session::Session;

/// Page size for `LIST_MESSAGES`.
const LIST_LIMIT: u32 = 200;

/// A handled request: what to send and to whom.
#[derive(Debug, Clone)]
pub struct Reply {
    pub target: Target,
    pub envelope: Envelope,
}

/// Decodes inbound envelopes and runs the handler for each action tag.
/// Handlers never touch a socket; replies go out through the registry.
#[derive(Clone)]
pub struct ActionRouter {
    store: Arc<dyn Store>,
    registry: Registry,
}

impl ActionRouter {
    pub fn new(store: Arc<dyn Store>, registry: Registry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Route one text frame and deliver the result. Returns how many
    /// sessions the reply was queued for.
    pub async fn handle_text(&self, session: &Session, text: &str) -> usize {
        let reply = self.route(session, text).await;
        self.registry.deliver(reply.target, &reply.envelope).await
    }

    /// Decode and dispatch. Always yields a reply; failures become `ERROR`
    /// envelopes addressed to the originating session only.
    pub async fn route(&self, session: &Session, text: &str) -> Reply {
        let inbound = match InboundEnvelope::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => return error_reply(session, &ActionError::from(e), None, ""),
        };
        log_inbound(session, &inbound);

        let result = match inbound.command() {
            Ok(cmd) => self.dispatch(session, cmd).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => error_reply(
                session,
                &e,
                Some(inbound.action_tag.clone()),
                inbound.target(),
            ),
        }
    }

    pub async fn dispatch(&self, session: &Session, cmd: Command) -> Result<Reply, ActionError> {
        match cmd {
            Command::CreatePublicRoom(req) => self.create_public_room(session, req).await,
            Command::CreateMessage { target_id, content } => {
                let channel_id = parse_channel_id(&target_id)?;
                let text = non_empty(content.text, "message")?;
                let created_at = storable_created_at(content.created_at)?;
                self.create_message(session, channel_id, text, created_at).await
            }
            Command::ListMessages { target_id } => {
                self.list_messages(session, parse_channel_id(&target_id)?).await
            }
            Command::JoinPublicRoom { target_id } => {
                self.join_public_room(session, parse_channel_id(&target_id)?).await
            }
            Command::LeavePublicRoom { target_id } => {
                self.leave_public_room(session, parse_channel_id(&target_id)?).await
            }
            Command::Unknown(tag) => Err(ActionError::UnknownAction(tag)),
        }
    }

    async fn create_public_room(
        &self,
        session: &Session,
        req: CreateRoomRequest,
    ) -> Result<Reply, ActionError> {
        let name = non_empty(req.text, "room")?;
        let creator_id = session.user_id();

        let channel = self
            .blocking(move |store| store.create_channel(ChannelKind::PublicRoom, &name, creator_id))
            .await?;

        info!(
            "Session {} created public room {} ({:?})",
            session.id, channel.id, channel.name
        );

        Ok(Reply {
            target: Target::Channel {
                members: vec![creator_id],
                origin: session.id,
            },
            envelope: Envelope::new(
                ActionTag::CreatePublicRoom,
                channel.id.to_string(),
                session.id,
                Content::Room(RoomContent::from(&channel)),
            ),
        })
    }

    async fn create_message(
        &self,
        session: &Session,
        channel_id: Uuid,
        text: String,
        created_at: Timestamp,
    ) -> Result<Reply, ActionError> {
        let new = NewMessage {
            channel_id,
            sender_id: session.id,
            user_id: session.user_id(),
            text,
            created_at,
        };

        let stored = self
            .blocking(move |store| {
                let Some(message) = store.append_message(new)? else {
                    return Ok(None);
                };
                let members = store.list_members(channel_id)?;
                Ok(Some((message, members)))
            })
            .await?;
        let (message, members) = stored.ok_or_else(|| channel_not_found(channel_id))?;

        debug!(
            "Session {} posted message {} to {} ({} members)",
            session.id,
            message.id,
            channel_id,
            members.len()
        );

        Ok(Reply {
            target: Target::Channel {
                members,
                origin: session.id,
            },
            envelope: Envelope::new(
                ActionTag::CreateMessage,
                channel_id.to_string(),
                session.id,
                Content::Message(MessageContent::from(&message)),
            ),
        })
    }

    async fn list_messages(&self, session: &Session, channel_id: Uuid) -> Result<Reply, ActionError> {
        let messages = self
            .blocking(move |store| {
                if store.get_channel(channel_id)?.is_none() {
                    return Ok(None);
                }
                store.list_messages(channel_id, LIST_LIMIT, None).map(Some)
            })
            .await?
            .ok_or_else(|| channel_not_found(channel_id))?;

        Ok(Reply {
            target: Target::Session(session.id),
            envelope: Envelope::new(
                ActionTag::ListMessages,
                channel_id.to_string(),
                session.id,
                Content::Messages(MessagesContent {
                    messages: messages.iter().map(MessageContent::from).collect(),
                }),
            ),
        })
    }

    async fn join_public_room(&self, session: &Session, channel_id: Uuid) -> Result<Reply, ActionError> {
        let user_id = session.user_id();
        let members = self
            .blocking(move |store| {
                if store.get_channel(channel_id)?.is_none() {
                    return Ok(None);
                }
                if !store.add_member(channel_id, user_id)? {
                    debug!("User {} already a member of {}", user_id, channel_id);
                }
                store.list_members(channel_id).map(Some)
            })
            .await?
            .ok_or_else(|| channel_not_found(channel_id))?;

        info!("User {} joined {}", user_id, channel_id);
        Ok(self.member_reply(session, ActionTag::JoinPublicRoom, channel_id, members))
    }

    async fn leave_public_room(&self, session: &Session, channel_id: Uuid) -> Result<Reply, ActionError> {
        let user_id = session.user_id();
        let members = self
            .blocking(move |store| {
                if store.get_channel(channel_id)?.is_none() {
                    return Ok(None);
                }
                store.remove_member(channel_id, user_id)?;
                store.list_members(channel_id).map(Some)
            })
            .await?
            .ok_or_else(|| channel_not_found(channel_id))?;

        info!("User {} left {}", user_id, channel_id);
        Ok(self.member_reply(session, ActionTag::LeavePublicRoom, channel_id, members))
    }

    fn member_reply(
        &self,
        session: &Session,
        tag: ActionTag,
        channel_id: Uuid,
        members: Vec<Uuid>,
    ) -> Reply {
        Reply {
            target: Target::Channel {
                members,
                origin: session.id,
            },
            envelope: Envelope::new(
                tag,
                channel_id.to_string(),
                session.id,
                Content::Member(MemberContent {
                    user_id: session.user_id(),
                    email: session.email.clone(),
                }),
            ),
        }
    }

    /// Run a store call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, ActionError>
    where
        F: FnOnce(&dyn Store) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| ActionError::Store(anyhow::anyhow!("store task failed: {}", e)))?
            .map_err(ActionError::Store)
    }
}

/// Reply for a frame the router cannot read at all, such as a binary frame.
pub fn protocol_error(session: &Session, message: impl Into<String>) -> Reply {
    error_reply(session, &ActionError::Protocol(message.into()), None, "")
}

fn error_reply(
    session: &Session,
    err: &ActionError,
    request_action_tag: Option<String>,
    target_id: &str,
) -> Reply {
    match err {
        ActionError::Store(_) => error!(
            "Session {} request {:?} failed: {}",
            session.id, request_action_tag, err
        ),
        _ => warn!(
            "Session {} request {:?} rejected: {}",
            session.id, request_action_tag, err
        ),
    }

    Reply {
        target: Target::Session(session.id),
        envelope: Envelope::error(
            err.code(),
            err.client_message(),
            request_action_tag,
            target_id,
            session.id,
        ),
    }
}

fn log_inbound(session: &Session, inbound: &InboundEnvelope) {
    debug!(
        "Session {} -> {} target={:?}",
        session.id, inbound.action_tag, inbound.target_id
    );
}

fn parse_channel_id(target_id: &str) -> Result<Uuid, ActionError> {
    Uuid::parse_str(target_id)
        .map_err(|_| ActionError::NotFound(format!("channel {:?} not found", target_id)))
}

fn channel_not_found(channel_id: Uuid) -> ActionError {
    ActionError::NotFound(format!("channel {} not found", channel_id))
}

/// Client time if given, else server time. Years outside 0000..=9999 have
/// no fixed-width RFC 3339 form and are refused.
fn storable_created_at(created_at: Option<Timestamp>) -> Result<Timestamp, ActionError> {
    match created_at {
        Some(ts) if !ts.is_storable() => Err(ActionError::Validation(format!(
            "created_at '{}' must fall within years 0000 to 9999",
            ts
        ))),
        Some(ts) => Ok(ts),
        None => Ok(Timestamp::now()),
    }
}

fn non_empty(text: String, what: &str) -> Result<String, ActionError> {
    if text.trim().is_empty() {
        return Err(ActionError::Validation(format!("{} text must not be empty", what)));
    }
    Ok(text)
}
