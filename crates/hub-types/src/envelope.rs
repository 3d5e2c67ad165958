use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Channel, ChannelKind, Message};
use crate::timestamp::Timestamp;

/// Version of the action tag set. Bump when tags are added; existing tags
/// never change meaning.
pub const PROTOCOL_VERSION: u16 = 1;

/// Closed set of envelope discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionTag {
    CreatePublicRoom,
    CreateMessage,
    ListMessages,
    JoinPublicRoom,
    LeavePublicRoom,
    /// Server -> client only.
    Error,
}

impl ActionTag {
    /// Tags a client may send.
    pub const CLIENT_ACTIONS: [ActionTag; 5] = [
        ActionTag::CreatePublicRoom,
        ActionTag::CreateMessage,
        ActionTag::ListMessages,
        ActionTag::JoinPublicRoom,
        ActionTag::LeavePublicRoom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreatePublicRoom => "CREATE_PUBLIC_ROOM",
            Self::CreateMessage => "CREATE_MESSAGE",
            Self::ListMessages => "LIST_MESSAGES",
            Self::JoinPublicRoom => "JOIN_PUBLIC_ROOM",
            Self::LeavePublicRoom => "LEAVE_PUBLIC_ROOM",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE_PUBLIC_ROOM" => Some(Self::CreatePublicRoom),
            "CREATE_MESSAGE" => Some(Self::CreateMessage),
            "LIST_MESSAGES" => Some(Self::ListMessages),
            "JOIN_PUBLIC_ROOM" => Some(Self::JoinPublicRoom),
            "LEAVE_PUBLIC_ROOM" => Some(Self::LeavePublicRoom),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Inbound --

/// Envelope as received from a client. The tag is kept as a raw string so
/// unknown tags can still be answered.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    pub action_tag: String,
    #[serde(default)]
    pub target_id: Option<String>,
    /// Ignored: the server always stamps its own session id.
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoomRequest {
    pub text: String,
    /// Client proposal only; the server's creation time is authoritative.
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMessageRequest {
    pub text: String,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

/// A decoded client request, one variant per handler.
#[derive(Debug, Clone)]
pub enum Command {
    CreatePublicRoom(CreateRoomRequest),
    CreateMessage {
        target_id: String,
        content: CreateMessageRequest,
    },
    ListMessages {
        target_id: String,
    },
    JoinPublicRoom {
        target_id: String,
    },
    LeavePublicRoom {
        target_id: String,
    },
    /// Tag outside the client set, including the server-only `ERROR`.
    Unknown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("invalid content for {tag}: {source}")]
    Content {
        tag: ActionTag,
        #[source]
        source: serde_json::Error,
    },
}

impl InboundEnvelope {
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(text).map_err(DecodeError::Malformed)
    }

    pub fn target(&self) -> &str {
        self.target_id.as_deref().unwrap_or_default()
    }

    /// Map the raw envelope onto the closed command set.
    pub fn command(&self) -> Result<Command, DecodeError> {
        let Some(tag) = ActionTag::parse(&self.action_tag) else {
            return Ok(Command::Unknown(self.action_tag.clone()));
        };
        let target_id = self.target().to_string();

        let cmd = match tag {
            ActionTag::CreatePublicRoom => {
                Command::CreatePublicRoom(self.content_as(tag)?)
            }
            ActionTag::CreateMessage => Command::CreateMessage {
                target_id,
                content: self.content_as(tag)?,
            },
            ActionTag::ListMessages => Command::ListMessages { target_id },
            ActionTag::JoinPublicRoom => Command::JoinPublicRoom { target_id },
            ActionTag::LeavePublicRoom => Command::LeavePublicRoom { target_id },
            ActionTag::Error => Command::Unknown(self.action_tag.clone()),
        };
        Ok(cmd)
    }

    fn content_as<'a, T: Deserialize<'a>>(&'a self, tag: ActionTag) -> Result<T, DecodeError> {
        T::deserialize(&self.content).map_err(|source| DecodeError::Content { tag, source })
    }
}

// -- Outbound --

/// Envelope sent to clients. `sender_id` is the originating session.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub action_tag: ActionTag,
    pub target_id: String,
    pub sender_id: String,
    pub content: Content,
}

impl Envelope {
    pub fn new(action_tag: ActionTag, target_id: impl Into<String>, sender_id: Uuid, content: Content) -> Self {
        Self {
            action_tag,
            target_id: target_id.into(),
            sender_id: sender_id.to_string(),
            content,
        }
    }

    pub fn error(
        code: ErrorCode,
        message: impl Into<String>,
        request_action_tag: Option<String>,
        target_id: impl Into<String>,
        sender_id: Uuid,
    ) -> Self {
        Self::new(
            ActionTag::Error,
            target_id,
            sender_id,
            Content::Error(ErrorContent {
                code,
                message: message.into(),
                request_action_tag,
            }),
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Content {
    Room(RoomContent),
    Message(MessageContent),
    Messages(MessagesContent),
    Member(MemberContent),
    Error(ErrorContent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomContent {
    pub id: Uuid,
    pub kind: ChannelKind,
    pub text: String,
    pub creator_id: Uuid,
    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
}

impl From<&Channel> for RoomContent {
    fn from(channel: &Channel) -> Self {
        Self {
            id: channel.id,
            kind: channel.kind,
            text: channel.name.clone(),
            creator_id: channel.creator_id,
            created: channel.created_at,
            updated: channel.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    pub created_at: Timestamp,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&Message> for MessageContent {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            user_id: message.user_id,
            text: message.text.clone(),
            created_at: message.created_at.clone(),
            updated_at: message.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesContent {
    pub messages: Vec<MessageContent>,
}

/// Announced to a channel when a user joins or leaves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberContent {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProtocolError,
    ValidationError,
    NotFound,
    ServerError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub code: ErrorCode,
    pub message: String,
    pub request_action_tag: Option<String>,
}
