use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Channel kinds. Only public rooms exist today; the column is kept so
/// private rooms can be added without a schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    PublicRoom,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PublicRoom => "public_room",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public_room" => Some(Self::PublicRoom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub kind: ChannelKind,
    pub name: String,
    pub creator_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Null until the first edit.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Messages are append-only: `updated_at` is always null in this server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    /// Session that submitted the message.
    pub sender_id: Uuid,
    /// Author of the content.
    pub user_id: Uuid,
    pub text: String,
    /// Client-supplied or server time, echoed as written.
    pub created_at: Timestamp,
    pub updated_at: Option<DateTime<Utc>>,
}
