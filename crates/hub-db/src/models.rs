//! Database row types. These map directly to SQLite rows and are converted
//! into hub-types models at the store boundary.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use hub_types::models::{Channel, ChannelKind, Message, User};
use hub_types::timestamp::Timestamp;

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub password: String,
    pub created_at: String,
}

pub struct ChannelRow {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub creator_id: String,
    pub created_at: String,
    pub updated_at: Option<String>,
}

pub struct MessageRow {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub user_id: String,
    pub text: String,
    pub created_at: String,
    /// `created_at` as originally written; null for rows from schema v1.
    pub created_at_text: Option<String>,
    pub updated_at: Option<String>,
}

/// Fixed-width RFC 3339 so that text ordering in SQLite matches time
/// ordering, and sub-second precision survives a round trip.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("corrupt timestamp '{}'", s))
}

pub fn parse_uuid(s: &str) -> Result<Uuid> {
    s.parse().with_context(|| format!("corrupt id '{}'", s))
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: parse_uuid(&row.id)?,
            email: row.email,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

impl TryFrom<ChannelRow> for Channel {
    type Error = anyhow::Error;

    fn try_from(row: ChannelRow) -> Result<Self> {
        let kind = ChannelKind::parse(&row.kind)
            .ok_or_else(|| anyhow!("unknown channel kind '{}' on channel '{}'", row.kind, row.id))?;
        Ok(Channel {
            id: parse_uuid(&row.id)?,
            kind,
            name: row.name,
            creator_id: parse_uuid(&row.creator_id)?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: row.updated_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: parse_uuid(&row.id)?,
            channel_id: parse_uuid(&row.channel_id)?,
            sender_id: parse_uuid(&row.sender_id)?,
            user_id: parse_uuid(&row.user_id)?,
            text: row.text,
            created_at: match row.created_at_text {
                Some(text) => text
                    .parse::<Timestamp>()
                    .with_context(|| format!("corrupt timestamp '{}'", text))?,
                None => Timestamp::from_instant(parse_ts(&row.created_at)?),
            },
            updated_at: row.updated_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}
