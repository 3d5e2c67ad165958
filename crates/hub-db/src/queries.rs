use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, params};
use uuid::Uuid;

use hub_types::models::{Channel, ChannelKind, Message, User};

use crate::Database;
use crate::models::{ChannelRow, MessageRow, UserRow, format_ts};
use crate::store::{ChannelStore, MessageStore, NewMessage, UserStore};

// -- Users --

impl UserStore for Database {
    fn create_user(&self, email: &str, password_hash: &str) -> Result<Option<User>> {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            created_at: Utc::now(),
        };

        self.with_conn(|conn| {
            if query_user_by_email(conn, email)?.is_some() {
                return Ok(None);
            }
            conn.execute(
                "INSERT INTO users (id, email, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user.id.to_string(), email, password_hash, format_ts(&user.created_at)],
            )?;
            Ok(Some(user))
        })
    }

    fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, email, password, created_at FROM users WHERE id = ?1")?;
            let row = stmt.query_row([id.to_string()], map_user_row).optional()?;
            row.map(User::try_from).transpose()
        })
    }

    fn get_user_credentials(&self, email: &str) -> Result<Option<(User, String)>> {
        self.with_conn(|conn| {
            let Some(row) = query_user_by_email(conn, email)? else {
                return Ok(None);
            };
            let password = row.password.clone();
            Ok(Some((User::try_from(row)?, password)))
        })
    }
}

// -- Channels --

impl ChannelStore for Database {
    fn create_channel(&self, kind: ChannelKind, name: &str, creator_id: Uuid) -> Result<Channel> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            // v4 collisions are not expected, but the id must never be reused.
            let mut id = Uuid::new_v4();
            while channel_exists(&tx, id)? {
                id = Uuid::new_v4();
            }

            let channel = Channel {
                id,
                kind,
                name: name.to_string(),
                creator_id,
                created_at: Utc::now(),
                updated_at: None,
            };
            let created = format_ts(&channel.created_at);

            tx.execute(
                "INSERT INTO channels (id, kind, name, creator_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![id.to_string(), kind.as_str(), name, creator_id.to_string(), created],
            )?;
            tx.execute(
                "INSERT INTO channel_members (channel_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), creator_id.to_string(), created],
            )?;
            tx.commit()?;

            Ok(channel)
        })
    }

    fn get_channel(&self, id: Uuid) -> Result<Option<Channel>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, name, creator_id, created_at, updated_at FROM channels WHERE id = ?1",
            )?;
            let row = stmt.query_row([id.to_string()], map_channel_row).optional()?;
            row.map(Channel::try_from).transpose()
        })
    }

    fn list_channels(&self) -> Result<Vec<Channel>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, name, creator_id, created_at, updated_at
                 FROM channels
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([], map_channel_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(Channel::try_from).collect()
        })
    }

    fn add_member(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO channel_members (channel_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                params![channel_id.to_string(), user_id.to_string(), format_ts(&Utc::now())],
            )?;
            Ok(inserted > 0)
        })
    }

    fn remove_member(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
                params![channel_id.to_string(), user_id.to_string()],
            )?;
            Ok(removed > 0)
        })
    }

    fn list_members(&self, channel_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM channel_members WHERE channel_id = ?1 ORDER BY joined_at ASC",
            )?;
            let ids = stmt
                .query_map([channel_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids.iter().map(|id| crate::models::parse_uuid(id)).collect()
        })
    }
}

// -- Messages --

impl MessageStore for Database {
    fn append_message(&self, new: NewMessage) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            // Existence check and insert share the lock, so a message can
            // never reference a channel that is not there.
            if !channel_exists(conn, new.channel_id)? {
                return Ok(None);
            }
            anyhow::ensure!(
                new.created_at.is_storable(),
                "created_at '{}' is outside years 0000..=9999",
                new.created_at
            );

            let message = Message {
                id: Uuid::new_v4(),
                channel_id: new.channel_id,
                sender_id: new.sender_id,
                user_id: new.user_id,
                text: new.text,
                created_at: new.created_at,
                updated_at: None,
            };

            conn.execute(
                "INSERT INTO messages
                    (id, channel_id, sender_id, user_id, text, created_at, created_at_text, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
                params![
                    message.id.to_string(),
                    message.channel_id.to_string(),
                    message.sender_id.to_string(),
                    message.user_id.to_string(),
                    message.text,
                    format_ts(&message.created_at.instant()),
                    message.created_at.as_str(),
                ],
            )?;

            Ok(Some(message))
        })
    }

    fn list_messages(
        &self,
        channel_id: Uuid,
        limit: u32,
        before: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| query_messages(conn, channel_id, limit, before))
    }
}

fn channel_exists(conn: &Connection, id: Uuid) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM channels WHERE id = ?1", [id.to_string()], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn query_user_by_email(conn: &Connection, email: &str) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare("SELECT id, email, password, created_at FROM users WHERE email = ?1")?;

    let row = stmt.query_row([email], map_user_row).optional()?;

    Ok(row)
}

fn query_messages(
    conn: &Connection,
    channel_id: Uuid,
    limit: u32,
    before: Option<Uuid>,
) -> Result<Vec<Message>> {
    // (created_at, rowid) is the total order; the cursor is a position in it.
    let mut stmt = conn.prepare(
        "SELECT id, channel_id, sender_id, user_id, text, created_at, created_at_text, updated_at
         FROM messages
         WHERE channel_id = ?1
           AND (?2 IS NULL OR (created_at, rowid) <
                (SELECT created_at, rowid FROM messages WHERE id = ?2 AND channel_id = ?1))
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?3",
    )?;

    let before = before.map(|id| id.to_string());
    let mut rows = stmt
        .query_map(params![channel_id.to_string(), before, limit], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                channel_id: row.get(1)?,
                sender_id: row.get(2)?,
                user_id: row.get(3)?,
                text: row.get(4)?,
                created_at: row.get(5)?,
                created_at_text: row.get(6)?,
                updated_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // Newest page was selected; hand it back oldest first.
    rows.reverse();
    rows.into_iter().map(Message::try_from).collect()
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        password: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn map_channel_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelRow> {
    Ok(ChannelRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        creator_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
