//! Repository traits the rest of the server talks to. The gateway and the
//! HTTP layer never see SQL; `Database` is the only implementation.

use anyhow::Result;
use uuid::Uuid;

use hub_types::models::{Channel, ChannelKind, Message, User};
use hub_types::timestamp::Timestamp;

pub trait UserStore: Send + Sync {
    /// Returns `None` if the email is already registered.
    fn create_user(&self, email: &str, password_hash: &str) -> Result<Option<User>>;

    fn get_user(&self, id: Uuid) -> Result<Option<User>>;

    /// User plus stored password hash, for login.
    fn get_user_credentials(&self, email: &str) -> Result<Option<(User, String)>>;
}

pub trait ChannelStore: Send + Sync {
    /// Assigns a fresh id and records the creator as the first member, in
    /// one transaction.
    fn create_channel(&self, kind: ChannelKind, name: &str, creator_id: Uuid) -> Result<Channel>;

    fn get_channel(&self, id: Uuid) -> Result<Option<Channel>>;

    fn list_channels(&self) -> Result<Vec<Channel>>;

    /// Returns true if the user was not a member before.
    fn add_member(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool>;

    /// Returns true if the user was a member before.
    fn remove_member(&self, channel_id: Uuid, user_id: Uuid) -> Result<bool>;

    fn list_members(&self, channel_id: Uuid) -> Result<Vec<Uuid>>;
}

/// Fields a caller supplies for a new message; id and `updated_at` are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel_id: Uuid,
    pub sender_id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    pub created_at: Timestamp,
}

pub trait MessageStore: Send + Sync {
    /// Append-only insert. Returns `None` if the channel does not exist.
    /// Fails if `created_at` is outside years 0000..=9999.
    fn append_message(&self, new: NewMessage) -> Result<Option<Message>>;

    /// Newest `limit` messages older than the message `before` (or the
    /// newest overall), returned oldest first. Messages are ordered by
    /// `created_at`, then by insertion, so equal timestamps are never
    /// skipped across pages. An unknown `before` id yields an empty page.
    fn list_messages(
        &self,
        channel_id: Uuid,
        limit: u32,
        before: Option<Uuid>,
    ) -> Result<Vec<Message>>;
}

/// Everything the server needs from persistence.
pub trait Store: UserStore + ChannelStore + MessageStore {}

impl<T: UserStore + ChannelStore + MessageStore> Store for T {}
