use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);"
    )?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                email       TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE channels (
                id          TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                name        TEXT NOT NULL,
                creator_id  TEXT NOT NULL REFERENCES users(id),
                created_at  TEXT NOT NULL,
                updated_at  TEXT
            );

            CREATE TABLE channel_members (
                channel_id  TEXT NOT NULL REFERENCES channels(id),
                user_id     TEXT NOT NULL REFERENCES users(id),
                joined_at   TEXT NOT NULL,
                PRIMARY KEY (channel_id, user_id)
            );

            CREATE TABLE messages (
                id          TEXT PRIMARY KEY,
                channel_id  TEXT NOT NULL REFERENCES channels(id),
                sender_id   TEXT NOT NULL,
                user_id     TEXT NOT NULL REFERENCES users(id),
                text        TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT
            );

            CREATE INDEX idx_messages_channel
                ON messages(channel_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (message created_at text)");
        conn.execute_batch(
            "
            ALTER TABLE messages ADD COLUMN created_at_text TEXT;

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
