//! v001 -- Initial schema creation.
//!
//! Creates `conversations`, `conversation_members`, and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations (private or group)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id         TEXT PRIMARY KEY NOT NULL,     -- UUID (v5 of room_key for private)
    kind       TEXT NOT NULL CHECK (kind IN ('private', 'group')),
    room_key   TEXT UNIQUE,                   -- canonical "a:b", private only
    name       TEXT,                          -- group only
    owner      TEXT,                          -- group only
    created_at TEXT NOT NULL,                 -- RFC-3339
    updated_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Participants
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_id TEXT NOT NULL,
    principal_id    TEXT NOT NULL,
    joined_at       TEXT NOT NULL,

    PRIMARY KEY (conversation_id, principal_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_members_principal
    ON conversation_members(principal_id);

-- ----------------------------------------------------------------
-- Messages (append-only, ordered by seq within a conversation)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,
    seq             INTEGER NOT NULL,
    sender          TEXT NOT NULL,
    content         TEXT NOT NULL,
    created_at      TEXT NOT NULL,

    UNIQUE (conversation_id, seq),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
