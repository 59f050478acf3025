use rusqlite::Connection;
use tracing::info;

use crate::StoreError;

pub fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- One row per waiting user; the primary key makes a second enqueue
        -- from the same user a no-op at the storage level.
        CREATE TABLE IF NOT EXISTS matchmaking_queue (
            user_id     TEXT PRIMARY KEY REFERENCES users(id),
            enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_queue_order
            ON matchmaking_queue(enqueued_at);

        CREATE TABLE IF NOT EXISTS calls (
            id          TEXT PRIMARY KEY,
            caller_id   TEXT NOT NULL REFERENCES users(id),
            callee_id   TEXT NOT NULL REFERENCES users(id),
            status      TEXT NOT NULL DEFAULT 'active',
            created_at  TEXT NOT NULL,
            ended_at    TEXT,
            CHECK (caller_id != callee_id),
            CHECK (status IN ('active', 'ended'))
        );

        CREATE INDEX IF NOT EXISTS idx_calls_caller ON calls(caller_id, status);
        CREATE INDEX IF NOT EXISTS idx_calls_callee ON calls(callee_id, status);

        -- Append-only signaling log; seq is the delivery order within a call.
        CREATE TABLE IF NOT EXISTS call_signals (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            call_id     TEXT NOT NULL REFERENCES calls(id),
            sender_id   TEXT NOT NULL REFERENCES users(id),
            signal_type TEXT NOT NULL,
            payload     TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            CHECK (signal_type IN ('offer', 'answer', 'ice-candidate', 'call-ended'))
        );

        CREATE INDEX IF NOT EXISTS idx_signals_call
            ON call_signals(call_id, seq);

        CREATE TABLE IF NOT EXISTS call_feedback (
            id              TEXT PRIMARY KEY,
            call_id         TEXT NOT NULL REFERENCES calls(id),
            user_id         TEXT NOT NULL REFERENCES users(id),
            rating          INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
            feedback_text   TEXT,
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(call_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS friend_requests (
            id          TEXT PRIMARY KEY,
            sender_id   TEXT NOT NULL REFERENCES users(id),
            receiver_id TEXT NOT NULL REFERENCES users(id),
            status      TEXT NOT NULL DEFAULT 'pending',
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            CHECK (sender_id != receiver_id),
            CHECK (status IN ('pending', 'accepted', 'rejected')),
            UNIQUE(sender_id, receiver_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
