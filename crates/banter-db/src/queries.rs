use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::Database;
use crate::StoreError;
use crate::models::{CallRow, SignalRow, UserRow};

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    pub fn get_username_by_id(&self, id: &str) -> Result<String, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT username FROM users WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(StoreError::from)
        })
    }

    // -- Matchmaking queue --

    /// Add a user to the queue. A duplicate enqueue is a silent no-op.
    pub fn enqueue(&self, user_id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO matchmaking_queue (user_id) VALUES (?1)",
                [user_id],
            )?;
            Ok(())
        })
    }

    /// Remove a user from the queue. Returns false when the entry was
    /// already gone (cancel after match, or double cancel).
    pub fn cancel_search(&self, user_id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM matchmaking_queue WHERE user_id = ?1",
                [user_id],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn is_queued(&self, user_id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let row: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM matchmaking_queue WHERE user_id = ?1",
                    [user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(row.is_some())
        })
    }

    /// Claim the oldest other queued user and open a call with them, as one
    /// transaction: select partner, remove both queue entries, insert the
    /// call row. The delete doubles as a compare-and-remove — if either
    /// entry is no longer present the transaction rolls back and `None` is
    /// returned, leaving this user queued. `None` is also the no-partner
    /// outcome; neither is an error.
    ///
    /// The claiming user becomes the caller (initiator).
    pub fn claim_partner(&self, user_id: &str) -> Result<Option<CallRow>, StoreError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let partner: Option<String> = tx
                .query_row(
                    "SELECT user_id FROM matchmaking_queue
                     WHERE user_id != ?1
                     ORDER BY enqueued_at, rowid
                     LIMIT 1",
                    [user_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(partner_id) = partner else {
                return Ok(None);
            };

            let removed = tx.execute(
                "DELETE FROM matchmaking_queue WHERE user_id IN (?1, ?2)",
                [user_id, partner_id.as_str()],
            )?;
            if removed != 2 {
                // One of the entries was consumed by a concurrent claim or
                // cancel; dropping the transaction restores the queue.
                return Ok(None);
            }

            let call = CallRow {
                id: Uuid::new_v4().to_string(),
                caller_id: user_id.to_string(),
                callee_id: partner_id,
                status: "active".to_string(),
                created_at: Utc::now().to_rfc3339(),
                ended_at: None,
            };

            tx.execute(
                "INSERT INTO calls (id, caller_id, callee_id, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    call.id,
                    call.caller_id,
                    call.callee_id,
                    call.status,
                    call.created_at
                ],
            )?;

            tx.commit()?;
            Ok(Some(call))
        })
    }

    // -- Calls --

    pub fn get_call(&self, call_id: &str) -> Result<Option<CallRow>, StoreError> {
        self.with_conn(|conn| query_call(conn, call_id))
    }

    pub fn active_call_for(&self, user_id: &str) -> Result<Option<CallRow>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, caller_id, callee_id, status, created_at, ended_at
                     FROM calls
                     WHERE status = 'active' AND (caller_id = ?1 OR callee_id = ?1)
                     LIMIT 1",
                    [user_id],
                    map_call_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Transition a call to ended, setting ended_at. Returns true only for
    /// the write that performed the transition; a call that is already
    /// ended stays untouched, so concurrent enders cannot both win.
    pub fn end_call(&self, call_id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE calls SET status = 'ended', ended_at = ?2
                 WHERE id = ?1 AND status = 'active'",
                rusqlite::params![call_id, Utc::now().to_rfc3339()],
            )?;
            Ok(changed == 1)
        })
    }

    // -- Signals --

    /// Append a signaling envelope. The assigned seq is the delivery order
    /// within the call; rows are never updated afterwards.
    pub fn append_signal(
        &self,
        call_id: &str,
        sender_id: &str,
        signal_type: &str,
        payload: &str,
    ) -> Result<SignalRow, StoreError> {
        self.with_conn(|conn| {
            let created_at = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO call_signals (call_id, sender_id, signal_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![call_id, sender_id, signal_type, payload, created_at],
            )?;
            Ok(SignalRow {
                seq: conn.last_insert_rowid(),
                call_id: call_id.to_string(),
                sender_id: sender_id.to_string(),
                signal_type: signal_type.to_string(),
                payload: payload.to_string(),
                created_at,
            })
        })
    }

    /// Envelopes for a call with seq greater than `after_seq`, in append
    /// order. Used to replay on subscribe/reconnect.
    pub fn signals_after(&self, call_id: &str, after_seq: i64) -> Result<Vec<SignalRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, call_id, sender_id, signal_type, payload, created_at
                 FROM call_signals
                 WHERE call_id = ?1 AND seq > ?2
                 ORDER BY seq",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![call_id, after_seq], |row| {
                    Ok(SignalRow {
                        seq: row.get(0)?,
                        call_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        signal_type: row.get(3)?,
                        payload: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Drop signal rows belonging to calls that ended more than
    /// `grace_secs` ago. Returns the number of rows removed.
    pub fn prune_ended_call_signals(&self, grace_secs: i64) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(grace_secs)).to_rfc3339();
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM call_signals WHERE call_id IN (
                     SELECT id FROM calls
                     WHERE status = 'ended' AND ended_at IS NOT NULL AND ended_at < ?1
                 )",
                [cutoff.as_str()],
            )?;
            Ok(removed)
        })
    }

    // -- Post-call --

    /// One feedback row per user per call; a second submission surfaces as
    /// `StoreError::Duplicate`.
    pub fn insert_feedback(
        &self,
        id: &str,
        call_id: &str,
        user_id: &str,
        rating: u8,
        feedback_text: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO call_feedback (id, call_id, user_id, rating, feedback_text)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, call_id, user_id, rating, feedback_text],
            )?;
            Ok(())
        })
    }

    /// A repeat request to the same receiver surfaces as
    /// `StoreError::Duplicate`, which the API maps to "already sent".
    pub fn insert_friend_request(
        &self,
        id: &str,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO friend_requests (id, sender_id, receiver_id, status)
                 VALUES (?1, ?2, ?3, 'pending')",
                rusqlite::params![id, sender_id, receiver_id],
            )?;
            Ok(())
        })
    }
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT id, username, password, created_at FROM users WHERE username = ?1")?;

    let row = stmt
        .query_row([username], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT id, username, password, created_at FROM users WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_call(conn: &Connection, call_id: &str) -> Result<Option<CallRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, caller_id, callee_id, status, created_at, ended_at
             FROM calls WHERE id = ?1",
            [call_id],
            map_call_row,
        )
        .optional()?;
    Ok(row)
}

fn map_call_row(row: &rusqlite::Row<'_>) -> Result<CallRow, rusqlite::Error> {
    Ok(CallRow {
        id: row.get(0)?,
        caller_id: row.get(1)?,
        callee_id: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
        ended_at: row.get(5)?,
    })
}
