/// Database row types — these map directly to SQLite rows.
/// Distinct from banter-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CallRow {
    pub id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub status: String,
    pub created_at: String,
    pub ended_at: Option<String>,
}

impl CallRow {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.callee_id == user_id
    }

    /// The other participant's id, if `user_id` is one of the two.
    pub fn partner_of(&self, user_id: &str) -> Option<&str> {
        if self.caller_id == user_id {
            Some(&self.callee_id)
        } else if self.callee_id == user_id {
            Some(&self.caller_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalRow {
    pub seq: i64,
    pub call_id: String,
    pub sender_id: String,
    pub signal_type: String,
    pub payload: String,
    pub created_at: String,
}
