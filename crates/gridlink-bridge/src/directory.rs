//! SessionDirectory: maps transport-independent session ids to a recipient.
//!
//! A session outlives its connection: a reconnect rebinds the same session id
//! to the new connection (last writer wins), and a session whose client can
//! only be reached through the relay is bound to the relay's base URL instead.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Where messages for a session are delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// A live connection on this server, by connection id.
    Direct(String),
    /// A relay endpoint reachable by outbound HTTP, by base URL.
    Relay(String),
}

/// One logical conversation.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub recipient: Recipient,
    pub last_activity: DateTime<Utc>,
    /// Free-form JSON object (selection, active sheet, ...)
    pub context: Value,
}

/// Thread-safe session → recipient table. Many readers, occasional writer.
#[derive(Default)]
pub struct SessionDirectory {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind (or rebind) a session. Returns the recipient it replaced.
    /// The session's context survives a rebind.
    pub fn bind(
        &self,
        session_id: &str,
        user_id: &str,
        recipient: Recipient,
    ) -> Option<Recipient> {
        let mut sessions = self.sessions.write();
        let now = Utc::now();
        match sessions.get_mut(session_id) {
            Some(session) => {
                let previous = std::mem::replace(&mut session.recipient, recipient);
                session.user_id = user_id.to_string();
                session.last_activity = now;
                debug!(session_id, ?previous, recipient = ?session.recipient, "session rebound");
                Some(previous)
            }
            None => {
                info!(session_id, user_id, ?recipient, "session bound");
                sessions.insert(
                    session_id.to_string(),
                    Session {
                        id: session_id.to_string(),
                        user_id: user_id.to_string(),
                        recipient,
                        last_activity: now,
                        context: Value::Object(Map::new()),
                    },
                );
                None
            }
        }
    }

    /// Current recipient for a session; `None` when unknown.
    pub fn resolve(&self, session_id: &str) -> Option<Recipient> {
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.recipient.clone())
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Refresh a session's last-activity time.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.sessions.write().get_mut(session_id) {
            Some(session) => {
                session.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn unbind(&self, session_id: &str) -> Option<Session> {
        self.sessions.write().remove(session_id)
    }

    /// Drop every session still routed to a closed connection. Sessions
    /// that were already rebound elsewhere are left alone.
    pub fn unbind_connection(&self, connection_id: &str) -> Vec<String> {
        let mut sessions = self.sessions.write();
        let stale: Vec<String> = sessions
            .values()
            .filter(|s| matches!(&s.recipient, Recipient::Direct(id) if id == connection_id))
            .map(|s| s.id.clone())
            .collect();
        for id in &stale {
            sessions.remove(id);
        }
        if !stale.is_empty() {
            debug!(connection_id, sessions = stale.len(), "sessions unbound on disconnect");
        }
        stale
    }

    /// Set one key of the session's context object.
    pub fn set_context(&self, session_id: &str, key: &str, value: Value) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        if !session.context.is_object() {
            session.context = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut session.context {
            map.insert(key.to_string(), value);
        }
        session.last_activity = Utc::now();
        true
    }

    pub fn context(&self, session_id: &str) -> Option<Value> {
        self.sessions.read().get(session_id).map(|s| s.context.clone())
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
