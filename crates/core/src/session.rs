use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

/// One conversation turn carried between bridge-mode requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTurn {
    pub role: String,
    pub content: String,
}

impl SessionTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// An ephemeral conversation thread for OpenAI-Responses → Claude bridging.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub turns: Vec<SessionTurn>,
    pub created_at: Instant,
    pub touched_at: Instant,
}

impl Session {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            turns: Vec::new(),
            created_at: now,
            touched_at: now,
        }
    }
}

/// Sessions keyed by the response id most recently returned to the client.
/// Entries expire by idle TTL and are pruned lazily on access.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_ttl(SESSION_IDLE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn mint_response_id() -> String {
        format!("resp_{}", uuid::Uuid::new_v4().simple())
    }

    /// Look up the thread behind `previous_response_id`, or start a fresh one.
    /// A fresh session is not stored until `advance` publishes it under a new
    /// response id, so failed requests leave no trace.
    pub fn lookup_or_create(&self, previous_response_id: &str) -> Session {
        if previous_response_id.is_empty() {
            return Session::new();
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut sessions, self.ttl);
        match sessions.get_mut(previous_response_id) {
            Some(session) => {
                session.touched_at = Instant::now();
                session.clone()
            }
            None => Session::new(),
        }
    }

    /// Publish the updated thread under the freshly minted response id and
    /// retire the previous key.
    pub fn advance(&self, previous_response_id: &str, response_id: &str, mut session: Session) {
        session.touched_at = Instant::now();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut sessions, self.ttl);
        if !previous_response_id.is_empty() {
            sessions.remove(previous_response_id);
        }
        sessions.insert(response_id.to_string(), session);
    }

    pub fn get(&self, response_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut sessions, self.ttl);
        sessions.get(response_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(sessions: &mut HashMap<String, Session>, ttl: Duration) {
    sessions.retain(|_, session| session.touched_at.elapsed() < ttl);
}
