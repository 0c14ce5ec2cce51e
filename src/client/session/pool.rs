use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;

use super::ServerSession;
#[cfg(test)]
use crate::bson::Document;

/// Server sessions waiting to be reused, most recently returned first.
#[derive(Debug, Default)]
pub struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the most recently returned server session that is not about to expire, discarding
    /// expired ones on the way. A new session is created when none remain.
    pub(crate) async fn check_out(&self, logical_session_timeout: Duration) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if !session.is_about_to_expire(logical_session_timeout) {
                return session;
            }
        }
        ServerSession::new()
    }

    /// Returns a server session to the front of the pool, so the most recently used session is
    /// handed out next. Dirty sessions and sessions about to expire are discarded, as is every
    /// cached session that has expired in the meantime.
    pub(crate) async fn check_in(&self, session: ServerSession, logical_session_timeout: Duration) {
        let mut pool = self.pool.lock().await;
        pool.retain(|pooled| !pooled.is_about_to_expire(logical_session_timeout));

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    /// The number of cached sessions.
    pub async fn len(&self) -> usize {
        self.pool.lock().await.len()
    }

    /// Whether the pool holds no sessions.
    pub async fn is_empty(&self) -> bool {
        self.pool.lock().await.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: &Document) -> bool {
        self.pool.lock().await.iter().any(|s| &s.id == id)
    }
}
