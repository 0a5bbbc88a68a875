use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AppError;
use crate::result::Result;

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub wallet_address: String,
    pub expires_at: DateTime<Utc>,
}

/// Heartbeat sessions keyed by token. Injected into the router state; one
/// registry per server.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn issue(&self, wallet_address: String, ttl: Duration) -> Session {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::days(1));
        let session = Session {
            token: uuid::Uuid::new_v4().to_string(),
            wallet_address,
            expires_at: Utc::now() + ttl,
        };
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.token.clone(), session.clone());
        session
    }

    pub fn authenticate(&self, token: &str, wallet_address: &str) -> Result<()> {
        self.authenticate_at(token, wallet_address, Utc::now())
    }

    pub(crate) fn authenticate_at(
        &self,
        token: &str,
        wallet_address: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(token) {
            Some(s) if s.expires_at <= now => {
                sessions.remove(token);
                Err(AppError::unauthorized("session expired"))
            }
            Some(s) if s.wallet_address.eq_ignore_ascii_case(wallet_address) => Ok(()),
            _ => Err(AppError::unauthorized("invalid session")),
        }
    }
}
