use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};

use quill_protocol::{CloseCode, User, clock};

use crate::auth;
use crate::error::ApiError;
use crate::manager::ResourceManager;

/// Messages pushed to a live WebSocket task from elsewhere in the server:
/// outbound text frames, or an order to close with a given code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close(u16),
}

/// Sending half of a connection, registered under the owning session.
/// The WebSocket task owns the receiving half and the socket itself.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false if the connection task is already gone.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Outbound::Text(text)).is_ok()
    }

    pub fn close(&self, code: u16) -> bool {
        self.tx.send(Outbound::Close(code)).is_ok()
    }
}

/// An access/refresh key pair bound to a session. The id is stable across
/// renewals; the key strings and deadlines rotate together.
#[derive(Debug)]
pub struct Token {
    id: String,
    session_id: String,
    user_id: i64,
    access: String,
    refresh: String,
    access_expires: DateTime<Utc>,
    refresh_expires: DateTime<Utc>,
    killed_at: Option<DateTime<Utc>>,
}

impl Token {
    fn new(session_id: &str, user_id: i64, access_secs: u64, refresh_secs: u64) -> Self {
        let t = clock::now();
        Self {
            id: auth::generate_key(auth::KEY_NBYTES),
            session_id: session_id.to_string(),
            user_id,
            access: auth::generate_key(auth::KEY_NBYTES),
            refresh: auth::generate_key(auth::KEY_NBYTES),
            access_expires: t + Duration::seconds(access_secs as i64),
            refresh_expires: t + Duration::seconds(refresh_secs as i64),
            killed_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn access(&self) -> &str {
        &self.access
    }

    pub fn refresh(&self) -> &str {
        &self.refresh
    }

    /// Usable for authorized requests right now.
    pub fn active(&self, now: DateTime<Utc>) -> bool {
        self.killed_at.is_none() && now < self.access_expires
    }

    /// Beyond recovery: killed, or past the refresh deadline.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.killed_at.is_some() || now >= self.refresh_expires
    }

    /// Kill is terminal. Returns false if already killed.
    pub fn kill(&mut self) -> bool {
        if self.killed_at.is_some() {
            return false;
        }
        self.killed_at = Some(clock::now());
        true
    }

    /// Rotate both key strings and push both deadlines out from now.
    /// No-op on a killed token.
    pub fn renew(&mut self, access_secs: u64, refresh_secs: u64) -> bool {
        if self.killed_at.is_some() {
            return false;
        }
        let t = clock::now();
        self.access = auth::generate_key(auth::KEY_NBYTES);
        self.refresh = auth::generate_key(auth::KEY_NBYTES);
        self.access_expires = t + Duration::seconds(access_secs as i64);
        self.refresh_expires = t + Duration::seconds(refresh_secs as i64);
        true
    }

    pub fn to_json(&self) -> Value {
        json!({
            "access": self.access,
            "refresh": self.refresh,
            "access_expires": clock::format_timestamp(&self.access_expires),
            "refresh_expires": clock::format_timestamp(&self.refresh_expires),
            "killed": self.killed_at.is_some(),
            "killed_at": self.killed_at.as_ref().map(clock::format_timestamp),
        })
    }
}

/// A workstation/worker identity scoped to one user, outliving individual
/// tokens. Carries the live connections keyed by token id and an opaque
/// client state blob.
#[derive(Debug)]
pub struct Session {
    id: String,
    user: Arc<User>,
    state: Value,
    connections: HashMap<String, ConnHandle>,
}

impl Session {
    fn new(id: String, user: Arc<User>) -> Self {
        Self {
            id,
            user,
            state: json!({}),
            connections: HashMap::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "id": self.id, "state": self.state })
    }
}

/// Resolved caller identity attached to a request after key lookup.
#[derive(Debug, Clone)]
pub struct AuthCtx {
    pub token_id: String,
    pub session_id: String,
    pub user: Arc<User>,
}

#[derive(Default)]
struct RegistryInner {
    /// token id -> token
    tokens: HashMap<String, Token>,
    /// access/refresh key -> token id
    key_to_token: HashMap<String, String>,
    /// user id -> unexpired token ids
    user_to_tokens: HashMap<i64, HashSet<String>>,
    /// session id -> session
    sessions: HashMap<String, Session>,
}

/// In-memory session & token registry. All lookups and transitions take
/// the single inner lock; nothing awaits while holding it, so every
/// transition is atomic with respect to other tasks.
pub struct AuthRegistry {
    inner: RwLock<RegistryInner>,
    access_time: u64,
    refresh_time: u64,
    max_tokens_per_user: usize,
}

impl AuthRegistry {
    pub fn new(access_time: u64, refresh_time: u64, max_tokens_per_user: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            access_time,
            refresh_time,
            max_tokens_per_user,
        }
    }

    /// Mint a fresh token for `user`, reusing the supplied session when it
    /// belongs to the same user, creating a new one otherwise.
    pub async fn login(
        &self,
        user: Arc<User>,
        session_id: Option<&str>,
    ) -> Result<Value, ApiError> {
        let mut inner = self.inner.write().await;

        let held = inner
            .user_to_tokens
            .get(&user.id)
            .map_or(0, HashSet::len);
        if held >= self.max_tokens_per_user {
            return Err(ApiError::unauthorized("Too many unexpired tokens"));
        }

        let session_id = match session_id {
            Some(sid)
                if inner
                    .sessions
                    .get(sid)
                    .is_some_and(|s| s.user.id == user.id) =>
            {
                sid.to_string()
            }
            _ => {
                let sid = auth::generate_key(auth::SESSION_ID_NBYTES);
                inner
                    .sessions
                    .insert(sid.clone(), Session::new(sid.clone(), Arc::clone(&user)));
                tracing::info!(user = %user, session_id = %sid, "Session issued");
                sid
            }
        };

        let token = Token::new(&session_id, user.id, self.access_time, self.refresh_time);
        inner
            .key_to_token
            .insert(token.access.clone(), token.id.clone());
        inner
            .key_to_token
            .insert(token.refresh.clone(), token.id.clone());
        inner
            .user_to_tokens
            .entry(user.id)
            .or_default()
            .insert(token.id.clone());

        tracing::info!(user = %user, token_id = %token.id, "Token issued");
        let payload = token.to_json();
        inner.tokens.insert(token.id.clone(), token);
        Ok(payload)
    }

    /// Rotate the key pair addressed by a refresh key. The old strings stop
    /// resolving the moment the new ones are installed.
    pub async fn refresh(&self, refresh_key: &str) -> Result<Value, ApiError> {
        let now = clock::now();
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;

        let token_id = inner
            .key_to_token
            .get(refresh_key)
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("Invalid refresh token"))?;
        let token = inner
            .tokens
            .get_mut(&token_id)
            .ok_or_else(|| ApiError::unauthorized("Invalid refresh token"))?;
        if token.expired(now) {
            return Err(ApiError::unauthorized("Invalid refresh token"));
        }

        let old_access = token.access.clone();
        let old_refresh = token.refresh.clone();
        token.renew(self.access_time, self.refresh_time);
        let new_access = token.access.clone();
        let new_refresh = token.refresh.clone();
        let session_id = token.session_id.clone();
        let payload = token.to_json();

        inner.key_to_token.remove(&old_access);
        inner.key_to_token.remove(&old_refresh);
        inner.key_to_token.insert(new_access, token_id.clone());
        inner.key_to_token.insert(new_refresh, token_id.clone());

        if let Some(session) = inner.sessions.get(&session_id) {
            tracing::info!(user = %session.user, token_id = %token_id, "Token renewed");
        }
        Ok(payload)
    }

    /// Kill the token. It stays addressable (and reported as killed) until
    /// the sweeper collects it.
    pub async fn logout(&self, token_id: &str) -> Result<Value, ApiError> {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        let token = inner
            .tokens
            .get_mut(token_id)
            .ok_or_else(|| ApiError::unauthorized("Invalid access token"))?;
        token.kill();
        let payload = token.to_json();
        let session_id = token.session_id.clone();
        if let Some(session) = inner.sessions.get(&session_id) {
            tracing::info!(user = %session.user, token_id = %token_id, "Token killed");
        }
        Ok(payload)
    }

    /// Resolve any live token by key, active or not. Used by ratelimit
    /// buckets, which only need the caller identity.
    pub async fn lookup(&self, key: &str) -> Option<AuthCtx> {
        let inner = self.inner.read().await;
        let token = inner.tokens.get(inner.key_to_token.get(key)?)?;
        let session = inner.sessions.get(&token.session_id)?;
        Some(AuthCtx {
            token_id: token.id.clone(),
            session_id: token.session_id.clone(),
            user: Arc::clone(&session.user),
        })
    }

    /// Resolve an access key that must authorize requests right now.
    pub async fn lookup_active(&self, key: &str) -> Option<AuthCtx> {
        let now = clock::now();
        let inner = self.inner.read().await;
        let token = inner.tokens.get(inner.key_to_token.get(key)?)?;
        if !token.active(now) {
            return None;
        }
        let session = inner.sessions.get(&token.session_id)?;
        Some(AuthCtx {
            token_id: token.id.clone(),
            session_id: token.session_id.clone(),
            user: Arc::clone(&session.user),
        })
    }

    /// Register a connection under its token. At most one live connection
    /// per token.
    pub async fn attach_connection(
        &self,
        token_id: &str,
        session_id: &str,
        handle: ConnHandle,
    ) -> Result<(), ApiError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ApiError::unauthorized("Invalid access token"))?;
        if session.connections.contains_key(token_id) {
            return Err(ApiError::conflict(
                "Connection already established for this token",
                serde_json::Map::new(),
            ));
        }
        session.connections.insert(token_id.to_string(), handle);
        Ok(())
    }

    /// Clone of the connection handle registered under a token, if any.
    pub async fn connection_handle(
        &self,
        token_id: &str,
        session_id: &str,
    ) -> Option<ConnHandle> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(session_id)?
            .connections
            .get(token_id)
            .cloned()
    }

    pub async fn detach_connection(&self, token_id: &str, session_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.connections.remove(token_id);
        }
    }

    pub async fn session_json(&self, session_id: &str) -> Option<Value> {
        let inner = self.inner.read().await;
        inner.sessions.get(session_id).map(Session::to_json)
    }

    /// One sweeper pass:
    /// 1. drop expired tokens (both keys), marking their connections;
    /// 2. prune empty per-user token sets;
    /// 3. force-close the marked connections with TokenExpired;
    /// 4. release resources of connection-less sessions and discard
    ///    sessions whose user holds no tokens.
    ///
    /// Iterates over key snapshots and tolerates entries that vanish
    /// between snapshot and lookup.
    pub async fn sweep(&self, resources: &ResourceManager) {
        let now = clock::now();
        let mut to_close: Vec<ConnHandle> = Vec::new();
        let mut to_release: Vec<String> = Vec::new();

        {
            let mut inner = self.inner.write().await;

            let keys: Vec<String> = inner.key_to_token.keys().cloned().collect();
            for key in keys {
                let Some(token_id) = inner.key_to_token.get(&key).cloned() else {
                    continue;
                };
                let Some(token) = inner.tokens.get(&token_id) else {
                    inner.key_to_token.remove(&key);
                    continue;
                };
                if !token.expired(now) {
                    continue;
                }

                let access = token.access.clone();
                let refresh = token.refresh.clone();
                let session_id = token.session_id.clone();
                let user_id = token.user_id;

                inner.key_to_token.remove(&access);
                inner.key_to_token.remove(&refresh);

                if let Some(conn) = inner
                    .sessions
                    .get(&session_id)
                    .and_then(|s| s.connections.get(&token_id))
                {
                    to_close.push(conn.clone());
                }

                if let Some(set) = inner.user_to_tokens.get_mut(&user_id)
                    && set.remove(&token_id)
                {
                    tracing::info!(user_id, token_id = %token_id, "Token discarded");
                }
                inner.tokens.remove(&token_id);
            }

            inner.user_to_tokens.retain(|user_id, set| {
                if set.is_empty() {
                    tracing::info!(user_id, "Discarded empty token set");
                    false
                } else {
                    true
                }
            });

            let session_ids: Vec<String> = inner.sessions.keys().cloned().collect();
            for session_id in session_ids {
                let Some(session) = inner.sessions.get(&session_id) else {
                    continue;
                };
                if session.connections.is_empty() {
                    to_release.push(session_id.clone());
                }
                if !inner.user_to_tokens.contains_key(&session.user.id) {
                    let session = inner.sessions.remove(&session_id);
                    if let Some(session) = session {
                        tracing::info!(
                            user = %session.user,
                            session_id = %session_id,
                            "Session discarded"
                        );
                    }
                }
            }
        }

        for conn in to_close {
            conn.close(CloseCode::TokenExpired.code());
        }
        for session_id in to_release {
            resources.release_session(&session_id).await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn token_count(&self) -> usize {
        self.inner.read().await.tokens.len()
    }

    #[cfg(test)]
    pub(crate) async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    #[cfg(test)]
    pub(crate) async fn key_map_len(&self) -> usize {
        self.inner.read().await.key_to_token.len()
    }
}
