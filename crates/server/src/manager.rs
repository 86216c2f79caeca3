use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Duration;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use quill_protocol::clock;

use crate::db::Directory;
use crate::error::ApiError;
use crate::resource::{Holder, JsonVersion, QuoteResource, Resource};

/// Cache key: resource type plus numeric id.
pub type ResourceKey = (String, i64);

const LOCKED_MSG: &str = "Requested resource is already locked by another session.";
const SESSION_BOUND_MSG: &str = "Requesting session is already bound to a resource.";
const NOT_OWNED_MSG: &str = "Requesting session is not bound to the requested resource.";

fn locked_error(holder_display: &str) -> ApiError {
    let mut extra = Map::new();
    extra.insert("locked_by".to_string(), Value::from(holder_display));
    ApiError::conflict(LOCKED_MSG, extra)
}

fn session_error(message: &str, session_json: Value) -> ApiError {
    let mut extra = Map::new();
    extra.insert("session".to_string(), session_json);
    ApiError::conflict(message, extra)
}

#[derive(Default)]
struct ManagerInner {
    cache: HashMap<ResourceKey, Box<dyn Resource>>,
    /// Reverse side of the lock: which resource a session holds.
    session_to_resource: HashMap<String, ResourceKey>,
}

/// Owns the resource cache and both directions of the lock relation.
/// Lock transitions mutate both sides under one write guard, so the
/// bidirectional invariant holds at every suspension point.
pub struct ResourceManager {
    inner: RwLock<ManagerInner>,
    directory: Arc<dyn Directory>,
    grace: Duration,
}

impl ResourceManager {
    pub fn new(directory: Arc<dyn Directory>, grace_secs: u64) -> Self {
        Self {
            inner: RwLock::new(ManagerInner::default()),
            directory,
            grace: Duration::seconds(grace_secs as i64),
        }
    }

    /// Resolve `(rtype, rid)` into a cached resource, hydrating from the
    /// directory on first touch. Unknown types and unparsable ids are 400;
    /// a loader that finds nothing is 404.
    pub async fn load(&self, rtype: &str, rid_raw: &str) -> Result<ResourceKey, ApiError> {
        let rid: i64 = rid_raw
            .parse()
            .map_err(|_| ApiError::bad_request("Invalid resource id"))?;
        let key = (rtype.to_string(), rid);

        {
            let inner = self.inner.read().await;
            if inner.cache.contains_key(&key) {
                return Ok(key);
            }
        }

        let resource = self.hydrate(rtype, rid).await?;
        let mut inner = self.inner.write().await;
        inner.cache.entry(key.clone()).or_insert(resource);
        Ok(key)
    }

    /// The loader catalogue. Loaders fetch their dependent records
    /// concurrently once the primary row is known.
    async fn hydrate(&self, rtype: &str, rid: i64) -> Result<Box<dyn Resource>, ApiError> {
        match rtype {
            QuoteResource::RTYPE => {
                let record = self
                    .directory
                    .quote(rid)
                    .await?
                    .ok_or_else(|| ApiError::not_found("Quote not found"))?;
                let (owner, items) = tokio::try_join!(
                    self.directory.user_by_id(record.owner_id),
                    self.directory.quote_items(rid),
                )?;
                let owner = owner.ok_or_else(|| ApiError::not_found("Quote owner not found"))?;
                Ok(Box::new(QuoteResource::new(record, owner, items)))
            }
            _ => Err(ApiError::bad_request("Unknown resource type")),
        }
    }

    /// The resource owner's user snapshot, for permission evaluation.
    pub async fn owner(&self, key: &ResourceKey) -> Result<Arc<quill_protocol::User>, ApiError> {
        let inner = self.inner.read().await;
        let resource = inner
            .cache
            .get(key)
            .ok_or_else(|| ApiError::Internal(anyhow!("resource vanished from cache")))?;
        Ok(Arc::clone(resource.owner()))
    }

    pub async fn resource_json(
        &self,
        key: &ResourceKey,
        version: JsonVersion,
    ) -> Result<Value, ApiError> {
        let inner = self.inner.read().await;
        let resource = inner
            .cache
            .get(key)
            .ok_or_else(|| ApiError::Internal(anyhow!("resource vanished from cache")))?;
        Ok(resource.to_json(version))
    }

    /// Bind a resource to a session. Checked in protocol order: a resource
    /// held elsewhere wins over the session already being bound.
    pub async fn acquire(
        &self,
        key: &ResourceKey,
        session_id: &str,
        display_name: &str,
        session_json: Value,
    ) -> Result<Value, ApiError> {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        let resource = inner
            .cache
            .get_mut(key)
            .ok_or_else(|| ApiError::Internal(anyhow!("resource vanished from cache")))?;

        if let Some(holder) = resource.lock().holder() {
            return Err(locked_error(&holder.display));
        }
        if inner.session_to_resource.contains_key(session_id) {
            return Err(session_error(SESSION_BOUND_MSG, session_json));
        }

        resource.lock_mut().bind(Holder {
            session_id: session_id.to_string(),
            display: display_name.to_string(),
        });
        inner
            .session_to_resource
            .insert(session_id.to_string(), key.clone());
        tracing::info!(
            rtype = %key.0,
            rid = key.1,
            session_id = %session_id,
            holder = %display_name,
            "Resource acquired"
        );
        Ok(resource.to_json(JsonVersion::Metadata))
    }

    /// Release a resource. Unlocked is a no-op; a mismatched session is a
    /// conflict unless `unconditional`.
    pub async fn release(
        &self,
        key: &ResourceKey,
        session_id: &str,
        session_json: Value,
        unconditional: bool,
    ) -> Result<Value, ApiError> {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        let resource = inner
            .cache
            .get_mut(key)
            .ok_or_else(|| ApiError::Internal(anyhow!("resource vanished from cache")))?;

        let holder_session = resource.lock().holder().map(|h| h.session_id.clone());
        match holder_session {
            None => {}
            Some(holder) if unconditional || holder == session_id => {
                resource.lock_mut().release();
                inner.session_to_resource.remove(&holder);
                tracing::info!(
                    rtype = %key.0,
                    rid = key.1,
                    session_id = %holder,
                    "Resource released"
                );
            }
            Some(_) => return Err(session_error(NOT_OWNED_MSG, session_json)),
        }
        Ok(resource.to_json(JsonVersion::Metadata))
    }

    /// Require that `session_id` currently holds the resource.
    pub async fn ensure_acquired(
        &self,
        key: &ResourceKey,
        session_id: &str,
        session_json: Value,
    ) -> Result<(), ApiError> {
        let inner = self.inner.read().await;
        let resource = inner
            .cache
            .get(key)
            .ok_or_else(|| ApiError::Internal(anyhow!("resource vanished from cache")))?;
        match resource.lock().holder() {
            Some(holder) if holder.session_id == session_id => Ok(()),
            _ => Err(session_error(NOT_OWNED_MSG, session_json)),
        }
    }

    /// Unconditionally release whatever `session_id` holds. Used by the
    /// credential sweeper for connection-less sessions.
    pub async fn release_session(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        if let Some(key) = inner.session_to_resource.remove(session_id)
            && let Some(resource) = inner.cache.get_mut(&key)
        {
            resource.lock_mut().release();
            tracing::info!(
                rtype = %key.0,
                rid = key.1,
                session_id = %session_id,
                "Resource released"
            );
        }
    }

    /// Drop unlocked cache entries that have idled past the grace period.
    /// Acquired resources are never evicted.
    pub async fn evict_idle(&self) {
        let now = clock::now();
        let grace = self.grace;
        let mut inner = self.inner.write().await;
        inner.cache.retain(|key, resource| {
            if resource.lock().is_idle(grace, now) {
                tracing::info!(rtype = %key.0, rid = key.1, "Evicted idle resource");
                false
            } else {
                true
            }
        });
    }

    #[cfg(test)]
    pub(crate) async fn cached(&self, key: &ResourceKey) -> bool {
        self.inner.read().await.cache.contains_key(key)
    }
}
