use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};

use quill_protocol::{User, clock};

use crate::db::{QuoteItem, QuoteRecord};

/// How much of a resource a serialization exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonVersion {
    /// Lock bookkeeping only; returned by acquire/release.
    Metadata,
    /// Listing card: enough to pick a resource without holding it.
    Preview,
    /// Full document; requires the caller to hold the lock.
    View,
}

/// The session currently holding a resource.
#[derive(Debug, Clone)]
pub struct Holder {
    pub session_id: String,
    pub display: String,
}

/// Lock bookkeeping shared by every resource kind via composition.
///
/// `last_active` is refreshed on release, not on acquire: a locked
/// resource is never idle by virtue of being locked.
#[derive(Debug, Clone)]
pub struct LockState {
    bound: Option<Holder>,
    last_active: DateTime<Utc>,
}

impl LockState {
    pub fn new() -> Self {
        Self {
            bound: None,
            last_active: clock::now(),
        }
    }

    pub fn locked(&self) -> bool {
        self.bound.is_some()
    }

    pub fn holder(&self) -> Option<&Holder> {
        self.bound.as_ref()
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }

    pub fn is_idle(&self, grace: Duration, now: DateTime<Utc>) -> bool {
        self.bound.is_none() && self.last_active + grace < now
    }

    pub(crate) fn bind(&mut self, holder: Holder) {
        self.bound = Some(holder);
    }

    pub(crate) fn release(&mut self) {
        self.bound = None;
        self.last_active = clock::now();
    }
}

impl Default for LockState {
    fn default() -> Self {
        Self::new()
    }
}

/// A server-side editable document with an at-most-one-writer lock.
/// One concrete type per kind in the catalogue.
pub trait Resource: Send + Sync {
    fn rtype(&self) -> &'static str;
    fn id(&self) -> i64;
    fn owner(&self) -> &Arc<User>;
    fn lock(&self) -> &LockState;
    fn lock_mut(&mut self) -> &mut LockState;
    fn to_json(&self, version: JsonVersion) -> Value;
}

pub struct QuoteResource {
    id: i64,
    title: String,
    owner: Arc<User>,
    items: Vec<QuoteItem>,
    lock: LockState,
}

impl QuoteResource {
    pub const RTYPE: &'static str = "quote";

    pub fn new(record: QuoteRecord, owner: Arc<User>, items: Vec<QuoteItem>) -> Self {
        Self {
            id: record.id,
            title: record.title,
            owner,
            items,
            lock: LockState::new(),
        }
    }

    pub fn formatted_id(&self) -> String {
        format!("SQ{:08}", self.id)
    }
}

impl Resource for QuoteResource {
    fn rtype(&self) -> &'static str {
        Self::RTYPE
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn owner(&self) -> &Arc<User> {
        &self.owner
    }

    fn lock(&self) -> &LockState {
        &self.lock
    }

    fn lock_mut(&mut self) -> &mut LockState {
        &mut self.lock
    }

    fn to_json(&self, version: JsonVersion) -> Value {
        match version {
            JsonVersion::Metadata => json!({
                "id": self.id,
                "formatted_id": self.formatted_id(),
                "type": Self::RTYPE,
                "locked": self.lock.locked(),
            }),
            JsonVersion::Preview => json!({
                "id": self.id,
                "formatted_id": self.formatted_id(),
                "type": Self::RTYPE,
                "title": self.title,
                "owner": { "id": self.owner.id, "name": self.owner.display() },
                "locked": self.lock.locked(),
            }),
            JsonVersion::View => json!({
                "id": self.id,
                "formatted_id": self.formatted_id(),
                "type": Self::RTYPE,
                "title": self.title,
                "owner": self.owner.to_json(),
                "items": self.items,
                "locked": self.lock.locked(),
                "last_active": clock::format_timestamp(&self.lock.last_active()),
            }),
        }
    }
}
