use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

use crate::error::ApiError;
use crate::registry::{AuthCtx, AuthRegistry};

/// How a ratelimit partitions its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Ip,
    User,
    Token,
    Route,
}

/// Run TTL cleanup of foreign keys every this many calls to check().
const TTL_CLEANUP_INTERVAL: u64 = 512;

/// One `{limit, interval, bucket}` policy with its own hit table. Tables
/// are per-policy and per-route: two routes carrying identical policies do
/// not share counters.
pub struct Policy {
    limit: usize,
    interval: Duration,
    bucket: Bucket,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
    call_count: AtomicU64,
}

impl Policy {
    pub fn new(limit: usize, interval_secs: u64, bucket: Bucket) -> Self {
        Self {
            limit,
            interval: Duration::from_secs(interval_secs),
            bucket,
            hits: Mutex::new(HashMap::new()),
            call_count: AtomicU64::new(0),
        }
    }

    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    /// Record a hit for `key`, rejecting with 429 once `limit` hits sit
    /// inside the window.
    pub fn check(&self, key: &str) -> Result<(), ApiError> {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        // Periodic sweep of expired entries under other keys, so one-shot
        // callers do not accumulate forever.
        let count = self.call_count.fetch_add(1, Ordering::Relaxed);
        if count % TTL_CLEANUP_INTERVAL == 0 {
            hits.retain(|_, timestamps| {
                timestamps.retain(|t| *t + self.interval > now);
                !timestamps.is_empty()
            });
        }

        let entry = hits.entry(key.to_string()).or_default();
        entry.retain(|t| *t + self.interval > now);

        if entry.len() >= self.limit {
            return Err(ApiError::TooManyRequests {
                interval: self.interval.as_secs(),
            });
        }

        entry.push(now);
        Ok(())
    }
}

/// Which side of the platform a route is reserved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Operator,
    Autopilot,
}

/// Everything a guard needs to know about the incoming request.
pub struct RequestMeta<'a> {
    pub headers: &'a HeaderMap,
    pub remote: Option<IpAddr>,
    pub proxy: bool,
}

/// The ordered check chain attached to one route at registration time:
/// ratelimit policies first, then the role restriction, then access
/// validation. Mirrors the decorator stacks on the handlers, evaluated
/// outermost-first; the first rejection wins.
pub struct RouteGuard {
    route: &'static str,
    policies: Vec<Policy>,
    restrict: Option<Role>,
    validate_access: bool,
}

impl RouteGuard {
    pub fn new(route: &'static str) -> Self {
        Self {
            route,
            policies: Vec::new(),
            restrict: None,
            validate_access: false,
        }
    }

    pub fn ratelimit(mut self, limit: usize, interval_secs: u64, bucket: Bucket) -> Self {
        self.policies.push(Policy::new(limit, interval_secs, bucket));
        self
    }

    pub fn user_only(mut self) -> Self {
        self.restrict = Some(Role::Operator);
        self
    }

    pub fn autopilot_only(mut self) -> Self {
        self.restrict = Some(Role::Autopilot);
        self
    }

    pub fn validate_access(mut self) -> Self {
        self.validate_access = true;
        self
    }

    /// Evaluate the chain. Returns the resolved caller when access
    /// validation is part of the chain and passed.
    pub async fn check(
        &self,
        registry: &AuthRegistry,
        meta: RequestMeta<'_>,
    ) -> Result<Option<AuthCtx>, ApiError> {
        let access = bearer_key(meta.headers);
        let ctx = match access {
            Some(key) => registry.lookup(key).await,
            None => None,
        };

        for policy in &self.policies {
            let key = self.bucket_key(policy.bucket(), &meta, access, ctx.as_ref());
            if let Err(err) = policy.check(&key) {
                tracing::info!(
                    route = self.route,
                    bucket = ?policy.bucket(),
                    "Route has hit a ratelimit"
                );
                return Err(err);
            }
        }

        if let (Some(role), Some(ctx)) = (self.restrict, ctx.as_ref()) {
            let allowed = match role {
                Role::Operator => !ctx.user.autopilot,
                Role::Autopilot => ctx.user.autopilot,
            };
            if !allowed {
                let message = match role {
                    Role::Operator => "Endpoint is restricted to users",
                    Role::Autopilot => "Endpoint is restricted to autopilots",
                };
                return Err(ApiError::forbidden(message, serde_json::Map::new()));
            }
        }

        if self.validate_access {
            let key = access.ok_or_else(|| ApiError::bad_request("Missing access token"))?;
            let ctx = registry
                .lookup_active(key)
                .await
                .ok_or_else(|| ApiError::unauthorized("Invalid access token"))?;
            return Ok(Some(ctx));
        }

        Ok(ctx)
    }

    fn bucket_key(
        &self,
        bucket: Bucket,
        meta: &RequestMeta<'_>,
        access: Option<&str>,
        ctx: Option<&AuthCtx>,
    ) -> String {
        match bucket {
            Bucket::Ip => client_ip(meta).unwrap_or_else(|| "anon".to_string()),
            Bucket::User => ctx
                .map(|c| c.user.id.to_string())
                .unwrap_or_else(|| "anon".to_string()),
            Bucket::Token => access
                .map(str::to_string)
                .unwrap_or_else(|| "anon".to_string()),
            Bucket::Route => self.route.to_string(),
        }
    }
}

/// Extract the access key from `Authorization: Bearer <key>`.
pub fn bearer_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Resolve the caller address: first X-Forwarded-For element in proxy
/// mode, else X-Real-IP, else the remote socket address.
fn client_ip(meta: &RequestMeta<'_>) -> Option<String> {
    if meta.proxy
        && let Some(forwarded) = meta.headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }

    if let Some(real_ip) = meta.headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
    {
        return Some(value.trim().to_string());
    }

    meta.remote.map(|ip| ip.to_string())
}
