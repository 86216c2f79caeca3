use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Path, State};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{Map, Value, json};
use tower_http::limit::RequestBodyLimitLayer;

use quill_protocol::{
    LoginRequest, PermissionType, QuillConfig, RefreshRequest, User,
};

use crate::autopilot::Scheduler;
use crate::db::Directory;
use crate::error::ApiError;
use crate::manager::{ResourceKey, ResourceManager};
use crate::ratelimit::{Bucket, RequestMeta, Role, RouteGuard};
use crate::registry::{AuthCtx, AuthRegistry, ConnHandle};
use crate::resource::JsonVersion;
use crate::ws::{self, WsSettings};

/// One guard per route, built at registration time. Each carries its own
/// policy stack and hit tables.
pub struct Guards {
    pub login: RouteGuard,
    pub refresh: RouteGuard,
    pub logout: RouteGuard,
    pub acquire: RouteGuard,
    pub release: RouteGuard,
    pub preview: RouteGuard,
    pub view: RouteGuard,
    pub ws_user: RouteGuard,
    pub ws_autopilot: RouteGuard,
}

impl Guards {
    fn new() -> Self {
        let resource = |route: &'static str| {
            RouteGuard::new(route)
                .ratelimit(10, 60, Bucket::User)
                .user_only()
                .validate_access()
        };
        Self {
            login: RouteGuard::new("post.auth-login")
                .ratelimit(10, 60, Bucket::Ip)
                .ratelimit(100, 60, Bucket::Route),
            refresh: RouteGuard::new("post.auth-refresh")
                .ratelimit(10, 60, Bucket::Ip)
                .ratelimit(10, 60, Bucket::Token),
            logout: RouteGuard::new("post.auth-logout")
                .ratelimit(10, 60, Bucket::Ip)
                .ratelimit(10, 60, Bucket::User)
                .validate_access(),
            acquire: resource("post.resource-acquire"),
            release: resource("post.resource-release"),
            preview: resource("get.resource-preview"),
            view: resource("get.resource-view"),
            ws_user: RouteGuard::new("get.ws-user")
                .ratelimit(10, 60, Bucket::Token)
                .user_only()
                .validate_access(),
            ws_autopilot: RouteGuard::new("get.ws-autopilot")
                .ratelimit(10, 60, Bucket::Token)
                .autopilot_only()
                .validate_access(),
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub config: QuillConfig,
    pub registry: AuthRegistry,
    pub resources: Arc<ResourceManager>,
    pub scheduler: Arc<Scheduler>,
    pub directory: Arc<dyn Directory>,
    pub guards: Guards,
}

impl AppState {
    pub fn new(config: QuillConfig, directory: Arc<dyn Directory>) -> Self {
        let api = &config.server.api;
        Self {
            registry: AuthRegistry::new(
                api.access_time,
                api.refresh_time,
                api.max_tokens_per_user,
            ),
            resources: Arc::new(ResourceManager::new(
                Arc::clone(&directory),
                api.resource_grace,
            )),
            scheduler: Arc::new(Scheduler::new()),
            directory,
            guards: Guards::new(),
            config,
        }
    }

    fn ws_settings(&self) -> WsSettings {
        let api = &self.config.server.api;
        WsSettings {
            heartbeat: Duration::from_secs(api.ws_heartbeat),
            message_limit: api.ws_message_limit,
            message_interval: Duration::from_secs(api.ws_message_interval),
        }
    }

    async fn authorize(
        &self,
        guard: &RouteGuard,
        headers: &HeaderMap,
        remote: Option<IpAddr>,
    ) -> Result<AuthCtx, ApiError> {
        let meta = RequestMeta {
            headers,
            remote,
            proxy: self.config.server.api.proxy,
        };
        guard
            .check(&self.registry, meta)
            .await?
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("guard without access validation")))
    }

    async fn authorize_public(
        &self,
        guard: &RouteGuard,
        headers: &HeaderMap,
        remote: Option<IpAddr>,
    ) -> Result<(), ApiError> {
        let meta = RequestMeta {
            headers,
            remote,
            proxy: self.config.server.api.proxy,
        };
        guard.check(&self.registry, meta).await.map(|_| ())
    }

    async fn session_json(&self, ctx: &AuthCtx) -> Value {
        self.registry
            .session_json(&ctx.session_id)
            .await
            .unwrap_or_else(|| json!({ "id": ctx.session_id }))
    }
}

/// Peer address when the router is served with connect info; absent in
/// tests driving the router directly.
pub struct ClientAddr(pub Option<IpAddr>);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip()),
        ))
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/resource/{rtype}/{rid}/acquire", post(acquire_resource))
        .route("/resource/{rtype}/{rid}/release", post(release_resource))
        .route("/resource/{rtype}/{rid}/preview", get(preview_resource))
        .route("/resource/{rtype}/{rid}/view", get(view_resource))
        .route("/ws/user", get(user_ws))
        .route("/ws/autopilot", get(autopilot_ws))
        .route("/health", get(health))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .with_state(state)
}

fn ok_token(token: Value) -> Json<Value> {
    Json(json!({ "message": "Ok", "token": token }))
}

fn ok_resource(resource: Value) -> Json<Value> {
    Json(json!({ "message": "Ok", "resource": resource }))
}

fn parse_body<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
    reason: &'static str,
) -> Result<T, ApiError> {
    serde_json::from_slice(bytes).map_err(|_| ApiError::bad_request(reason))
}

fn require_permission(
    user: &User,
    kind: PermissionType,
    owner: &User,
    key: &ResourceKey,
) -> Result<(), ApiError> {
    if user.has_permission_for(kind, owner) {
        return Ok(());
    }
    let mut extra = Map::new();
    extra.insert("permission".to_string(), json!(kind));
    extra.insert("resource_type".to_string(), json!(key.0));
    extra.insert("resource_id".to_string(), json!(key.1));
    Err(ApiError::forbidden(
        "Requesting user lacks the required permission",
        extra,
    ))
}

/// POST /auth/login
///
/// Verify credentials and mint a fresh token against a new or reused
/// session.
async fn login(
    State(state): State<Arc<AppState>>,
    addr: ClientAddr,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<Value>, ApiError> {
    state
        .authorize_public(&state.guards.login, &headers, addr.0)
        .await?;

    let request: LoginRequest = parse_body(&body, "Missing or invalid username/password")?;
    tracing::info!(username = %request.username, "Login request");

    let user = state
        .directory
        .authenticate(&request.username, &request.password)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Incorrect username/password"))?;

    let token = state
        .registry
        .login(user, request.session_id.as_deref())
        .await?;
    Ok(ok_token(token))
}

/// POST /auth/refresh
///
/// Rotate the key pair addressed by the supplied refresh key.
async fn refresh(
    State(state): State<Arc<AppState>>,
    addr: ClientAddr,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<Value>, ApiError> {
    state
        .authorize_public(&state.guards.refresh, &headers, addr.0)
        .await?;

    let request: RefreshRequest = parse_body(&body, "Missing refresh token")?;
    let token = state.registry.refresh(&request.refresh).await?;
    Ok(ok_token(token))
}

/// POST /auth/logout
///
/// Kill the caller's token. It stays visible (as killed) until swept.
async fn logout(
    State(state): State<Arc<AppState>>,
    addr: ClientAddr,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = state
        .authorize(&state.guards.logout, &headers, addr.0)
        .await?;
    let token = state.registry.logout(&ctx.token_id).await?;
    Ok(ok_token(token))
}

/// POST /resource/{rtype}/{rid}/acquire
async fn acquire_resource(
    State(state): State<Arc<AppState>>,
    Path((rtype, rid)): Path<(String, String)>,
    addr: ClientAddr,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = state
        .authorize(&state.guards.acquire, &headers, addr.0)
        .await?;

    let key = state.resources.load(&rtype, &rid).await?;
    let owner = state.resources.owner(&key).await?;
    require_permission(&ctx.user, PermissionType::Acquire, &owner, &key)?;

    let session_json = state.session_json(&ctx).await;
    let resource = state
        .resources
        .acquire(&key, &ctx.session_id, ctx.user.display(), session_json)
        .await?;
    Ok(ok_resource(resource))
}

/// POST /resource/{rtype}/{rid}/release
async fn release_resource(
    State(state): State<Arc<AppState>>,
    Path((rtype, rid)): Path<(String, String)>,
    addr: ClientAddr,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = state
        .authorize(&state.guards.release, &headers, addr.0)
        .await?;

    let key = state.resources.load(&rtype, &rid).await?;
    let session_json = state.session_json(&ctx).await;
    let resource = state
        .resources
        .release(&key, &ctx.session_id, session_json, false)
        .await?;
    Ok(ok_resource(resource))
}

/// GET /resource/{rtype}/{rid}/preview
async fn preview_resource(
    State(state): State<Arc<AppState>>,
    Path((rtype, rid)): Path<(String, String)>,
    addr: ClientAddr,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = state
        .authorize(&state.guards.preview, &headers, addr.0)
        .await?;

    let key = state.resources.load(&rtype, &rid).await?;
    let owner = state.resources.owner(&key).await?;
    require_permission(&ctx.user, PermissionType::Preview, &owner, &key)?;

    let resource = state.resources.resource_json(&key, JsonVersion::Preview).await?;
    Ok(ok_resource(resource))
}

/// GET /resource/{rtype}/{rid}/view
///
/// Full document; the caller's session must hold the lock.
async fn view_resource(
    State(state): State<Arc<AppState>>,
    Path((rtype, rid)): Path<(String, String)>,
    addr: ClientAddr,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ctx = state
        .authorize(&state.guards.view, &headers, addr.0)
        .await?;

    let key = state.resources.load(&rtype, &rid).await?;
    let owner = state.resources.owner(&key).await?;
    require_permission(&ctx.user, PermissionType::View, &owner, &key)?;

    let session_json = state.session_json(&ctx).await;
    state
        .resources
        .ensure_acquired(&key, &ctx.session_id, session_json)
        .await?;

    let resource = state.resources.resource_json(&key, JsonVersion::View).await?;
    Ok(ok_resource(resource))
}

/// GET /ws/user - WebSocket upgrade for operator connections.
async fn user_ws(
    State(state): State<Arc<AppState>>,
    addr: ClientAddr,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    serve_ws(state, addr, headers, upgrade, Role::Operator).await
}

/// GET /ws/autopilot - WebSocket upgrade for worker connections.
async fn autopilot_ws(
    State(state): State<Arc<AppState>>,
    addr: ClientAddr,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    serve_ws(state, addr, headers, upgrade, Role::Autopilot).await
}

async fn serve_ws(
    state: Arc<AppState>,
    addr: ClientAddr,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
    role: Role,
) -> Result<Response, ApiError> {
    let guard = match role {
        Role::Operator => &state.guards.ws_user,
        Role::Autopilot => &state.guards.ws_autopilot,
    };
    let ctx = state.authorize(guard, &headers, addr.0).await?;

    // Prepare: at most one live connection per token, registered before
    // the upgrade completes.
    let (handle, outbound) = ConnHandle::channel();
    state
        .registry
        .attach_connection(&ctx.token_id, &ctx.session_id, handle)
        .await?;

    let settings = state.ws_settings();
    let max_message_size = state.config.server.api.ws_max_message_size * 1024;
    let state = Arc::clone(&state);
    Ok(upgrade
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| {
            ws::serve_connection(socket, state, ctx, role, outbound, settings)
        })
        .into_response())
}

/// GET /health - liveness probe (no auth required)
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// --- HTTP-level integration tests ---
//
// These use `tower::ServiceExt::oneshot` to send requests through the axum
// router without starting a real HTTP server, backed by the in-memory
// directory instead of Postgres.
#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use quill_protocol::{Company, Permission, PermissionScope, Team};

    use crate::db::memory::MemoryDirectory;

    fn team(id: i64, company_id: i64, hierarchy: i32, permissions: Vec<Permission>) -> Team {
        Team {
            id,
            name: format!("team-{id}"),
            hierarchy_index: hierarchy,
            company: Company {
                id: company_id,
                name: format!("company-{company_id}"),
            },
            permissions,
        }
    }

    fn operator_permissions() -> Vec<Permission> {
        vec![
            Permission::new(PermissionType::Acquire, PermissionScope::Company),
            Permission::new(PermissionType::Preview, PermissionScope::Company),
            Permission::new(PermissionType::View, PermissionScope::Company),
        ]
    }

    /// alice and bob share company 1 and can work on each other's quotes;
    /// mallory is in company 2 with no overlap. Quotes 7 and 8 belong to
    /// alice.
    fn test_app_state() -> Arc<AppState> {
        let mut directory = MemoryDirectory::new();
        directory.add_user(
            User {
                id: 1,
                username: "alice".into(),
                display_name: Some("Alice Walker".into()),
                email: Some("alice@example.com".into()),
                autopilot: false,
                admin: false,
                teams: vec![team(1, 1, 5, operator_permissions())],
            },
            "alice-pw",
        );
        directory.add_user(
            User {
                id: 2,
                username: "bob".into(),
                display_name: None,
                email: None,
                autopilot: false,
                admin: false,
                teams: vec![team(2, 1, 5, operator_permissions())],
            },
            "bob-pw",
        );
        directory.add_user(
            User {
                id: 3,
                username: "mallory".into(),
                display_name: None,
                email: None,
                autopilot: false,
                admin: false,
                teams: vec![team(3, 2, 5, operator_permissions())],
            },
            "mallory-pw",
        );
        directory.add_quote(7, 1, "Door set, phase 2");
        directory.add_quote(8, 1, "Door set, phase 3");

        let config: QuillConfig = toml::from_str("").expect("default config");
        Arc::new(AppState::new(config, Arc::new(directory)))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("response body is not valid JSON")
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn login(app: &Router, username: &str, password: &str) -> Value {
        let response = send(
            app,
            "POST",
            "/auth/login",
            None,
            Some(json!({"username": username, "password": password})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["message"], "Ok");
        json["token"].clone()
    }

    #[tokio::test]
    async fn health_returns_ok_unauthenticated() {
        let app = build_router(test_app_state());
        let response = send(&app, "GET", "/health", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn login_returns_token_payload() {
        let app = build_router(test_app_state());
        let token = login(&app, "alice", "alice-pw").await;
        assert!(token["access"].is_string());
        assert!(token["refresh"].is_string());
        assert!(token["access_expires"].is_string());
        assert!(token["refresh_expires"].is_string());
        assert_eq!(token["killed"], false);
        assert!(token["killed_at"].is_null());
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials() {
        let app = build_router(test_app_state());
        let response = send(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({"username": "alice", "password": "wrong"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["message"], "Incorrect username/password");

        let response = send(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({"username": "ghost", "password": "whatever"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_rejects_malformed_body() {
        let app = build_router(test_app_state());
        let response = send(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({"username": 42})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["message"], "Missing or invalid username/password");
    }

    #[tokio::test]
    async fn login_refresh_logout_lifecycle() {
        let app = build_router(test_app_state());
        let token = login(&app, "alice", "alice-pw").await;
        let access0 = token["access"].as_str().unwrap().to_string();
        let refresh0 = token["refresh"].as_str().unwrap().to_string();

        // Refresh rotates both strings.
        let response = send(
            &app,
            "POST",
            "/auth/refresh",
            None,
            Some(json!({"refresh": refresh0})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let renewed = body_json(response).await;
        let access1 = renewed["token"]["access"].as_str().unwrap().to_string();
        let refresh1 = renewed["token"]["refresh"].as_str().unwrap().to_string();
        assert_ne!(access1, access0);
        assert_ne!(refresh1, refresh0);

        // The old access key maps to nothing now.
        let response = send(&app, "POST", "/auth/logout", Some(&access0), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Logout with the fresh key succeeds and reports the kill.
        let response = send(&app, "POST", "/auth/logout", Some(&access1), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let killed = body_json(response).await;
        assert_eq!(killed["token"]["killed"], true);

        // Subsequent use of the killed key is rejected.
        let response = send(&app, "POST", "/auth/logout", Some(&access1), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn refresh_requires_the_key() {
        let app = build_router(test_app_state());
        let response = send(&app, "POST", "/auth/refresh", None, Some(json!({}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["message"], "Missing refresh token");

        let response = send(
            &app,
            "POST",
            "/auth/refresh",
            None,
            Some(json!({"refresh": "bogus"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_requires_access_token() {
        let app = build_router(test_app_state());
        let response = send(&app, "POST", "/auth/logout", None, None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["message"], "Missing access token");
    }

    #[tokio::test]
    async fn double_acquire_conflicts_until_release() {
        let app = build_router(test_app_state());
        let s1 = login(&app, "alice", "alice-pw").await;
        let s2 = login(&app, "alice", "alice-pw").await;
        let a1 = s1["access"].as_str().unwrap();
        let a2 = s2["access"].as_str().unwrap();

        let response = send(&app, "POST", "/resource/quote/7/acquire", Some(a1), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, "POST", "/resource/quote/7/acquire", Some(a2), None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let conflict = body_json(response).await;
        assert_eq!(
            conflict["message"],
            "Requested resource is already locked by another session"
        );
        assert_eq!(conflict["locked_by"], "Alice Walker");

        let response = send(&app, "POST", "/resource/quote/7/release", Some(a1), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, "POST", "/resource/quote/7/acquire", Some(a2), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bound_session_cannot_take_a_second_resource() {
        let app = build_router(test_app_state());
        let token = login(&app, "alice", "alice-pw").await;
        let access = token["access"].as_str().unwrap();

        let response = send(&app, "POST", "/resource/quote/7/acquire", Some(access), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, "POST", "/resource/quote/8/acquire", Some(access), None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let conflict = body_json(response).await;
        assert_eq!(
            conflict["message"],
            "Requesting session is already bound to a resource"
        );
        assert!(conflict["session"]["id"].is_string());
        assert!(conflict["session"]["state"].is_object());
    }

    #[tokio::test]
    async fn view_requires_acquisition() {
        let app = build_router(test_app_state());
        let token = login(&app, "bob", "bob-pw").await;
        let access = token["access"].as_str().unwrap();

        let response = send(&app, "GET", "/resource/quote/7/view", Some(access), None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let conflict = body_json(response).await;
        assert_eq!(
            conflict["message"],
            "Requesting session is not bound to the requested resource"
        );

        let response = send(&app, "POST", "/resource/quote/7/acquire", Some(access), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, "GET", "/resource/quote/7/view", Some(access), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["resource"]["formatted_id"], "SQ00000007");
        assert!(json["resource"]["items"].is_array());
    }

    #[tokio::test]
    async fn preview_does_not_require_acquisition() {
        let app = build_router(test_app_state());
        let token = login(&app, "bob", "bob-pw").await;
        let access = token["access"].as_str().unwrap();

        let response = send(&app, "GET", "/resource/quote/7/preview", Some(access), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["resource"]["owner"]["name"], "Alice Walker");
        assert!(json["resource"].get("items").is_none());
    }

    #[tokio::test]
    async fn cross_company_access_is_forbidden() {
        let app = build_router(test_app_state());
        let token = login(&app, "mallory", "mallory-pw").await;
        let access = token["access"].as_str().unwrap();

        let response = send(&app, "POST", "/resource/quote/7/acquire", Some(access), None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["permission"], "acquire");
        assert_eq!(json["resource_type"], "quote");
        assert_eq!(json["resource_id"], 7);
    }

    #[tokio::test]
    async fn resource_path_validation() {
        let app = build_router(test_app_state());
        let token = login(&app, "alice", "alice-pw").await;
        let access = token["access"].as_str().unwrap();

        let response = send(
            &app,
            "POST",
            "/resource/quote/seven/acquire",
            Some(access),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &app,
            "POST",
            "/resource/blueprint/7/acquire",
            Some(access),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["message"], "Unknown resource type");

        let response = send(&app, "POST", "/resource/quote/999/acquire", Some(access), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn resource_endpoints_require_auth() {
        let app = build_router(test_app_state());
        let response = send(&app, "POST", "/resource/quote/7/acquire", None, None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &app,
            "POST",
            "/resource/quote/7/acquire",
            Some("bogus-key"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_route_is_ip_ratelimited() {
        let app = build_router(test_app_state());

        // Without connect info every request shares the "anon" IP bucket;
        // the 11th within the window must be rejected. Failed logins count
        // like any other hit.
        for _ in 0..10 {
            let response = send(
                &app,
                "POST",
                "/auth/login",
                None,
                Some(json!({"username": "alice", "password": "wrong"})),
            )
            .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = send(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({"username": "alice", "password": "wrong"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok()),
            Some("60")
        );
        let json = body_json(response).await;
        assert_eq!(json["message"], "Too many requests");
    }

    #[tokio::test]
    async fn session_reuse_across_logins() {
        let state = test_app_state();
        let app = build_router(Arc::clone(&state));

        let first = login(&app, "alice", "alice-pw").await;
        let access = first["access"].as_str().unwrap();
        let ctx = state.registry.lookup(access).await.unwrap();

        // Supplying the session id re-attaches to the same session.
        let response = send(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({
                "username": "alice",
                "password": "alice-pw",
                "session_id": ctx.session_id,
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let second = body_json(response).await;
        let access2 = second["token"]["access"].as_str().unwrap();
        let ctx2 = state.registry.lookup(access2).await.unwrap();
        assert_eq!(ctx2.session_id, ctx.session_id);
    }

    // The WebSocket upgrade itself needs a live hyper connection, which
    // oneshot cannot provide; the guard chain and the connection slot are
    // exercised against the state directly instead.

    fn bearer_headers(access: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {access}").parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn ws_guards_require_a_token() {
        let state = test_app_state();
        let headers = HeaderMap::new();
        let err = state
            .authorize(&state.guards.ws_user, &headers, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn ws_guards_enforce_roles() {
        let state = test_app_state();
        // Log a worker identity in through the registry directly; the
        // directory only knows the operators.
        let worker = Arc::new(User {
            id: 50,
            username: "ap-50".into(),
            display_name: None,
            email: None,
            autopilot: true,
            admin: false,
            teams: Vec::new(),
        });
        let payload = state.registry.login(worker, None).await.unwrap();
        let worker_access = payload["access"].as_str().unwrap();

        let err = state
            .authorize(&state.guards.ws_user, &bearer_headers(worker_access), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden { .. }));

        state
            .authorize(
                &state.guards.ws_autopilot,
                &bearer_headers(worker_access),
                None,
            )
            .await
            .unwrap();

        let app = build_router(Arc::clone(&state));
        let operator = login(&app, "alice", "alice-pw").await;
        let operator_access = operator["access"].as_str().unwrap();
        let err = state
            .authorize(
                &state.guards.ws_autopilot,
                &bearer_headers(operator_access),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn ws_connection_slot_is_exclusive_per_token() {
        let state = test_app_state();
        let app = build_router(Arc::clone(&state));
        let token = login(&app, "alice", "alice-pw").await;
        let access = token["access"].as_str().unwrap();
        let ctx = state
            .authorize(&state.guards.ws_user, &bearer_headers(access), None)
            .await
            .unwrap();

        let (first, _rx) = ConnHandle::channel();
        state
            .registry
            .attach_connection(&ctx.token_id, &ctx.session_id, first)
            .await
            .unwrap();

        let (second, _rx2) = ConnHandle::channel();
        let err = state
            .registry
            .attach_connection(&ctx.token_id, &ctx.session_id, second)
            .await
            .unwrap_err();
        let ApiError::Conflict { message, .. } = err else {
            panic!("expected conflict");
        };
        assert_eq!(message, "Connection already established for this token");
    }
}
