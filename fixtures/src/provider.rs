//! In-process stand-in for the Vipps Login OpenID provider.
//!
//! Serves discovery, JWKS, authorize, token and userinfo endpoints and lets
//! tests script how each of them misbehaves.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

pub const CLIENT_ID: &str = "fixture-client";
pub const CLIENT_SECRET: &str = "fixture-secret";
pub const SUBJECT: &str = "c06c4afe-d9e1-4c5d-939a-177d752a0944";
pub const DEFAULT_KID: &str = "fixture-key-1";

const PROVIDER_KEY: &str = include_str!("../keys/provider_rsa.pem");
const ROGUE_KEY: &str = include_str!("../keys/rogue_rsa.pem");
const PROVIDER_JWKS: &str = include_str!("../keys/provider_jwks.json");

/// How the next ID tokens are minted and how `/token` answers
#[derive(Debug, Clone)]
pub struct TokenBehavior {
    /// Overrides the `iss` claim, defaults to the provider issuer
    pub issuer: Option<String>,
    /// Overrides the `aud` claim, defaults to [`CLIENT_ID`]
    pub audience: Option<String>,
    pub subject: Option<String>,
    /// Overrides the nonce the code was registered with
    pub nonce: Option<String>,
    pub sign_with_rogue_key: bool,
    pub expired: bool,
    /// Overrides the `kid` header, defaults to the current signing kid
    pub kid: Option<String>,
    /// Status of the token endpoint. Anything but 200 answers `invalid_grant`.
    pub status: u16,
}

impl Default for TokenBehavior {
    fn default() -> Self {
        Self {
            issuer: None,
            audience: None,
            subject: None,
            nonce: None,
            sign_with_rogue_key: false,
            expired: false,
            kid: None,
            status: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserinfoBehavior {
    pub enabled: bool,
    pub subject: Option<String>,
}

impl Default for UserinfoBehavior {
    fn default() -> Self {
        Self {
            enabled: true,
            subject: None,
        }
    }
}

#[derive(Serialize)]
struct IdTokenClaims<'a> {
    iss: &'a str,
    aud: &'a str,
    sub: &'a str,
    nonce: &'a str,
    iat: u64,
    exp: u64,
    name: &'static str,
    phone_number: &'static str,
    birthdate: &'static str,
    email: &'static str,
}

struct Inner {
    base_url: String,
    signing_kid: Mutex<String>,
    codes: Mutex<HashMap<String, String>>,
    token_behavior: Mutex<TokenBehavior>,
    userinfo_behavior: Mutex<UserinfoBehavior>,
    last_redirect_uri: Mutex<Option<String>>,
    discovery_calls: AtomicUsize,
    jwks_calls: AtomicUsize,
    /// JWKS requests served before the endpoint starts failing
    jwks_limit: Mutex<Option<usize>>,
    token_calls: AtomicUsize,
    userinfo_calls: AtomicUsize,
}

/// Shared state behind the provider routes
#[derive(Clone)]
pub struct ProviderState {
    inner: Arc<Inner>,
}

impl ProviderState {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                signing_kid: Mutex::new(DEFAULT_KID.to_string()),
                codes: Mutex::new(HashMap::new()),
                token_behavior: Mutex::new(TokenBehavior::default()),
                userinfo_behavior: Mutex::new(UserinfoBehavior::default()),
                last_redirect_uri: Mutex::new(None),
                discovery_calls: AtomicUsize::new(0),
                jwks_calls: AtomicUsize::new(0),
                jwks_limit: Mutex::new(None),
                token_calls: AtomicUsize::new(0),
                userinfo_calls: AtomicUsize::new(0),
            }),
        }
    }

    fn issuer(&self) -> &str {
        &self.inner.base_url
    }

    fn signing_kid(&self) -> String {
        self.inner.signing_kid.lock().unwrap().clone()
    }

    fn register_code(&self, code: &str, nonce: &str) {
        self.inner
            .codes
            .lock()
            .unwrap()
            .insert(code.to_string(), nonce.to_string());
    }

    fn sign_id_token(&self, behavior: &TokenBehavior, nonce: &str) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let (iat, exp) = if behavior.expired {
            (now - 7200, now - 3600)
        } else {
            (now, now + 300)
        };

        let claims = IdTokenClaims {
            iss: behavior.issuer.as_deref().unwrap_or(self.issuer()),
            aud: behavior.audience.as_deref().unwrap_or(CLIENT_ID),
            sub: behavior.subject.as_deref().unwrap_or(SUBJECT),
            nonce: behavior.nonce.as_deref().unwrap_or(nonce),
            iat,
            exp,
            name: "Kari Nordmann",
            phone_number: "4712345678",
            birthdate: "1990-01-01",
            email: "kari.nordmann@example.no",
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(behavior.kid.clone().unwrap_or_else(|| self.signing_kid()));

        let pem = if behavior.sign_with_rogue_key {
            ROGUE_KEY
        } else {
            PROVIDER_KEY
        };
        let key = EncodingKey::from_rsa_pem(pem.as_bytes()).expect("fixture key is valid PEM");

        jsonwebtoken::encode(&header, &claims, &key).expect("fixture token encodes")
    }
}

/// Routes of the fake provider
pub fn router(state: ProviderState) -> Router {
    Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/jwks", get(jwks))
        .route("/authorize", get(authorize))
        .route("/token", post(token))
        .route("/userinfo", get(userinfo))
        .with_state(state)
}

/// A fake provider listening on an ephemeral local port
pub struct FakeProvider {
    pub base_url: String,
    state: ProviderState,
    server: JoinHandle<()>,
}

impl FakeProvider {
    pub async fn spawn() -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let state = ProviderState::new(base_url.clone());

        let app = router(state.clone());
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Fake provider stopped: {}", e);
            }
        });

        Ok(Self {
            base_url,
            state,
            server,
        })
    }

    pub fn discovery_url(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.base_url)
    }

    pub fn issuer(&self) -> String {
        self.state.issuer().to_string()
    }

    /// Make `code` redeemable once, minting a token bound to `nonce`
    pub fn register_code(&self, code: &str, nonce: &str) {
        self.state.register_code(code, nonce);
    }

    pub fn set_token_behavior(&self, behavior: TokenBehavior) {
        *self.state.inner.token_behavior.lock().unwrap() = behavior;
    }

    pub fn set_userinfo_behavior(&self, behavior: UserinfoBehavior) {
        *self.state.inner.userinfo_behavior.lock().unwrap() = behavior;
    }

    pub fn sign_id_token(&self, behavior: &TokenBehavior, nonce: &str) -> String {
        self.state.sign_id_token(behavior, nonce)
    }

    /// Publish the signing key under a new kid and sign with it from now on
    /// Serve the key set `served` more times, then answer 503
    pub fn fail_jwks_after(&self, served: usize) {
        let already = self.jwks_calls();
        *self.state.inner.jwks_limit.lock().unwrap() = Some(already + served);
    }

    pub fn rotate_signing_kid(&self, kid: &str) {
        *self.state.inner.signing_kid.lock().unwrap() = kid.to_string();
    }

    pub fn last_redirect_uri(&self) -> Option<String> {
        self.state.inner.last_redirect_uri.lock().unwrap().clone()
    }

    pub fn discovery_calls(&self) -> usize {
        self.state.inner.discovery_calls.load(Ordering::SeqCst)
    }

    pub fn jwks_calls(&self) -> usize {
        self.state.inner.jwks_calls.load(Ordering::SeqCst)
    }

    pub fn token_calls(&self) -> usize {
        self.state.inner.token_calls.load(Ordering::SeqCst)
    }

    pub fn userinfo_calls(&self) -> usize {
        self.state.inner.userinfo_calls.load(Ordering::SeqCst)
    }
}

impl Drop for FakeProvider {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn discovery(State(state): State<ProviderState>) -> Json<Value> {
    state.inner.discovery_calls.fetch_add(1, Ordering::SeqCst);
    let base = state.issuer();

    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{}/authorize", base),
        "token_endpoint": format!("{}/token", base),
        "userinfo_endpoint": format!("{}/userinfo", base),
        "jwks_uri": format!("{}/jwks", base),
        "response_types_supported": ["code"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "token_endpoint_auth_methods_supported": ["client_secret_basic"],
    }))
}

async fn jwks(State(state): State<ProviderState>) -> Response {
    let call = state.inner.jwks_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if state
        .inner
        .jwks_limit
        .lock()
        .unwrap()
        .is_some_and(|limit| call > limit)
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "temporarily_unavailable" })),
        )
            .into_response();
    }

    let mut jwks: Value = match serde_json::from_str(PROVIDER_JWKS) {
        Ok(jwks) => jwks,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    if let Some(key) = jwks["keys"].get_mut(0) {
        key["kid"] = Value::String(state.signing_kid());
    }

    Json(jwks).into_response()
}

#[derive(Deserialize)]
struct AuthorizeParams {
    client_id: String,
    redirect_uri: String,
    state: Option<String>,
    nonce: Option<String>,
}

#[derive(Serialize)]
struct AuthorizeRedirectParams<'a> {
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a str>,
}

/// Approves every login immediately
async fn authorize(
    State(state): State<ProviderState>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    if params.client_id != CLIENT_ID {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unauthorized_client" })),
        )
            .into_response();
    }

    let code = Uuid::new_v4().to_string();
    state.register_code(&code, params.nonce.as_deref().unwrap_or_default());

    let query = match serde_urlencoded::to_string(AuthorizeRedirectParams {
        code: &code,
        state: params.state.as_deref(),
    }) {
        Ok(query) => query,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let separator = if params.redirect_uri.contains('?') {
        '&'
    } else {
        '?'
    };
    info!(redirect_uri = %params.redirect_uri, "Approving fixture login");
    Redirect::to(&format!("{}{}{}", params.redirect_uri, separator, query)).into_response()
}

#[derive(Deserialize)]
struct TokenRequest {
    grant_type: String,
    code: String,
    redirect_uri: Option<String>,
}

fn client_authenticated(headers: &HeaderMap) -> bool {
    let Some(encoded) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };

    STANDARD
        .decode(encoded)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .is_some_and(|pair| pair == format!("{}:{}", CLIENT_ID, CLIENT_SECRET))
}

fn invalid_grant(status: StatusCode) -> Response {
    (
        status,
        Json(json!({
            "error": "invalid_grant",
            "error_description": "The authorization code is invalid or has expired"
        })),
    )
        .into_response()
}

async fn token(
    State(state): State<ProviderState>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Response {
    state.inner.token_calls.fetch_add(1, Ordering::SeqCst);
    *state.inner.last_redirect_uri.lock().unwrap() = request.redirect_uri.clone();

    if !client_authenticated(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid_client" })),
        )
            .into_response();
    }

    if request.grant_type != "authorization_code" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unsupported_grant_type" })),
        )
            .into_response();
    }

    let behavior = state.inner.token_behavior.lock().unwrap().clone();
    if behavior.status != 200 {
        return invalid_grant(
            StatusCode::from_u16(behavior.status).unwrap_or(StatusCode::BAD_REQUEST),
        );
    }

    // Codes are single use
    let Some(nonce) = state.inner.codes.lock().unwrap().remove(&request.code) else {
        return invalid_grant(StatusCode::BAD_REQUEST);
    };

    let id_token = state.sign_id_token(&behavior, &nonce);

    Json(json!({
        "access_token": format!("fixture-access-token-{}", Uuid::new_v4()),
        "id_token": id_token,
        "token_type": "Bearer",
        "expires_in": 300,
        "scope": "openid name phoneNumber birthDate email",
    }))
    .into_response()
}

async fn userinfo(State(state): State<ProviderState>, headers: HeaderMap) -> Response {
    state.inner.userinfo_calls.fetch_add(1, Ordering::SeqCst);

    let has_bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));
    if !has_bearer {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid_token" })),
        )
            .into_response();
    }

    let behavior = state.inner.userinfo_behavior.lock().unwrap().clone();
    if !behavior.enabled {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "temporarily_unavailable" })),
        )
            .into_response();
    }

    Json(json!({
        "sub": behavior.subject.as_deref().unwrap_or(SUBJECT),
        "name": "Kari Nordmann",
        "phone_number": "4712345678",
        "birthdate": "1990-01-01",
        "email": "kari.nordmann@example.no",
    }))
    .into_response()
}
