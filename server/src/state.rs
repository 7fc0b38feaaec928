use std::{sync::Arc, time::Duration};

use color_eyre::eyre::WrapErr;
use reqwest::redirect;
use tower_cookies::Key;

use crate::{
    config::AppConfig,
    csrf::CsrfGuard,
    email::{email_sender, EmailSender},
    oidc::{
        session::DEFAULT_SESSION_TTL, AuthCallbackController, ClientCredentials, ContextStore,
        IdentityVerifier, ProviderConfig, SessionIssuer, TokenExchanger,
    },
    rate_limit::{FixedWindowLimiter, RateLimiter},
    store::{KvStore, MemoryStore, PgStore},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub cookie_key: Key,
    pub csrf: CsrfGuard,
    pub provider: Arc<ProviderConfig>,
    pub contexts: Arc<ContextStore>,
    pub sessions: Arc<SessionIssuer>,
    pub callback: Arc<AuthCallbackController>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub email: Arc<dyn EmailSender>,
}

/// HTTP client for provider calls. Bounded by the configured timeout and
/// never follows redirects.
pub fn provider_client(timeout: Duration) -> color_eyre::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .timeout(timeout)
        .use_rustls_tls()
        .redirect(redirect::Policy::none())
        .build()
        .wrap_err("Failed to build HTTP client")
}

impl AppState {
    pub async fn from_config(config: AppConfig) -> color_eyre::Result<Self> {
        let store: Arc<dyn KvStore> = match &config.database_url {
            Some(url) => Arc::new(PgStore::connect(url).await?),
            None => {
                tracing::warn!("DATABASE_URL not set, sessions are kept in memory");
                Arc::new(MemoryStore::new())
            }
        };

        let client = provider_client(config.vipps.timeout)?;
        let email = email_sender(client.clone(), config.email.clone());
        let rate_limiter = Arc::new(FixedWindowLimiter::new(config.rate_limit));

        Ok(Self::with_collaborators(
            config,
            client,
            store,
            rate_limiter,
            email,
        ))
    }

    /// Wire the auth flow around the given collaborators
    pub fn with_collaborators(
        config: AppConfig,
        client: reqwest::Client,
        store: Arc<dyn KvStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        email: Arc<dyn EmailSender>,
    ) -> Self {
        let provider = Arc::new(ProviderConfig::new(
            client.clone(),
            config.vipps.discovery_url.clone(),
            config.vipps.cache_ttl,
        ));
        let credentials = ClientCredentials::from_config(&config.vipps);
        let sessions = Arc::new(SessionIssuer::new(store.clone(), DEFAULT_SESSION_TTL));

        let callback = AuthCallbackController::new(
            provider.clone(),
            TokenExchanger::new(client.clone(), credentials.clone()),
            IdentityVerifier::new(
                provider.clone(),
                client,
                credentials,
                config.vipps.policy,
            ),
            sessions.clone(),
            config.vipps.client_id.clone(),
            config.vipps.expected_issuer.clone(),
            config.default_return_path.clone(),
        );

        Self {
            cookie_key: config.cookie_key.clone(),
            csrf: CsrfGuard::new(&config.csrf_secret, config.secure_cookies()),
            provider,
            contexts: Arc::new(ContextStore::new(store)),
            sessions,
            callback: Arc::new(callback),
            rate_limiter,
            email,
            config: Arc::new(config),
        }
    }
}
