//! The login callback as an explicit state machine.
//!
//! `Start -> StateValidated -> TokensExchanged -> IdentityVerified ->
//! NonceValidated -> SessionIssued -> Redirected`, with every step able to end
//! in `Failed(AuthFailure)`. The route turns a failure into a redirect carrying
//! only [`AuthFailure::code`].

use std::{fmt, sync::Arc};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    context::AuthorizationContext,
    provider::{ProviderConfig, ProviderError},
    session::{resolve_return_path, Session, SessionIssuer},
    token::{TokenExchangeError, TokenExchanger},
    verify::{IdentityVerifier, VerificationFailure, VerificationRequest},
};
use crate::utils::constant_time_eq;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    StateValidated,
    TokensExchanged,
    IdentityVerified,
    NonceValidated,
    SessionIssued,
    Redirected,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Start => "start",
            Stage::StateValidated => "state_validated",
            Stage::TokensExchanged => "tokens_exchanged",
            Stage::IdentityVerified => "identity_verified",
            Stage::NonceValidated => "nonce_validated",
            Stage::SessionIssued => "session_issued",
            Stage::Redirected => "redirected",
        };
        f.write_str(name)
    }
}

fn enter(stage: Stage) {
    debug!(stage = %stage, "Login callback stage reached");
}

#[derive(Debug, thiserror::Error)]
pub enum AuthFailure {
    #[error("provider reported error {0}")]
    ProviderDenied(String),
    #[error("callback is missing code or state")]
    MissingCallbackParams,
    #[error("state does not match a pending login attempt")]
    StateMismatch,
    #[error("identity provider unreachable: {0}")]
    ProviderUnreachable(#[from] ProviderError),
    #[error(transparent)]
    TokenExchangeFailed(#[from] TokenExchangeError),
    #[error("identity verification failed: {0}")]
    VerificationFailed(VerificationFailure),
    #[error("provider key set unreachable during verification: {0}")]
    KeySetUnreachable(String),
    #[error("nonce in verified identity does not match the login attempt")]
    NonceMismatch,
    #[error("session storage failed: {0:#}")]
    SessionStorageFailed(color_eyre::Report),
}

impl AuthFailure {
    /// Short opaque code safe to hand to the browser
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::ProviderDenied(_) => "provider_error",
            AuthFailure::MissingCallbackParams => "missing_params",
            AuthFailure::StateMismatch => "state_mismatch",
            AuthFailure::ProviderUnreachable(_) | AuthFailure::KeySetUnreachable(_) => {
                "provider_unreachable"
            }
            AuthFailure::TokenExchangeFailed(_) => "token_exchange_failed",
            AuthFailure::VerificationFailed(_) => "verification_failed",
            AuthFailure::NonceMismatch => "nonce_mismatch",
            AuthFailure::SessionStorageFailed(_) => "session_failed",
        }
    }
}

impl From<VerificationFailure> for AuthFailure {
    fn from(failure: VerificationFailure) -> Self {
        match failure {
            VerificationFailure::KeySetUnavailable(reason) => AuthFailure::KeySetUnreachable(reason),
            other => AuthFailure::VerificationFailed(other),
        }
    }
}

#[derive(Debug)]
pub struct CallbackSuccess {
    pub session: Session,
    pub return_path: String,
}

pub struct AuthCallbackController {
    provider: Arc<ProviderConfig>,
    exchanger: TokenExchanger,
    verifier: IdentityVerifier,
    sessions: Arc<SessionIssuer>,
    client_id: String,
    /// Overrides the discovered issuer when set
    expected_issuer: Option<String>,
    default_return_path: String,
}

impl AuthCallbackController {
    pub fn new(
        provider: Arc<ProviderConfig>,
        exchanger: TokenExchanger,
        verifier: IdentityVerifier,
        sessions: Arc<SessionIssuer>,
        client_id: String,
        expected_issuer: Option<String>,
        default_return_path: String,
    ) -> Self {
        Self {
            provider,
            exchanger,
            verifier,
            sessions,
            client_id,
            expected_issuer,
            default_return_path,
        }
    }

    /// Run one callback to completion.
    ///
    /// `context` must already have been taken from storage, so it is gone
    /// whatever the outcome.
    #[tracing::instrument(skip_all, err(Display))]
    pub async fn handle(
        &self,
        params: &CallbackParams,
        context: Option<AuthorizationContext>,
    ) -> Result<CallbackSuccess, AuthFailure> {
        enter(Stage::Start);

        if let Some(error) = &params.error {
            warn!(
                error = %error,
                description = params.error_description.as_deref().unwrap_or_default(),
                "Provider returned an error to the callback"
            );
            return Err(AuthFailure::ProviderDenied(error.clone()));
        }

        let (Some(code), Some(state)) = (params.code.as_deref(), params.state.as_deref()) else {
            return Err(AuthFailure::MissingCallbackParams);
        };
        if code.is_empty() || state.is_empty() {
            return Err(AuthFailure::MissingCallbackParams);
        }

        let Some(context) = context else {
            return Err(AuthFailure::StateMismatch);
        };
        if !constant_time_eq(state, &context.state) {
            return Err(AuthFailure::StateMismatch);
        }
        enter(Stage::StateValidated);

        let metadata = self.provider.discover().await?;

        let tokens = self
            .exchanger
            .exchange(&metadata.token_endpoint, code, &context.redirect_uri)
            .await?;
        enter(Stage::TokensExchanged);

        let expected_issuer = self
            .expected_issuer
            .as_deref()
            .unwrap_or(&metadata.issuer);
        let identity = self
            .verifier
            .verify(
                &metadata,
                &VerificationRequest {
                    id_token: &tokens.id_token,
                    access_token: tokens.access_token.as_deref(),
                    audience: &self.client_id,
                    expected_issuer,
                },
            )
            .await?;
        enter(Stage::IdentityVerified);

        let nonce_matches = identity
            .nonce
            .as_deref()
            .is_some_and(|nonce| constant_time_eq(nonce, &context.nonce));
        if !nonce_matches {
            return Err(AuthFailure::NonceMismatch);
        }
        enter(Stage::NonceValidated);

        let session = self
            .sessions
            .issue(&identity)
            .await
            .map_err(AuthFailure::SessionStorageFailed)?;
        enter(Stage::SessionIssued);

        let return_path =
            resolve_return_path(Some(&context.return_path), &self.default_return_path);
        enter(Stage::Redirected);

        Ok(CallbackSuccess {
            session,
            return_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fixtures::provider::{FakeProvider, TokenBehavior, CLIENT_ID, CLIENT_SECRET};

    use super::*;
    use crate::{
        oidc::{token::ClientCredentials, verify::VerificationPolicy},
        store::{KvStore, MemoryStore},
    };

    const REDIRECT_URI: &str = "http://localhost:3000/api/auth/vipps/callback";

    struct FailingStore;

    #[async_trait::async_trait]
    impl KvStore for FailingStore {
        async fn set(&self, _: &str, _: String, _: Duration) -> color_eyre::Result<()> {
            Err(color_eyre::eyre::eyre!("store offline"))
        }
        async fn get(&self, _: &str) -> color_eyre::Result<Option<String>> {
            Err(color_eyre::eyre::eyre!("store offline"))
        }
        async fn take(&self, _: &str) -> color_eyre::Result<Option<String>> {
            Err(color_eyre::eyre::eyre!("store offline"))
        }
        async fn delete(&self, _: &str) -> color_eyre::Result<()> {
            Err(color_eyre::eyre::eyre!("store offline"))
        }
    }

    fn controller(provider: &FakeProvider, store: Arc<dyn KvStore>) -> AuthCallbackController {
        let client = reqwest::Client::new();
        let config = Arc::new(ProviderConfig::new(
            client.clone(),
            provider.discovery_url(),
            Duration::from_secs(60),
        ));
        let credentials = ClientCredentials::new(CLIENT_ID, CLIENT_SECRET);

        AuthCallbackController::new(
            config.clone(),
            TokenExchanger::new(client.clone(), credentials.clone()),
            IdentityVerifier::new(config, client, credentials, VerificationPolicy::default()),
            Arc::new(SessionIssuer::new(store, Duration::from_secs(3600))),
            CLIENT_ID.to_string(),
            None,
            "/jobbsoker/skjema".to_string(),
        )
    }

    fn context(nonce: &str) -> AuthorizationContext {
        AuthorizationContext {
            state: "S1".to_string(),
            nonce: nonce.to_string(),
            return_path: "/apply/form".to_string(),
            redirect_uri: REDIRECT_URI.to_string(),
        }
    }

    fn params(code: &str, state: &str) -> CallbackParams {
        CallbackParams {
            code: Some(code.to_string()),
            state: Some(state.to_string()),
            ..CallbackParams::default()
        }
    }

    #[tokio::test]
    async fn test_successful_callback_issues_session() {
        let provider = FakeProvider::spawn().await.unwrap();
        provider.register_code("ABC123", "N1");
        let controller = controller(&provider, Arc::new(MemoryStore::new()));

        let success = controller
            .handle(&params("ABC123", "S1"), Some(context("N1")))
            .await
            .unwrap();

        assert_eq!(success.return_path, "/apply/form");
        assert_eq!(success.session.claims.subject, fixtures::provider::SUBJECT);
        assert_eq!(provider.last_redirect_uri().as_deref(), Some(REDIRECT_URI));
    }

    #[tokio::test]
    async fn test_tampered_nonce_never_issues_a_session() {
        let provider = FakeProvider::spawn().await.unwrap();
        provider.register_code("ABC123", "N1");
        provider.set_token_behavior(TokenBehavior {
            nonce: Some("tampered".to_string()),
            ..TokenBehavior::default()
        });
        let controller = controller(&provider, Arc::new(MemoryStore::new()));

        let err = controller
            .handle(&params("ABC123", "S1"), Some(context("N1")))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthFailure::NonceMismatch));
        assert_eq!(err.code(), "nonce_mismatch");
    }

    #[tokio::test]
    async fn test_state_mismatch_skips_token_exchange() {
        let provider = FakeProvider::spawn().await.unwrap();
        provider.register_code("ABC123", "N1");
        let controller = controller(&provider, Arc::new(MemoryStore::new()));

        let err = controller
            .handle(&params("ABC123", "S2"), Some(context("N1")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthFailure::StateMismatch));

        let err = controller
            .handle(&params("ABC123", "S1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthFailure::StateMismatch));

        assert_eq!(provider.token_calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_error_short_circuits() {
        let provider = FakeProvider::spawn().await.unwrap();
        let controller = controller(&provider, Arc::new(MemoryStore::new()));

        let err = controller
            .handle(
                &CallbackParams {
                    error: Some("access_denied".to_string()),
                    error_description: Some("User cancelled".to_string()),
                    ..params("ABC123", "S1")
                },
                Some(context("N1")),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "provider_error");
        assert_eq!(provider.token_calls(), 0);
    }

    #[tokio::test]
    async fn test_key_set_outage_reports_provider_unreachable() {
        let provider = FakeProvider::spawn().await.unwrap();
        provider.register_code("ABC123", "N1");
        provider.fail_jwks_after(1);
        provider.set_token_behavior(TokenBehavior {
            kid: Some("unknown-kid".to_string()),
            ..TokenBehavior::default()
        });
        let controller = controller(&provider, Arc::new(MemoryStore::new()));

        let err = controller
            .handle(&params("ABC123", "S1"), Some(context("N1")))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthFailure::KeySetUnreachable(_)), "got {:?}", err);
        assert_eq!(err.code(), "provider_unreachable");
    }

    #[tokio::test]
    async fn test_missing_params() {
        let provider = FakeProvider::spawn().await.unwrap();
        let controller = controller(&provider, Arc::new(MemoryStore::new()));

        let err = controller
            .handle(
                &CallbackParams {
                    state: Some("S1".to_string()),
                    ..CallbackParams::default()
                },
                Some(context("N1")),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "missing_params");
    }

    #[tokio::test]
    async fn test_rejected_exchange_is_fatal() {
        let provider = FakeProvider::spawn().await.unwrap();
        let controller = controller(&provider, Arc::new(MemoryStore::new()));

        // code was never issued by the provider
        let err = controller
            .handle(&params("UNKNOWN", "S1"), Some(context("N1")))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "token_exchange_failed");
        assert_eq!(provider.token_calls(), 1);
    }

    #[tokio::test]
    async fn test_session_storage_failure_is_fatal() {
        let provider = FakeProvider::spawn().await.unwrap();
        provider.register_code("ABC123", "N1");
        let controller = controller(&provider, Arc::new(FailingStore));

        let err = controller
            .handle(&params("ABC123", "S1"), Some(context("N1")))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthFailure::SessionStorageFailed(_)));
        assert_eq!(err.code(), "session_failed");
    }

    #[tokio::test]
    async fn test_unreachable_provider() {
        let client = reqwest::Client::new();
        let config = Arc::new(ProviderConfig::new(
            client.clone(),
            "http://127.0.0.1:9/.well-known/openid-configuration",
            Duration::from_secs(60),
        ));
        let credentials = ClientCredentials::new(CLIENT_ID, CLIENT_SECRET);
        let controller = AuthCallbackController::new(
            config.clone(),
            TokenExchanger::new(client.clone(), credentials.clone()),
            IdentityVerifier::new(config, client, credentials, VerificationPolicy::default()),
            Arc::new(SessionIssuer::new(
                Arc::new(MemoryStore::new()),
                Duration::from_secs(3600),
            )),
            CLIENT_ID.to_string(),
            None,
            "/jobbsoker/skjema".to_string(),
        );

        let err = controller
            .handle(&params("ABC123", "S1"), Some(context("N1")))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "provider_unreachable");
    }
}
