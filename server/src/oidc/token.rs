use std::fmt;

use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::config::{VippsConfig, CALLBACK_PATH};

const SYSTEM_NAME: &str = env!("CARGO_PKG_NAME");
const SYSTEM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Longest provider error body we keep for diagnostics
const MAX_ERROR_BODY: usize = 2048;

/// Client credentials plus the headers Vipps expects on every API call
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    client_secret: String,
    subscription_key: Option<String>,
    merchant_serial_number: Option<String>,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            subscription_key: None,
            merchant_serial_number: None,
        }
    }

    pub fn from_config(config: &VippsConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            subscription_key: config.subscription_key.clone(),
            merchant_serial_number: config.merchant_serial_number.clone(),
        }
    }

    pub(crate) fn apply_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut request = request
            .header("Vipps-System-Name", SYSTEM_NAME)
            .header("Vipps-System-Version", SYSTEM_VERSION);

        if let Some(key) = &self.subscription_key {
            request = request.header("Ocp-Apim-Subscription-Key", key);
        }
        if let Some(msn) = &self.merchant_serial_number {
            request = request.header("Merchant-Serial-Number", msn);
        }

        request
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Tokens from one code exchange, never stored
#[derive(Clone, Deserialize)]
pub struct TokenSet {
    pub id_token: String,
    pub access_token: Option<String>,
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("id_token", &"<redacted>")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenExchangeError {
    /// The provider answered with a non-2xx status. The body is kept for logs only.
    #[error("token endpoint rejected the code with status {status}")]
    Rejected { status: u16, body: String },
    #[error("token endpoint request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("token endpoint returned an unusable response: {0}")]
    InvalidResponse(String),
}

#[derive(Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
    access_token: Option<String>,
}

#[derive(Clone)]
pub struct TokenExchanger {
    client: reqwest::Client,
    credentials: ClientCredentials,
}

impl TokenExchanger {
    pub fn new(client: reqwest::Client, credentials: ClientCredentials) -> Self {
        Self {
            client,
            credentials,
        }
    }

    /// Trade an authorization code for tokens.
    ///
    /// `redirect_uri` must be byte-for-byte the value sent to the authorize
    /// endpoint, or the provider refuses the exchange.
    #[tracing::instrument(skip(self, code), err(Display))]
    pub async fn exchange(
        &self,
        token_endpoint: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, TokenExchangeError> {
        let request = self
            .client
            .post(token_endpoint)
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ]);

        let response = self
            .credentials
            .apply_headers(request)
            .send()
            .await
            .map_err(TokenExchangeError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            warn!(status = status.as_u16(), body = %body, "Token endpoint rejected code exchange");

            return Err(TokenExchangeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenExchangeError::InvalidResponse(e.to_string()))?;

        let id_token = tokens
            .id_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TokenExchangeError::InvalidResponse("missing id_token".to_string()))?;

        Ok(TokenSet {
            id_token,
            access_token: tokens.access_token.filter(|t| !t.is_empty()),
        })
    }
}

fn first_header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Origin (scheme + host + port) the browser used to reach us, honoring
/// proxy headers. Returns `None` for anything that isn't a bare http(s) origin.
pub fn request_origin(headers: &HeaderMap, default_scheme: &str) -> Option<Url> {
    let scheme = first_header_value(headers, "x-forwarded-proto").unwrap_or(default_scheme);
    if scheme != "http" && scheme != "https" {
        return None;
    }

    let host = first_header_value(headers, "x-forwarded-host")
        .or_else(|| first_header_value(headers, "host"))?;

    let origin = Url::parse(&format!("{}://{}", scheme, host)).ok()?;
    let is_bare_origin = origin.path() == "/"
        && origin.query().is_none()
        && origin.username().is_empty()
        && origin.password().is_none()
        && origin.host_str().is_some();

    is_bare_origin.then_some(origin)
}

/// Pick the redirect URI for this request.
///
/// A configured URI on the same origin wins. Otherwise the callback URL is
/// rebuilt from the request origin, so a site reachable under several
/// hostnames sends the provider the one the browser is actually on.
pub fn resolve_redirect_uri(configured: &[Url], origin: Option<&Url>) -> Option<Url> {
    let Some(origin) = origin else {
        return configured.first().cloned();
    };

    if let Some(matching) = configured.iter().find(|uri| uri.origin() == origin.origin()) {
        return Some(matching.clone());
    }

    origin
        .join(CALLBACK_PATH)
        .ok()
        .or_else(|| configured.first().cloned())
}

#[cfg(test)]
mod tests {
    use fixtures::provider::{FakeProvider, TokenBehavior, CLIENT_ID, CLIENT_SECRET};

    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, value.parse().unwrap());
        }
        headers
    }

    #[test]
    fn test_request_origin_prefers_forwarded_headers() {
        let origin = request_origin(
            &headers(&[
                ("host", "internal:8080"),
                ("x-forwarded-host", "www.example.no"),
                ("x-forwarded-proto", "https"),
            ]),
            "http",
        )
        .unwrap();

        assert_eq!(origin.as_str(), "https://www.example.no/");
    }

    #[test]
    fn test_request_origin_rejects_junk_hosts() {
        assert!(request_origin(&headers(&[("host", "evil.example/path")]), "https").is_none());
        assert!(request_origin(&headers(&[("host", "user@evil.example")]), "https").is_none());
        assert!(request_origin(
            &headers(&[("host", "example.no"), ("x-forwarded-proto", "javascript")]),
            "https"
        )
        .is_none());
        assert!(request_origin(&HeaderMap::new(), "https").is_none());
    }

    #[test]
    fn test_resolve_redirect_uri() {
        let configured: Vec<Url> = vec![
            "https://example.no/api/auth/vipps/callback".parse().unwrap(),
            "https://www.example.no/api/auth/vipps/callback".parse().unwrap(),
        ];

        let www: Url = "https://www.example.no".parse().unwrap();
        assert_eq!(
            resolve_redirect_uri(&configured, Some(&www)).unwrap(),
            configured[1]
        );

        let preview: Url = "https://preview.example.no".parse().unwrap();
        assert_eq!(
            resolve_redirect_uri(&configured, Some(&preview))
                .unwrap()
                .as_str(),
            "https://preview.example.no/api/auth/vipps/callback"
        );

        assert_eq!(
            resolve_redirect_uri(&configured, None).unwrap(),
            configured[0]
        );
    }

    #[tokio::test]
    async fn test_exchange_posts_code_and_redirect_uri() {
        let provider = FakeProvider::spawn().await.unwrap();
        provider.register_code("ABC123", "N1");

        let exchanger = TokenExchanger::new(
            reqwest::Client::new(),
            ClientCredentials::new(CLIENT_ID, CLIENT_SECRET),
        );
        let tokens = exchanger
            .exchange(
                &format!("{}/token", provider.base_url),
                "ABC123",
                "http://localhost:3000/api/auth/vipps/callback",
            )
            .await
            .unwrap();

        assert!(!tokens.id_token.is_empty());
        assert!(tokens.access_token.is_some());
        assert_eq!(
            provider.last_redirect_uri().as_deref(),
            Some("http://localhost:3000/api/auth/vipps/callback")
        );
    }

    #[tokio::test]
    async fn test_exchange_surfaces_provider_rejection() {
        let provider = FakeProvider::spawn().await.unwrap();
        provider.set_token_behavior(TokenBehavior {
            status: 400,
            ..TokenBehavior::default()
        });
        provider.register_code("ABC123", "N1");

        let exchanger = TokenExchanger::new(
            reqwest::Client::new(),
            ClientCredentials::new(CLIENT_ID, CLIENT_SECRET),
        );
        let err = exchanger
            .exchange(&format!("{}/token", provider.base_url), "ABC123", "http://x")
            .await
            .unwrap_err();

        match err {
            TokenExchangeError::Rejected { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exchange_with_wrong_secret_is_rejected() {
        let provider = FakeProvider::spawn().await.unwrap();
        provider.register_code("ABC123", "N1");

        let exchanger = TokenExchanger::new(
            reqwest::Client::new(),
            ClientCredentials::new(CLIENT_ID, "wrong"),
        );
        let err = exchanger
            .exchange(&format!("{}/token", provider.base_url), "ABC123", "http://x")
            .await
            .unwrap_err();

        assert!(matches!(err, TokenExchangeError::Rejected { status: 401, .. }));
    }
}
