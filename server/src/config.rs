use std::{collections::HashMap, env, fmt, time::Duration};

use base64::Engine as _;
use color_eyre::eyre::{eyre, WrapErr};
use rand::{rngs::OsRng, RngCore};
use tower_cookies::Key;
use url::Url;

use crate::oidc::VerificationPolicy;

/// Path the provider redirects back to after login
pub const CALLBACK_PATH: &str = "/api/auth/vipps/callback";

const DEFAULT_DISCOVERY_URL: &str =
    "https://apitest.vipps.no/access-management-1.0/access/.well-known/openid-configuration";
const DEFAULT_SCOPES: &str = "openid name phoneNumber birthDate email";
const DEFAULT_LOGIN_PATH: &str = "/jobbsoker/logg-inn";
const DEFAULT_RETURN_PATH: &str = "/jobbsoker/skjema";

const MIN_CSRF_SECRET_LEN: usize = 32;
const MIN_COOKIE_KEY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    fn from_value(value: Option<&str>) -> Self {
        match value {
            Some("production") => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

/// HMAC secret for CSRF tokens.
///
/// In production it must be provided by the operator. Development runs get a
/// fresh random secret per process, so tokens never survive a restart.
#[derive(Clone)]
pub struct CsrfSecret(Vec<u8>);

impl CsrfSecret {
    pub fn resolve(environment: Environment, raw: Option<String>) -> color_eyre::Result<Self> {
        match raw {
            Some(secret) if secret.len() >= MIN_CSRF_SECRET_LEN => Ok(Self(secret.into_bytes())),
            Some(_) => Err(eyre!(
                "CSRF_SECRET must be at least {} bytes long",
                MIN_CSRF_SECRET_LEN
            )),
            None if environment.is_production() => {
                Err(eyre!("CSRF_SECRET is required when APP_ENV=production"))
            }
            None => {
                tracing::warn!("CSRF_SECRET not set, using a random per-process secret");
                let mut bytes = vec![0u8; 48];
                OsRng.fill_bytes(&mut bytes);
                Ok(Self(bytes))
            }
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> color_eyre::Result<Self> {
        if bytes.len() < MIN_CSRF_SECRET_LEN {
            return Err(eyre!(
                "CSRF secret must be at least {} bytes long",
                MIN_CSRF_SECRET_LEN
            ));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CsrfSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CsrfSecret(<redacted>)")
    }
}

fn resolve_cookie_key(environment: Environment, raw: Option<String>) -> color_eyre::Result<Key> {
    match raw {
        Some(encoded) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .wrap_err("COOKIE_KEY must be base64 encoded")?;
            if bytes.len() < MIN_COOKIE_KEY_LEN {
                return Err(eyre!(
                    "COOKIE_KEY must decode to at least {} bytes",
                    MIN_COOKIE_KEY_LEN
                ));
            }
            Key::try_from(bytes.as_slice()).map_err(|e| eyre!("Invalid COOKIE_KEY: {}", e))
        }
        None if environment.is_production() => {
            Err(eyre!("COOKIE_KEY is required when APP_ENV=production"))
        }
        None => Ok(Key::generate()),
    }
}

/// Everything needed to talk to the identity provider
#[derive(Debug, Clone)]
pub struct VippsConfig {
    pub discovery_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub subscription_key: Option<String>,
    pub merchant_serial_number: Option<String>,
    /// Callback URLs registered with the provider
    pub redirect_uris: Vec<Url>,
    pub scopes: String,
    /// Overrides the issuer advertised by the discovery document
    pub expected_issuer: Option<String>,
    pub policy: VerificationPolicy,
    pub timeout: Duration,
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub port: u16,
    pub public_base_url: Url,
    /// Apex host whose apex and `www` variants share the session cookie
    pub cookie_domain_host: Option<String>,
    pub csrf_secret: CsrfSecret,
    pub cookie_key: Key,
    pub database_url: Option<String>,
    pub vipps: VippsConfig,
    pub login_path: String,
    pub default_return_path: String,
    pub email: Option<EmailConfig>,
    pub rate_limit: RateLimitConfig,
    /// Take the client address from proxy headers instead of the socket
    pub trust_proxy_headers: bool,
}

impl AppConfig {
    pub fn from_env() -> color_eyre::Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_map(values: &HashMap<String, String>) -> color_eyre::Result<Self> {
        Self::from_lookup(|name| values.get(name).cloned())
    }

    /// Build and validate the configuration.
    ///
    /// Fails when a value that production depends on is missing, so the
    /// process refuses to start instead of serving with weakened security.
    pub fn from_lookup<F>(lookup: F) -> color_eyre::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &str| var(name).ok_or_else(|| eyre!("{} must be set", name));

        let environment = Environment::from_value(var("APP_ENV").as_deref());

        let port = match var("PORT") {
            Some(port) => port.parse().wrap_err("PORT must be a number")?,
            None => 3000,
        };

        let public_base_url: Url = var("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{}", port))
            .parse()
            .wrap_err("PUBLIC_BASE_URL must be a valid URL")?;

        let csrf_secret = CsrfSecret::resolve(environment, var("CSRF_SECRET"))?;
        let cookie_key = resolve_cookie_key(environment, var("COOKIE_KEY"))?;

        let database_url = var("DATABASE_URL");
        if environment.is_production() && database_url.is_none() {
            return Err(eyre!("DATABASE_URL is required when APP_ENV=production"));
        }

        let redirect_uris: Vec<Url> = match var("VIPPS_REDIRECT_URIS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<Url>()
                        .wrap_err_with(|| format!("Invalid redirect URI in VIPPS_REDIRECT_URIS: {}", s))
                })
                .collect::<color_eyre::Result<Vec<_>>>()?,
            None => vec![public_base_url
                .join(CALLBACK_PATH)
                .wrap_err("Failed to build default redirect URI")?],
        };
        if redirect_uris.is_empty() {
            return Err(eyre!("VIPPS_REDIRECT_URIS must list at least one URL"));
        }

        let policy = VerificationPolicy {
            enforce_issuer: parse_flag(var("VIPPS_ENFORCE_ISSUER").as_deref(), true)?,
            allow_userinfo_fallback: parse_flag(
                var("VIPPS_ALLOW_USERINFO_FALLBACK").as_deref(),
                false,
            )?,
        };

        let vipps = VippsConfig {
            discovery_url: var("VIPPS_DISCOVERY_URL")
                .unwrap_or_else(|| DEFAULT_DISCOVERY_URL.to_string()),
            client_id: required("VIPPS_CLIENT_ID")?,
            client_secret: required("VIPPS_CLIENT_SECRET")?,
            subscription_key: var("VIPPS_SUBSCRIPTION_KEY"),
            merchant_serial_number: var("VIPPS_MERCHANT_SERIAL_NUMBER"),
            redirect_uris,
            scopes: var("VIPPS_SCOPES").unwrap_or_else(|| DEFAULT_SCOPES.to_string()),
            expected_issuer: var("VIPPS_EXPECTED_ISSUER"),
            policy,
            timeout: Duration::from_millis(parse_number(var("PROVIDER_TIMEOUT_MS"), 10_000)?),
            cache_ttl: Duration::from_secs(parse_number(var("PROVIDER_CACHE_TTL_SECS"), 3600)?),
        };

        let email = match (
            var("EMAIL_API_URL"),
            var("EMAIL_API_KEY"),
            var("EMAIL_FROM"),
            var("EMAIL_TO"),
        ) {
            (Some(api_url), Some(api_key), Some(from), Some(to)) => Some(EmailConfig {
                api_url,
                api_key,
                from,
                to,
            }),
            _ => None,
        };

        let rate_limit = RateLimitConfig {
            max_requests: u32::try_from(parse_number(var("RATE_LIMIT_MAX"), 5)?)
                .wrap_err("RATE_LIMIT_MAX is out of range")?,
            window: Duration::from_secs(parse_number(var("RATE_LIMIT_WINDOW_SECS"), 600)?),
        };

        Ok(Self {
            environment,
            port,
            public_base_url,
            cookie_domain_host: var("COOKIE_DOMAIN_HOST").map(|h| h.to_ascii_lowercase()),
            csrf_secret,
            cookie_key,
            database_url,
            vipps,
            login_path: var("LOGIN_PATH").unwrap_or_else(|| DEFAULT_LOGIN_PATH.to_string()),
            default_return_path: var("DEFAULT_RETURN_PATH")
                .unwrap_or_else(|| DEFAULT_RETURN_PATH.to_string()),
            email,
            rate_limit,
            trust_proxy_headers: parse_flag(var("TRUST_PROXY_HEADERS").as_deref(), false)?,
        })
    }

    /// Cookies are only marked `Secure` in production, local dev runs over plain http
    pub fn secure_cookies(&self) -> bool {
        self.environment.is_production()
    }

    /// Scheme assumed for requests that don't carry `X-Forwarded-Proto`
    pub fn default_scheme(&self) -> &str {
        self.public_base_url.scheme()
    }
}

fn parse_flag(value: Option<&str>, default: bool) -> color_eyre::Result<bool> {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(eyre!("Invalid boolean flag value: {}", v)),
    }
}

fn parse_number(value: Option<String>, default: u64) -> color_eyre::Result<u64> {
    match value {
        Some(v) => v
            .trim()
            .parse()
            .wrap_err_with(|| format!("Expected a number, got {}", v)),
        None => Ok(default),
    }
}
