use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use color_eyre::eyre::WrapErr;
use serde::{Deserialize, Serialize};
use tower_cookies::{cookie::SameSite, Cookie};
use tracing::info;

use super::verify::VerifiedIdentity;
use crate::{store::KvStore, utils::random_token};

/// Cookie name for storing the session ID
pub const SESSION_COOKIE_NAME: &str = "session-id";

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

const KEY_PREFIX: &str = "session:";

/// Server-side record of a logged in applicant. The cookie holds only `session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub claims: VerifiedIdentity,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

pub struct SessionIssuer {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl SessionIssuer {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[tracing::instrument(skip_all, err)]
    pub async fn issue(&self, identity: &VerifiedIdentity) -> color_eyre::Result<Session> {
        let created_at = Utc::now();
        let session = Session {
            session_id: random_token(32),
            claims: identity.clone(),
            created_at,
            expires_at: created_at + chrono::Duration::from_std(self.ttl)?,
        };

        self.store
            .set(
                &session_key(&session.session_id),
                serde_json::to_string(&session)?,
                self.ttl,
            )
            .await
            .wrap_err("Failed to persist session")?;

        info!("Created new applicant session");
        Ok(session)
    }

    /// Load a live session. Expired records count as absent.
    pub async fn resolve(&self, session_id: &str) -> color_eyre::Result<Option<Session>> {
        let Some(value) = self.store.get(&session_key(session_id)).await? else {
            return Ok(None);
        };

        let session: Session = serde_json::from_str(&value).wrap_err("Stored session is corrupt")?;
        if session.is_expired() {
            info!("Session is expired");
            return Ok(None);
        }

        Ok(Some(session))
    }

    pub async fn revoke(&self, session_id: &str) -> color_eyre::Result<()> {
        self.store.delete(&session_key(session_id)).await?;
        info!("Session revoked");
        Ok(())
    }
}

fn session_key(session_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, session_id)
}

/// Creates a session cookie for the given session
pub fn session_cookie(
    session: &Session,
    ttl: Duration,
    domain: Option<String>,
    secure: bool,
) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE_NAME, session.session_id.clone());
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(time::Duration::seconds(ttl.as_secs() as i64));
    if let Some(domain) = domain {
        cookie.set_domain(domain);
    }
    cookie
}

pub fn clear_session_cookie(domain: Option<String>) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE_NAME, "");
    cookie.set_path("/");
    if let Some(domain) = domain {
        cookie.set_domain(domain);
    }
    cookie
}

/// Cookie `Domain` for the session.
///
/// Only the configured apex and its `www.` variant share a cookie. Any other
/// host (previews, localhost) gets a host-only cookie.
pub fn cookie_domain(request_host: Option<&str>, apex: Option<&str>) -> Option<String> {
    let apex = apex?.trim_start_matches('.').to_ascii_lowercase();
    let host = request_host?.to_ascii_lowercase();
    let host = host.split(':').next().unwrap_or_default();

    (host == apex || host == format!("www.{}", apex)).then_some(apex)
}

/// Accept `raw` only as a same-origin relative path, else `default`
pub fn resolve_return_path(raw: Option<&str>, default: &str) -> String {
    let Some(path) = raw.map(str::trim) else {
        return default.to_string();
    };

    let is_relative = path.starts_with('/')
        && !path.starts_with("//")
        && !path.contains('\\')
        && !path.chars().any(char::is_control);

    if !is_relative {
        return default.to_string();
    }

    // Make sure the path can't escape the origin once a browser resolves it
    let base = url::Url::parse("http://localhost").ok();
    let stays_local = base
        .and_then(|base| base.join(path).ok())
        .is_some_and(|joined| joined.host_str() == Some("localhost"));

    if stays_local {
        path.to_string()
    } else {
        default.to_string()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;

    use super::*;

    const DEFAULT: &str = "/jobbsoker/skjema";

    fn identity() -> VerifiedIdentity {
        VerifiedIdentity {
            subject: "U1".to_string(),
            name: Some("Kari Nordmann".to_string()),
            phone_number: Some("4712345678".to_string()),
            birthdate: Some("1990-01-01".to_string()),
            email: Some("kari@example.no".to_string()),
            nonce: Some("N1".to_string()),
        }
    }

    #[test]
    fn test_resolve_return_path_rejects_external_targets() {
        assert_eq!(
            resolve_return_path(Some("https://evil.example/x"), DEFAULT),
            DEFAULT
        );
        assert_eq!(resolve_return_path(Some("//evil.example"), DEFAULT), DEFAULT);
        assert_eq!(resolve_return_path(Some("/\\evil.example"), DEFAULT), DEFAULT);
        assert_eq!(resolve_return_path(Some("javascript:alert(1)"), DEFAULT), DEFAULT);
        assert_eq!(resolve_return_path(Some("/ok\nSet-Cookie: x"), DEFAULT), DEFAULT);
        assert_eq!(resolve_return_path(Some(""), DEFAULT), DEFAULT);
        assert_eq!(resolve_return_path(None, DEFAULT), DEFAULT);
    }

    #[test]
    fn test_resolve_return_path_keeps_relative_paths() {
        assert_eq!(
            resolve_return_path(Some("/jobbsoker/skjema"), DEFAULT),
            "/jobbsoker/skjema"
        );
        assert_eq!(
            resolve_return_path(Some("/apply/form?step=2#top"), DEFAULT),
            "/apply/form?step=2#top"
        );
    }

    #[test]
    fn test_cookie_domain() {
        let apex = Some("example.no");

        assert_eq!(
            cookie_domain(Some("www.example.no"), apex).as_deref(),
            Some("example.no")
        );
        assert_eq!(
            cookie_domain(Some("Example.no:443"), apex).as_deref(),
            Some("example.no")
        );
        assert_eq!(cookie_domain(Some("preview.example.no"), apex), None);
        assert_eq!(cookie_domain(Some("localhost:3000"), apex), None);
        assert_eq!(cookie_domain(Some("www.example.no"), None), None);
    }

    #[test]
    fn test_session_cookie_holds_only_the_id() {
        let session = Session {
            session_id: "opaque-id".to_string(),
            claims: identity(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
        };

        let cookie = session_cookie(&session, DEFAULT_SESSION_TTL, None, true);

        assert_eq!(cookie.value(), "opaque-id");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.max_age(), Some(time::Duration::hours(1)));
        assert_eq!(cookie.domain(), None);
    }

    #[tokio::test]
    async fn test_issue_resolve_revoke() {
        let issuer = SessionIssuer::new(Arc::new(MemoryStore::new()), DEFAULT_SESSION_TTL);

        let session = issuer.issue(&identity()).await.unwrap();
        assert_eq!(session.expires_at - session.created_at, chrono::Duration::hours(1));

        let loaded = issuer.resolve(&session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.claims, identity());

        issuer.revoke(&session.session_id).await.unwrap();
        assert!(issuer.resolve(&session.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let issuer = SessionIssuer::new(Arc::new(MemoryStore::new()), DEFAULT_SESSION_TTL);

        let a = issuer.issue(&identity()).await.unwrap();
        let b = issuer.issue(&identity()).await.unwrap();

        assert_ne!(a.session_id, b.session_id);
    }
}
