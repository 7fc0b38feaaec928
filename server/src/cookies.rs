use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse as _, Response},
};
use tower_cookies::{Cookies, Key};
use tracing::{debug, error};

pub use tower_cookies::Cookie;

use crate::state::AppState;

/// The `login-context` and `session-id` cookies, encrypted under `COOKIE_KEY`.
///
/// A cookie that fails to decrypt (tampered, or sealed under another key)
/// reads the same as a missing one.
pub struct PrivateJar {
    cookies: Cookies,
    key: Key,
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for PrivateJar {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookies = Cookies::from_request_parts(parts, state).await.map_err(|_| {
            error!("CookieManagerLayer missing, cannot read private cookies");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })?;

        Ok(PrivateJar::new(cookies, state.cookie_key.clone()))
    }
}

impl PrivateJar {
    pub fn new(cookies: Cookies, key: Key) -> Self {
        Self { cookies, key }
    }

    pub fn add(&self, cookie: Cookie<'static>) {
        self.cookies.private(&self.key).add(cookie);
    }

    /// Decrypted value of `name`, empty values count as absent
    pub fn value(&self, name: &str) -> Option<String> {
        self.cookies
            .private(&self.key)
            .get(name)
            .map(|cookie| cookie.value().to_string())
            .filter(|value| !value.is_empty())
    }

    /// Read the cookie named by `removal` and expire it in the same response
    pub fn take(&self, removal: Cookie<'static>) -> Option<String> {
        let value = self.value(removal.name());
        if value.is_none() {
            debug!(cookie = removal.name(), "No usable private cookie to take");
        }
        self.remove(removal);
        value
    }

    pub fn remove(&self, cookie: Cookie<'static>) {
        self.cookies.private(&self.key).remove(cookie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_round_trip_only_under_the_same_key() {
        let cookies = Cookies::default();
        let jar = PrivateJar::new(cookies.clone(), Key::generate());
        jar.add(Cookie::new("session-id", "abc"));

        assert_eq!(jar.value("session-id").as_deref(), Some("abc"));
        // the raw cookie is sealed, not the plain value
        assert_ne!(cookies.get("session-id").unwrap().value(), "abc");

        let other = PrivateJar::new(cookies, Key::generate());
        assert_eq!(other.value("session-id"), None);
    }

    #[test]
    fn test_take_reads_and_expires() {
        let jar = PrivateJar::new(Cookies::default(), Key::generate());
        jar.add(Cookie::new("login-context", "ctx-1"));

        let removal = Cookie::build(("login-context", "")).path("/").build();
        assert_eq!(jar.take(removal.clone()).as_deref(), Some("ctx-1"));
        assert_eq!(jar.take(removal), None);
    }

    #[test]
    fn test_empty_value_is_absent() {
        let jar = PrivateJar::new(Cookies::default(), Key::generate());
        jar.add(Cookie::new("session-id", ""));

        assert_eq!(jar.value("session-id"), None);
    }
}
