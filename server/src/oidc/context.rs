use std::{fmt, sync::Arc, time::Duration};

use color_eyre::eyre::WrapErr;
use serde::{Deserialize, Serialize};
use tower_cookies::{cookie::SameSite, Cookie};

use crate::{store::KvStore, utils::random_token};

/// Private cookie holding the id of the pending login attempt
pub const LOGIN_CONTEXT_COOKIE: &str = "login-context";

const CONTEXT_TTL: Duration = Duration::from_secs(10 * 60);
const KEY_PREFIX: &str = "login-context:";

/// One login attempt, from the authorize redirect until the callback
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthorizationContext {
    pub state: String,
    pub nonce: String,
    /// Already validated relative path
    pub return_path: String,
    /// Exact `redirect_uri` sent to the authorize endpoint
    pub redirect_uri: String,
}

impl AuthorizationContext {
    pub fn new(return_path: String, redirect_uri: String) -> Self {
        Self {
            state: random_token(32),
            nonce: random_token(32),
            return_path,
            redirect_uri,
        }
    }
}

impl fmt::Debug for AuthorizationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationContext")
            .field("return_path", &self.return_path)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

/// Server-side home of pending login attempts.
///
/// The browser only ever holds the random context id. Taking a context
/// deletes it, so each one backs at most one callback.
pub struct ContextStore {
    store: Arc<dyn KvStore>,
}

impl ContextStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Persist the context and return the id to put in the cookie
    pub async fn save(&self, context: &AuthorizationContext) -> color_eyre::Result<String> {
        let id = random_token(32);
        let value = serde_json::to_string(context)?;

        self.store
            .set(&format!("{}{}", KEY_PREFIX, id), value, CONTEXT_TTL)
            .await
            .wrap_err("Failed to store login context")?;

        Ok(id)
    }

    pub async fn take(&self, id: &str) -> color_eyre::Result<Option<AuthorizationContext>> {
        let Some(value) = self.store.take(&format!("{}{}", KEY_PREFIX, id)).await? else {
            return Ok(None);
        };

        let context = serde_json::from_str(&value).wrap_err("Stored login context is corrupt")?;
        Ok(Some(context))
    }

    pub fn cookie(id: String, secure: bool) -> Cookie<'static> {
        Cookie::build((LOGIN_CONTEXT_COOKIE, id))
            .path("/")
            .http_only(true)
            .secure(secure)
            .same_site(SameSite::Lax)
            .max_age(time::Duration::seconds(CONTEXT_TTL.as_secs() as i64))
            .build()
    }

    pub fn removal_cookie() -> Cookie<'static> {
        Cookie::build((LOGIN_CONTEXT_COOKIE, "")).path("/").build()
    }
}
