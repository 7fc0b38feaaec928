//! Vipps login routes
//! Login initiation, the provider callback and logout.

mod callback;
mod login;
mod logout;

pub use callback::*;
pub use login::*;
pub use logout::*;

use axum::response::Redirect;

/// Redirect to the login page carrying only an opaque error code
pub(crate) fn login_failure_redirect(login_path: &str, code: &str) -> Redirect {
    let separator = if login_path.contains('?') { '&' } else { '?' };
    Redirect::to(&format!(
        "{}{}error={}",
        login_path,
        separator,
        urlencoding::encode(code)
    ))
}
