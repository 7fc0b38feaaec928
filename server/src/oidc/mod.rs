//! Vipps login as an OpenID Connect relying party.
//!
//! One flow against one provider: login initiation stores an
//! [`AuthorizationContext`], the provider redirects back to the callback, and
//! [`AuthCallbackController`] drives exchange, verification, nonce binding and
//! session issuance.

pub mod callback;
pub mod context;
pub mod provider;
pub mod session;
pub mod token;
pub mod verify;

pub use callback::{AuthCallbackController, AuthFailure, CallbackParams, CallbackSuccess};
pub use context::{AuthorizationContext, ContextStore, LOGIN_CONTEXT_COOKIE};
pub use provider::{ProviderConfig, ProviderError, ProviderMetadata};
pub use session::{resolve_return_path, Session, SessionIssuer, SESSION_COOKIE_NAME};
pub use token::{ClientCredentials, TokenExchangeError, TokenExchanger, TokenSet};
pub use verify::{
    IdentityVerifier, VerificationFailure, VerificationPolicy, VerificationRequest,
    VerifiedIdentity,
};
