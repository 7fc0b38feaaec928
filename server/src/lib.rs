//! Applicant identity verification for the job application flow.
//!
//! Applicants log in with Vipps (an OpenID Connect provider) before submitting
//! the application form. This crate holds the relying-party callback flow, the
//! server-side sessions it issues and the CSRF guard protecting form posts.

pub mod auth;
pub mod config;
pub mod cookies;
pub mod csrf;
pub mod email;
pub mod errors;
pub mod oidc;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod store;
pub mod utils;

pub use config::AppConfig;
pub use state::AppState;
