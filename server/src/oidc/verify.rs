//! ID token verification.
//!
//! Verification is an ordered list of strategies tried by one driver loop.
//! Each strategy declares whether it may run after the previous failure and
//! returns a tagged result; the first success wins.
//!
//! 1. [`StrictStrategy`]: signature, audience, expiry and (when enforced) the
//!    exact issuer, all inside one `jsonwebtoken` validation.
//! 2. [`SignatureOnlyStrategy`]: only after an issuer mismatch. Signature and
//!    expiry are checked by the library, audience and the slash-normalized
//!    issuer by hand.
//! 3. [`UserinfoStrategy`]: only when the policy allows it and the last
//!    failure was about the signature itself. Trusts the userinfo endpoint and
//!    bearer possession instead of a signature. A token whose signature
//!    verified but whose audience or issuer is wrong is never salvaged here.
//!
//! A key set that can't be fetched ends verification at once with
//! [`VerificationFailure::KeySetUnavailable`].

use std::{fmt, sync::Arc};

use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    provider::{ProviderConfig, ProviderMetadata},
    token::ClientCredentials,
};

/// Trust level for identity verification, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationPolicy {
    /// Require the token's `iss` to match the expected issuer
    pub enforce_issuer: bool,
    /// Accept identities from the userinfo endpoint when no signed token
    /// could be verified
    pub allow_userinfo_fallback: bool,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            enforce_issuer: true,
            allow_userinfo_fallback: false,
        }
    }
}

impl VerificationPolicy {
    pub fn log_active(&self) {
        info!(
            enforce_issuer = self.enforce_issuer,
            allow_userinfo_fallback = self.allow_userinfo_fallback,
            "Identity verification policy"
        );

        if !self.enforce_issuer {
            warn!("Issuer enforcement is disabled, ID tokens from any issuer signed by the provider keys are accepted");
        }
        if self.allow_userinfo_fallback {
            warn!("Userinfo fallback is enabled, identities may be accepted without a verified ID token signature");
        }
    }
}

/// Claims about the applicant, from whichever strategy succeeded
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub subject: String,
    pub name: Option<String>,
    pub phone_number: Option<String>,
    pub birthdate: Option<String>,
    pub email: Option<String>,
    pub nonce: Option<String>,
}

impl fmt::Debug for VerifiedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedIdentity")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationFailure {
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    #[error("audience mismatch")]
    AudienceMismatch,
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch { expected: String, actual: String },
    #[error("userinfo unavailable: {0}")]
    UserinfoUnavailable(String),
    #[error("provider key set unavailable: {0}")]
    KeySetUnavailable(String),
    #[error("userinfo subject does not match ID token subject")]
    SubjectMismatch,
    #[error("all verification strategies exhausted: {}", describe_attempts(.0))]
    AllStrategiesExhausted(Vec<(&'static str, VerificationFailure)>),
}

fn describe_attempts(attempts: &[(&'static str, VerificationFailure)]) -> String {
    if attempts.is_empty() {
        return "no strategy applied".to_string();
    }

    attempts
        .iter()
        .map(|(name, failure)| format!("{}: {}", name, failure))
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct VerificationRequest<'a> {
    pub id_token: &'a str,
    pub access_token: Option<&'a str>,
    /// Our client id
    pub audience: &'a str,
    pub expected_issuer: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Audience {
    Single(String),
    Many(Vec<String>),
}

impl Audience {
    fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == audience,
            Audience::Many(auds) => auds.iter().any(|aud| aud == audience),
        }
    }
}

#[derive(Deserialize)]
struct IdTokenClaims {
    sub: String,
    iss: String,
    #[serde(default)]
    aud: Option<Audience>,
    nonce: Option<String>,
    name: Option<String>,
    phone_number: Option<String>,
    birthdate: Option<String>,
    email: Option<String>,
}

impl From<IdTokenClaims> for VerifiedIdentity {
    fn from(claims: IdTokenClaims) -> Self {
        Self {
            subject: claims.sub,
            name: claims.name,
            phone_number: claims.phone_number,
            birthdate: claims.birthdate,
            email: claims.email,
            nonce: claims.nonce,
        }
    }
}

/// Claims read without verification, used only to bind userinfo to the token
/// and to report the actual issuer on mismatch
#[derive(Default, Deserialize)]
struct UnverifiedClaims {
    sub: Option<String>,
    iss: Option<String>,
    nonce: Option<String>,
}

fn peek_claims(id_token: &str) -> UnverifiedClaims {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<UnverifiedClaims>(id_token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .unwrap_or_default()
}

pub fn normalize_issuer(issuer: &str) -> &str {
    issuer.trim_end_matches('/')
}

fn is_asymmetric(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
            | Algorithm::ES256
            | Algorithm::ES384
            | Algorithm::EdDSA
    )
}

fn map_jwt_error(err: jsonwebtoken::errors::Error, request: &VerificationRequest<'_>) -> VerificationFailure {
    match err.kind() {
        ErrorKind::InvalidIssuer => VerificationFailure::IssuerMismatch {
            expected: request.expected_issuer.to_string(),
            actual: peek_claims(request.id_token).iss.unwrap_or_default(),
        },
        ErrorKind::InvalidAudience => VerificationFailure::AudienceMismatch,
        ErrorKind::ExpiredSignature => VerificationFailure::SignatureInvalid("expired".to_string()),
        ErrorKind::ImmatureSignature => {
            VerificationFailure::SignatureInvalid("not yet valid".to_string())
        }
        ErrorKind::InvalidSignature => {
            VerificationFailure::SignatureInvalid("signature does not verify".to_string())
        }
        other => VerificationFailure::SignatureInvalid(format!("{:?}", other)),
    }
}

/// Everything a strategy may consult
struct StrategyContext<'a> {
    request: &'a VerificationRequest<'a>,
    metadata: &'a ProviderMetadata,
    policy: VerificationPolicy,
    provider: &'a ProviderConfig,
    client: &'a reqwest::Client,
    credentials: &'a ClientCredentials,
}

impl StrategyContext<'_> {
    /// Header algorithm and matching provider key for the ID token
    async fn decoding_key(&self) -> Result<(Algorithm, DecodingKey), VerificationFailure> {
        let header = decode_header(self.request.id_token)
            .map_err(|e| VerificationFailure::SignatureInvalid(format!("malformed token: {}", e)))?;

        if !is_asymmetric(header.alg) {
            return Err(VerificationFailure::SignatureInvalid(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }

        let jwk = self
            .provider
            .signing_key(header.kid.as_deref())
            .await
            .map_err(|e| VerificationFailure::KeySetUnavailable(e.to_string()))?
            .ok_or_else(|| {
                VerificationFailure::SignatureInvalid("no matching signing key".to_string())
            })?;

        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| VerificationFailure::SignatureInvalid(format!("unusable key: {}", e)))?;

        Ok((header.alg, key))
    }
}

#[async_trait::async_trait]
trait VerificationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this strategy runs, given the last failure (if any)
    fn applies(&self, policy: &VerificationPolicy, previous: Option<&VerificationFailure>) -> bool;

    async fn attempt(&self, ctx: &StrategyContext<'_>) -> Result<VerifiedIdentity, VerificationFailure>;
}

struct StrictStrategy;

#[async_trait::async_trait]
impl VerificationStrategy for StrictStrategy {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn applies(&self, _policy: &VerificationPolicy, previous: Option<&VerificationFailure>) -> bool {
        previous.is_none()
    }

    async fn attempt(&self, ctx: &StrategyContext<'_>) -> Result<VerifiedIdentity, VerificationFailure> {
        let (alg, key) = ctx.decoding_key().await?;

        let mut validation = Validation::new(alg);
        validation.set_audience(&[ctx.request.audience]);
        if ctx.policy.enforce_issuer {
            validation.set_issuer(&[normalize_issuer(ctx.request.expected_issuer)]);
        }

        let data = decode::<IdTokenClaims>(ctx.request.id_token, &key, &validation)
            .map_err(|e| map_jwt_error(e, ctx.request))?;

        Ok(data.claims.into())
    }
}

struct SignatureOnlyStrategy;

#[async_trait::async_trait]
impl VerificationStrategy for SignatureOnlyStrategy {
    fn name(&self) -> &'static str {
        "signature_only"
    }

    fn applies(&self, _policy: &VerificationPolicy, previous: Option<&VerificationFailure>) -> bool {
        matches!(previous, Some(VerificationFailure::IssuerMismatch { .. }))
    }

    async fn attempt(&self, ctx: &StrategyContext<'_>) -> Result<VerifiedIdentity, VerificationFailure> {
        let (alg, key) = ctx.decoding_key().await?;

        let mut validation = Validation::new(alg);
        validation.validate_aud = false;

        let claims = decode::<IdTokenClaims>(ctx.request.id_token, &key, &validation)
            .map_err(|e| map_jwt_error(e, ctx.request))?
            .claims;

        let audience_ok = claims
            .aud
            .as_ref()
            .is_some_and(|aud| aud.contains(ctx.request.audience));
        if !audience_ok {
            return Err(VerificationFailure::AudienceMismatch);
        }

        if ctx.policy.enforce_issuer
            && normalize_issuer(&claims.iss) != normalize_issuer(ctx.request.expected_issuer)
        {
            return Err(VerificationFailure::IssuerMismatch {
                expected: ctx.request.expected_issuer.to_string(),
                actual: claims.iss,
            });
        }

        Ok(claims.into())
    }
}

#[derive(Deserialize)]
struct UserinfoResponse {
    sub: String,
    name: Option<String>,
    phone_number: Option<String>,
    birthdate: Option<String>,
    email: Option<String>,
}

struct UserinfoStrategy;

#[async_trait::async_trait]
impl VerificationStrategy for UserinfoStrategy {
    fn name(&self) -> &'static str {
        "userinfo"
    }

    fn applies(&self, policy: &VerificationPolicy, previous: Option<&VerificationFailure>) -> bool {
        policy.allow_userinfo_fallback
            && matches!(previous, Some(VerificationFailure::SignatureInvalid(_)))
    }

    async fn attempt(&self, ctx: &StrategyContext<'_>) -> Result<VerifiedIdentity, VerificationFailure> {
        let access_token = ctx.request.access_token.ok_or_else(|| {
            VerificationFailure::UserinfoUnavailable("no access token".to_string())
        })?;
        let endpoint = ctx.metadata.userinfo_endpoint.as_deref().ok_or_else(|| {
            VerificationFailure::UserinfoUnavailable("provider has no userinfo endpoint".to_string())
        })?;

        warn!("Falling back to userinfo endpoint, identity is not backed by a verified signature");

        let response = ctx
            .credentials
            .apply_headers(ctx.client.get(endpoint).bearer_auth(access_token))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| VerificationFailure::UserinfoUnavailable(e.to_string()))?;

        let userinfo: UserinfoResponse = response
            .json()
            .await
            .map_err(|e| VerificationFailure::UserinfoUnavailable(e.to_string()))?;

        // Userinfo carries no nonce, so bind it to the token we were handed
        let token_claims = peek_claims(ctx.request.id_token);
        if token_claims.sub.as_deref().is_some_and(|sub| sub != userinfo.sub) {
            return Err(VerificationFailure::SubjectMismatch);
        }

        Ok(VerifiedIdentity {
            subject: userinfo.sub,
            name: userinfo.name,
            phone_number: userinfo.phone_number,
            birthdate: userinfo.birthdate,
            email: userinfo.email,
            nonce: token_claims.nonce,
        })
    }
}

pub struct IdentityVerifier {
    provider: Arc<ProviderConfig>,
    client: reqwest::Client,
    credentials: ClientCredentials,
    policy: VerificationPolicy,
    strategies: Vec<Box<dyn VerificationStrategy>>,
}

impl IdentityVerifier {
    pub fn new(
        provider: Arc<ProviderConfig>,
        client: reqwest::Client,
        credentials: ClientCredentials,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            provider,
            client,
            credentials,
            policy,
            strategies: vec![
                Box::new(StrictStrategy),
                Box::new(SignatureOnlyStrategy),
                Box::new(UserinfoStrategy),
            ],
        }
    }

    #[tracing::instrument(skip_all, err(Display))]
    pub async fn verify(
        &self,
        metadata: &ProviderMetadata,
        request: &VerificationRequest<'_>,
    ) -> Result<VerifiedIdentity, VerificationFailure> {
        let ctx = StrategyContext {
            request,
            metadata,
            policy: self.policy,
            provider: &self.provider,
            client: &self.client,
            credentials: &self.credentials,
        };

        let mut attempts: Vec<(&'static str, VerificationFailure)> = Vec::new();

        for strategy in &self.strategies {
            let previous = attempts.last().map(|(_, failure)| failure);
            if !strategy.applies(&self.policy, previous) {
                debug!(strategy = strategy.name(), "Verification strategy skipped");
                continue;
            }

            match strategy.attempt(&ctx).await {
                Ok(identity) => {
                    info!(strategy = strategy.name(), "ID token verified");
                    return Ok(identity);
                }
                Err(failure @ VerificationFailure::KeySetUnavailable(_)) => {
                    warn!(strategy = strategy.name(), %failure, "Verification aborted");
                    return Err(failure);
                }
                Err(failure) => {
                    warn!(strategy = strategy.name(), %failure, "Verification strategy failed");
                    attempts.push((strategy.name(), failure));
                }
            }
        }

        Err(VerificationFailure::AllStrategiesExhausted(attempts))
    }
}
