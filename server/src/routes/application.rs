use axum::{
    async_trait,
    extract::{FromRequest, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::AuthApplicant,
    errors::{ServerResult, WithStatus},
    oidc::VerifiedIdentity,
    routes::{too_many_requests, ClientIp},
    state::AppState,
};

const MAX_POSITION_LEN: usize = 200;
const MAX_MESSAGE_LEN: usize = 5000;

#[derive(Debug, Deserialize)]
pub struct ApplicationSubmission {
    pub position: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "linkedinUrl", alias = "linkedin_url")]
    pub linkedin_url: Option<String>,
}

impl ApplicationSubmission {
    fn validate(&self) -> Result<(), &'static str> {
        let position = self.position.trim();
        if position.is_empty() {
            return Err("position is required");
        }
        if position.chars().count() > MAX_POSITION_LEN {
            return Err("position is too long");
        }
        if self
            .message
            .as_deref()
            .is_some_and(|m| m.chars().count() > MAX_MESSAGE_LEN)
        {
            return Err("message is too long");
        }
        Ok(())
    }
}

/// Form or JSON body, chosen by content type
pub struct Submission(pub ApplicationSubmission);

#[async_trait]
impl<S: Send + Sync> FromRequest<S> for Submission {
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        if is_json {
            Json::<ApplicationSubmission>::from_request(req, state)
                .await
                .map(|Json(submission)| Submission(submission))
                .map_err(IntoResponse::into_response)
        } else {
            Form::<ApplicationSubmission>::from_request(req, state)
                .await
                .map(|Form(submission)| Submission(submission))
                .map_err(IntoResponse::into_response)
        }
    }
}

fn render_email(
    reference: &Uuid,
    applicant: &VerifiedIdentity,
    submission: &ApplicationSubmission,
) -> (String, String) {
    let name = applicant.name.as_deref().unwrap_or("Ukjent navn");
    let subject = format!("Ny søknad: {} ({})", submission.position.trim(), name);

    let mut body = String::new();
    body.push_str(&format!("Referanse: {}\n", reference));
    body.push_str(&format!("Stilling: {}\n\n", submission.position.trim()));
    body.push_str("Søker (verifisert med Vipps)\n");
    body.push_str(&format!("Navn: {}\n", name));
    body.push_str(&format!(
        "Telefon: {}\n",
        applicant.phone_number.as_deref().unwrap_or("-")
    ));
    body.push_str(&format!(
        "E-post: {}\n",
        applicant.email.as_deref().unwrap_or("-")
    ));
    body.push_str(&format!(
        "Fødselsdato: {}\n",
        applicant.birthdate.as_deref().unwrap_or("-")
    ));
    if let Some(linkedin) = submission.linkedin_url.as_deref().filter(|l| !l.is_empty()) {
        body.push_str(&format!("LinkedIn: {}\n", linkedin));
    }
    if let Some(message) = submission.message.as_deref().filter(|m| !m.is_empty()) {
        body.push_str(&format!("\nMelding:\n{}\n", message));
    }

    (subject, body)
}

/// Submit a job application as the logged in applicant
pub async fn submit(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    applicant: AuthApplicant,
    Submission(submission): Submission,
) -> ServerResult<Response, StatusCode> {
    let decision = state
        .rate_limiter
        .enforce(&format!("application:{}", ip))
        .await;
    if !decision.allowed {
        warn!("Application submission rate limited");
        return Ok(too_many_requests(decision.reset_seconds));
    }

    if let Err(reason) = submission.validate() {
        return Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "invalid_submission", "reason": reason })),
        )
            .into_response());
    }

    let reference = Uuid::new_v4();
    let (subject, body) = render_email(&reference, &applicant.session.claims, &submission);

    let sent = state
        .email
        .send(&subject, &body)
        .await
        .with_status(StatusCode::BAD_GATEWAY)?;

    match sent {
        Some(message_id) => {
            info!(%reference, %message_id, "Application sent");
            Ok(Json(json!({ "ok": true, "reference": reference.to_string() })).into_response())
        }
        None => {
            warn!(%reference, "Application could not be delivered, email is not configured");
            Ok((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "email_not_configured" })),
            )
                .into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(position: &str, message: Option<&str>) -> ApplicationSubmission {
        ApplicationSubmission {
            position: position.to_string(),
            message: message.map(str::to_string),
            linkedin_url: None,
        }
    }

    #[test]
    fn test_validation() {
        assert!(submission("Lagermedarbeider", None).validate().is_ok());
        assert!(submission("   ", None).validate().is_err());
        assert!(submission(&"x".repeat(201), None).validate().is_err());
        assert!(submission("Sjåfør", Some(&"x".repeat(5001)))
            .validate()
            .is_err());
    }

    #[test]
    fn test_email_contains_verified_identity() {
        let reference = Uuid::new_v4();
        let applicant = VerifiedIdentity {
            subject: "U1".to_string(),
            name: Some("Kari Nordmann".to_string()),
            phone_number: Some("4712345678".to_string()),
            birthdate: Some("1990-01-01".to_string()),
            email: None,
            nonce: Some("N1".to_string()),
        };

        let (subject, body) = render_email(
            &reference,
            &applicant,
            &submission("Lagermedarbeider", Some("Hei!")),
        );

        assert_eq!(subject, "Ny søknad: Lagermedarbeider (Kari Nordmann)");
        assert!(body.contains(&reference.to_string()));
        assert!(body.contains("Telefon: 4712345678"));
        assert!(body.contains("E-post: -"));
        assert!(body.contains("Hei!"));
        assert!(!body.contains("N1"));
    }
}
