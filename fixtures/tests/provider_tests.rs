use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use fixtures::provider::{FakeProvider, TokenBehavior, UserinfoBehavior, CLIENT_ID, CLIENT_SECRET};
use serde_json::Value;

fn claims(token: &str) -> Value {
    let payload = token.split('.').nth(1).unwrap();
    serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap()
}

fn no_redirects() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_discovery_document() {
    let provider = FakeProvider::spawn().await.unwrap();

    let json: Value = reqwest::get(provider.discovery_url())
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(json["issuer"], provider.issuer());
    assert_eq!(json["token_endpoint"], format!("{}/token", provider.base_url));
    assert_eq!(json["jwks_uri"], format!("{}/jwks", provider.base_url));
    assert_eq!(provider.discovery_calls(), 1);
}

#[tokio::test]
async fn test_jwks_follows_rotation() {
    let provider = FakeProvider::spawn().await.unwrap();
    let url = format!("{}/jwks", provider.base_url);

    let before: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(before["keys"][0]["kid"], "fixture-key-1");

    provider.rotate_signing_kid("fixture-key-2");
    let after: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(after["keys"][0]["kid"], "fixture-key-2");
    assert_eq!(provider.jwks_calls(), 2);
}

#[tokio::test]
async fn test_authorize_redirects_back_with_code_and_state() {
    let provider = FakeProvider::spawn().await.unwrap();

    let response = no_redirects()
        .get(format!("{}/authorize", provider.base_url))
        .query(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", "http://localhost:3000/api/auth/vipps/callback"),
            ("state", "S1"),
            ("nonce", "N1"),
        ])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::SEE_OTHER);
    let location = response.headers()["location"].to_str().unwrap();
    assert!(location.starts_with("http://localhost:3000/api/auth/vipps/callback?code="));
    assert!(location.ends_with("&state=S1"));
}

#[tokio::test]
async fn test_code_is_single_use() {
    let provider = FakeProvider::spawn().await.unwrap();
    provider.register_code("ABC123", "N1");
    let client = reqwest::Client::new();

    let redeem = || {
        client
            .post(format!("{}/token", provider.base_url))
            .basic_auth(CLIENT_ID, Some(CLIENT_SECRET))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", "ABC123"),
                ("redirect_uri", "http://x"),
            ])
            .send()
    };

    let first = redeem().await.unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::OK);
    let json: Value = first.json().await.unwrap();
    let id_token = claims(json["id_token"].as_str().unwrap());
    assert_eq!(id_token["nonce"], "N1");
    assert_eq!(id_token["aud"], CLIENT_ID);

    let second = redeem().await.unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(provider.token_calls(), 2);
}

#[tokio::test]
async fn test_token_behavior_overrides_claims() {
    let provider = FakeProvider::spawn().await.unwrap();

    let token = provider.sign_id_token(
        &TokenBehavior {
            issuer: Some("https://issuer.invalid".to_string()),
            nonce: Some("tampered".to_string()),
            ..TokenBehavior::default()
        },
        "N1",
    );

    let claims = claims(&token);
    assert_eq!(claims["iss"], "https://issuer.invalid");
    assert_eq!(claims["nonce"], "tampered");
    assert_eq!(claims["sub"], fixtures::provider::SUBJECT);
}

#[tokio::test]
async fn test_userinfo_can_be_disabled() {
    let provider = FakeProvider::spawn().await.unwrap();
    let client = reqwest::Client::new();
    let url = format!("{}/userinfo", provider.base_url);

    let ok = client.get(&url).bearer_auth("t").send().await.unwrap();
    assert_eq!(ok.status(), reqwest::StatusCode::OK);

    provider.set_userinfo_behavior(UserinfoBehavior {
        enabled: false,
        ..UserinfoBehavior::default()
    });
    let unavailable = client.get(&url).bearer_auth("t").send().await.unwrap();
    assert_eq!(unavailable.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(provider.userinfo_calls(), 2);
}

#[tokio::test]
async fn test_jwks_fails_after_limit() {
    let provider = FakeProvider::spawn().await.unwrap();
    let url = format!("{}/jwks", provider.base_url);
    provider.fail_jwks_after(1);

    let served = reqwest::get(&url).await.unwrap();
    assert_eq!(served.status(), reqwest::StatusCode::OK);

    let refused = reqwest::get(&url).await.unwrap();
    assert_eq!(refused.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(provider.jwks_calls(), 2);
}
