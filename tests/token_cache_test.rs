// Tests for the OAuth token cache

use std::collections::HashMap;

use chrono::{Duration, Utc};
use faregate::auth::{CredentialConfig, TokenCache, TokenError};
use faregate::db::repositories::token::{CachedToken, TokenStore};
use faregate::db::Database;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(db_path).unwrap();
    (db, temp_dir)
}

fn cache_for(db: &Database, server: &MockServer) -> TokenCache {
    let mut environments = HashMap::new();
    environments.insert(
        "sandbox".to_string(),
        CredentialConfig {
            token_url: format!("{}/oauth/token", server.uri()),
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
        },
    );
    TokenCache::new(TokenStore::new(db.clone()), environments)
}

#[tokio::test]
async fn test_token_fetched_once_within_validity_window() {
    let (db, _temp) = create_test_db();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-abc",
            "token_type": "Bearer",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache_for(&db, &server);

    let first = cache.get_token("sandbox").await.unwrap();
    assert_eq!(first.access_token, "tok-abc");
    assert_eq!(first.authorization_value(), "Bearer tok-abc");

    // Second call inside the validity window: served from the cache
    let second = cache.get_token("sandbox").await.unwrap();
    assert_eq!(second.access_token, "tok-abc");
}

#[tokio::test]
async fn test_token_within_expiry_margin_triggers_refresh() {
    let (db, _temp) = create_test_db();
    let server = MockServer::start().await;

    // expires_in shorter than the safety margin, so the cached row is never
    // considered usable and each call refreshes
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-short",
            "token_type": "Bearer",
            "expires_in": 5
        })))
        .expect(2)
        .mount(&server)
        .await;

    let cache = cache_for(&db, &server);

    cache.get_token("sandbox").await.unwrap();
    cache.get_token("sandbox").await.unwrap();
}

#[tokio::test]
async fn test_client_credentials_sent_as_basic_auth() {
    let (db, _temp) = create_test_db();
    let server = MockServer::start().await;

    // base64("client-id:client-secret")
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(header(
            "Authorization",
            "Basic Y2xpZW50LWlkOmNsaWVudC1zZWNyZXQ=",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-abc",
            "token_type": "Bearer",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache_for(&db, &server);
    cache.get_token("sandbox").await.unwrap();
}

#[tokio::test]
async fn test_refresh_failure_caches_nothing() {
    let (db, _temp) = create_test_db();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(500).set_body_string("server error"))
        .mount(&server)
        .await;

    let cache = cache_for(&db, &server);

    let result = cache.get_token("sandbox").await;
    assert!(matches!(result, Err(TokenError::RefreshFailed(_))));

    // No row was written for the failed grant
    let store = TokenStore::new(db.clone());
    let cached = store.find_valid("sandbox", Utc::now()).await.unwrap();
    assert!(cached.is_none());
}

#[tokio::test]
async fn test_unknown_environment() {
    let (db, _temp) = create_test_db();
    let server = MockServer::start().await;

    let cache = cache_for(&db, &server);

    let result = cache.get_token("production").await;
    assert!(matches!(result, Err(TokenError::UnknownEnvironment(_))));
}

#[tokio::test]
async fn test_cleanup_deletes_only_expired_tokens() {
    let (db, _temp) = create_test_db();
    let server = MockServer::start().await;

    let store = TokenStore::new(db.clone());
    let now = Utc::now();

    store
        .insert(&CachedToken {
            environment: "sandbox".to_string(),
            access_token: "tok-old".to_string(),
            token_type: "Bearer".to_string(),
            expires_at: now - Duration::seconds(60),
            created_at: now - Duration::seconds(1860),
        })
        .await
        .unwrap();
    store
        .insert(&CachedToken {
            environment: "sandbox".to_string(),
            access_token: "tok-live".to_string(),
            token_type: "Bearer".to_string(),
            expires_at: now + Duration::seconds(1800),
            created_at: now,
        })
        .await
        .unwrap();

    let cache = cache_for(&db, &server);
    let deleted = cache.cleanup_expired().await.unwrap();
    assert_eq!(deleted, 1);

    // The live token survives and is still served
    let token = cache.get_token("sandbox").await.unwrap();
    assert_eq!(token.access_token, "tok-live");
}

#[tokio::test]
async fn test_freshest_valid_token_wins() {
    let (db, _temp) = create_test_db();
    let server = MockServer::start().await;

    let store = TokenStore::new(db.clone());
    let now = Utc::now();

    for (token, ttl) in [("tok-older", 600), ("tok-fresher", 1800)] {
        store
            .insert(&CachedToken {
                environment: "sandbox".to_string(),
                access_token: token.to_string(),
                token_type: "Bearer".to_string(),
                expires_at: now + Duration::seconds(ttl),
                created_at: now,
            })
            .await
            .unwrap();
    }

    let cache = cache_for(&db, &server);
    let token = cache.get_token("sandbox").await.unwrap();
    assert_eq!(token.access_token, "tok-fresher");
}
