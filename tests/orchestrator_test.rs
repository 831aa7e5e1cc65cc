// End-to-end tests for the fan-out orchestrator

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::NaiveDate;
use faregate::auth::{CredentialConfig, TokenCache};
use faregate::db::repositories::call::{CallRegistry, CallStatus};
use faregate::db::repositories::session_state::SessionStateStore;
use faregate::db::repositories::token::TokenStore;
use faregate::db::Database;
use faregate::orchestrator::{Orchestrator, SearchOutcome, ToolRequest};
use faregate::provider::{
    AwardInventoryAdapter, CashInventoryAdapter, FarePrice, ProviderAdapter, RetryPolicy,
    SearchMode, SearchParams,
};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    _temp: TempDir,
    orchestrator: Orchestrator,
    auth_server: MockServer,
    award_server: MockServer,
    cash_server: MockServer,
}

async fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let db = Database::new(temp.path().join("test.db")).unwrap();

    let auth_server = MockServer::start().await;
    let award_server = MockServer::start().await;
    let cash_server = MockServer::start().await;

    let mut environments = HashMap::new();
    environments.insert(
        "test".to_string(),
        CredentialConfig {
            token_url: format!("{}/oauth/token", auth_server.uri()),
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
        },
    );
    let token_cache = Arc::new(TokenCache::new(TokenStore::new(db.clone()), environments));

    // Single attempt so failure tests keep deterministic request counts
    let retry = RetryPolicy {
        max_attempts: 1,
        base_delay: StdDuration::from_millis(1),
    };

    let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
        Arc::new(AwardInventoryAdapter::new(
            award_server.uri(),
            "test",
            Arc::clone(&token_cache),
            retry,
        )),
        Arc::new(CashInventoryAdapter::new(
            cash_server.uri(),
            "partner-key-123",
            retry,
        )),
    ];

    let orchestrator = Orchestrator::new(
        CallRegistry::new(db.clone()),
        SessionStateStore::new(db.clone()),
        adapters,
    );

    Harness {
        _temp: temp,
        orchestrator,
        auth_server,
        award_server,
        cash_server,
    }
}

fn search_request(mode: SearchMode) -> ToolRequest {
    ToolRequest::SearchFlights(SearchParams {
        origin: "FRA".to_string(),
        destination: "JFK".to_string(),
        departure_date: NaiveDate::from_ymd_opt(2025, 3, 15).unwrap(),
        return_date: None,
        passengers: 1,
        cabin: None,
        mode,
    })
}

async fn mount_token(server: &MockServer, expected_grants: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-abc",
            "token_type": "Bearer",
            "expires_in": 1800
        })))
        .expect(expected_grants)
        .mount(server)
        .await;
}

fn award_offer_body() -> serde_json::Value {
    json!({
        "offers": [{
            "carrier": "LH",
            "flightNumber": "LH400",
            "origin": "FRA",
            "destination": "JFK",
            "departsAt": "2025-03-15T10:05:00",
            "arrivesAt": "2025-03-15T13:10:00",
            "cabin": "business",
            "milesCost": 88000,
            "taxesCents": 45230,
            "currency": "EUR",
            "seatsRemaining": 2
        }]
    })
}

fn cash_offer_body() -> serde_json::Value {
    json!({
        "data": [{
            "carrier": "DL",
            "flight_number": "DL107",
            "origin": "FRA",
            "destination": "JFK",
            "departs_at": "2025-03-15T12:45:00",
            "arrives_at": "2025-03-15T15:55:00",
            "cabin": "economy",
            "total_amount": "612.40",
            "total_currency": "USD",
            "seats_remaining": 9
        }]
    })
}

#[tokio::test]
async fn test_both_branches_merge_into_one_result() {
    let h = harness().await;
    mount_token(&h.auth_server, 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/award-offers/search"))
        .and(header("Authorization", "Bearer tok-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(award_offer_body()))
        .expect(1)
        .mount(&h.award_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/offers"))
        .and(header("X-Partner-Key", "partner-key-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cash_offer_body()))
        .expect(1)
        .mount(&h.cash_server)
        .await;

    let result = h
        .orchestrator
        .execute("c1", &search_request(SearchMode::Both))
        .await
        .unwrap();

    assert!(!result.reused);
    match result.outcome {
        SearchOutcome::Results { fares, degraded } => {
            assert_eq!(fares.len(), 2);
            assert!(degraded.is_empty());
            assert!(fares.iter().any(|f| f.provider == "award"
                && f.price
                    == FarePrice::Award {
                        miles: 88000,
                        taxes_cents: 45230,
                        currency: "EUR".to_string()
                    }));
            assert!(fares.iter().any(|f| f.provider == "cash"
                && f.price
                    == FarePrice::Cash {
                        amount_cents: 61240,
                        currency: "USD".to_string()
                    }));
        }
        other => panic!("expected results, got {:?}", other),
    }

    let call = h
        .orchestrator
        .registry()
        .get_call(&result.call_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.status, CallStatus::Succeeded);
    assert!(call.response.is_some());
}

#[tokio::test]
async fn test_partial_failure_still_succeeds() {
    let h = harness().await;
    mount_token(&h.auth_server, 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/award-offers/search"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .expect(1)
        .mount(&h.award_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/offers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cash_offer_body()))
        .expect(1)
        .mount(&h.cash_server)
        .await;

    let result = h
        .orchestrator
        .execute("c1", &search_request(SearchMode::Both))
        .await
        .unwrap();

    match result.outcome {
        SearchOutcome::Results { fares, degraded } => {
            assert_eq!(fares.len(), 1);
            assert_eq!(fares[0].provider, "cash");
            assert_eq!(degraded.len(), 1);
            assert_eq!(degraded[0].provider, "award");
        }
        other => panic!("expected partial results, got {:?}", other),
    }

    // Partial success is still success, and the stored response reflects the
    // degraded branch
    let call = h
        .orchestrator
        .registry()
        .get_call(&result.call_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.status, CallStatus::Succeeded);
    let response = call.response.unwrap();
    assert_eq!(response["fares"].as_array().unwrap().len(), 1);
    assert_eq!(
        response["failed_providers"].as_array().unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_all_branches_failing_is_a_recoverable_outcome() {
    let h = harness().await;
    mount_token(&h.auth_server, 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/award-offers/search"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&h.award_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/offers"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&h.cash_server)
        .await;

    let result = h
        .orchestrator
        .execute("c1", &search_request(SearchMode::Both))
        .await
        .unwrap();

    match result.outcome {
        SearchOutcome::NoResults { error, failures } => {
            assert!(error.contains("all providers failed"));
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected no results, got {:?}", other),
    }

    let call = h
        .orchestrator
        .registry()
        .get_call(&result.call_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.status, CallStatus::Failed);
    assert!(call.error.unwrap().contains("all providers failed"));
    assert!(call.response.is_none());
}

#[tokio::test]
async fn test_identical_request_replays_without_provider_traffic() {
    let h = harness().await;

    // Every expectation counts total requests across both executes
    mount_token(&h.auth_server, 1).await;
    Mock::given(method("POST"))
        .and(path("/v1/award-offers/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(award_offer_body()))
        .expect(1)
        .mount(&h.award_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/offers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cash_offer_body()))
        .expect(1)
        .mount(&h.cash_server)
        .await;

    let first = h
        .orchestrator
        .execute("c1", &search_request(SearchMode::Both))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .execute("c1", &search_request(SearchMode::Both))
        .await
        .unwrap();

    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(first.call_id, second.call_id);

    let first_fares = match first.outcome {
        SearchOutcome::Results { fares, .. } => fares,
        other => panic!("expected results, got {:?}", other),
    };
    let second_fares = match second.outcome {
        SearchOutcome::Results { fares, .. } => fares,
        other => panic!("expected results, got {:?}", other),
    };
    assert_eq!(first_fares, second_fares);
}

#[tokio::test]
async fn test_failed_call_replays_failure() {
    let h = harness().await;
    mount_token(&h.auth_server, 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/award-offers/search"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .expect(1)
        .mount(&h.award_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/offers"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&h.cash_server)
        .await;

    let first = h
        .orchestrator
        .execute("c1", &search_request(SearchMode::Both))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .execute("c1", &search_request(SearchMode::Both))
        .await
        .unwrap();

    assert!(second.reused);
    assert_eq!(first.call_id, second.call_id);
    match second.outcome {
        SearchOutcome::NoResults { error, .. } => {
            assert!(error.contains("all providers failed"));
        }
        other => panic!("expected replayed failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_award_only_mode_skips_cash_provider() {
    let h = harness().await;
    mount_token(&h.auth_server, 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/award-offers/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(award_offer_body()))
        .expect(1)
        .mount(&h.award_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/offers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cash_offer_body()))
        .expect(0)
        .mount(&h.cash_server)
        .await;

    let result = h
        .orchestrator
        .execute("c1", &search_request(SearchMode::Award))
        .await
        .unwrap();

    match result.outcome {
        SearchOutcome::Results { fares, .. } => {
            assert_eq!(fares.len(), 1);
            assert_eq!(fares[0].provider, "award");
        }
        other => panic!("expected award results, got {:?}", other),
    }
}

#[tokio::test]
async fn test_credential_failure_only_fails_the_award_branch() {
    let h = harness().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad client"))
        .mount(&h.auth_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/offers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cash_offer_body()))
        .expect(1)
        .mount(&h.cash_server)
        .await;

    let result = h
        .orchestrator
        .execute("c1", &search_request(SearchMode::Both))
        .await
        .unwrap();

    match result.outcome {
        SearchOutcome::Results { fares, degraded } => {
            assert_eq!(fares.len(), 1);
            assert_eq!(fares[0].provider, "cash");
            assert_eq!(degraded.len(), 1);
            assert_eq!(degraded[0].provider, "award");
            assert!(degraded[0].reason.contains("credential refresh failed"));
        }
        other => panic!("expected degraded results, got {:?}", other),
    }
}

#[tokio::test]
async fn test_session_state_records_last_search() {
    let h = harness().await;
    mount_token(&h.auth_server, 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/award-offers/search"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&h.award_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/offers"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&h.cash_server)
        .await;

    // The request becomes established context even when every branch fails
    h.orchestrator
        .execute("c1", &search_request(SearchMode::Both))
        .await
        .unwrap();

    let state = h.orchestrator.session_state().get("c1").await.unwrap();
    let last_search = state.get("last_search").expect("last_search patched");
    assert_eq!(last_search["origin"], json!("FRA"));
    assert_eq!(last_search["destination"], json!("JFK"));
    assert_eq!(last_search["departure_date"], json!("2025-03-15"));
}
