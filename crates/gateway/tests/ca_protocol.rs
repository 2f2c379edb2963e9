//! Get-or-create against a mocked Lemur CA

use std::sync::Arc;
use std::time::Duration;

use lemur_config::CaConfig;
use lemur_gateway::certs::{CaClient, CertError, CredentialSource, ErrorKind, Manifest};
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "tok-1";

fn manifest() -> Manifest {
    Manifest::new(
        "internal-ca",
        "svc.example.com",
        "owner@example.com",
        "2024-01-01",
        "2024-01-15",
        "platform",
    )
}

fn client_with(server: &MockServer, config: CaConfig) -> CaClient {
    CaClient::new(&CaConfig {
        base_url: server.uri(),
        ..config
    })
    .unwrap()
    .with_credentials(CredentialSource::Static {
        username: "gateway".into(),
        password: "secret".into(),
    })
}

fn client(server: &MockServer) -> CaClient {
    client_with(server, CaConfig::default())
}

async fn mount_login(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({"username": "gateway", "password": "secret"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": TOKEN})))
        .expect(expected)
        .mount(server)
        .await;
}

fn record(id: u64) -> serde_json::Value {
    json!({
        "id": id,
        "chain": "CHAIN-PEM",
        "body": "BODY-PEM",
        "dateCreated": "2024-01-01T00:00:00Z",
    })
}

async fn mount_key(server: &MockServer, id: u64, expected: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/certificates/{}/key", id)))
        .and(header("authorization", format!("Bearer {}", TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"key": "KEY-PEM"})))
        .expect(expected)
        .mount(server)
        .await;
}

/// First search finds nothing, every later search finds record `id`
async fn mount_search_then_found(server: &MockServer, manifest: &Manifest, id: u64) {
    let filter = format!("description;{}", manifest.description());

    Mock::given(method("GET"))
        .and(path("/certificates"))
        .and(query_param("filter", filter.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 0, "items": []})))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/certificates"))
        .and(query_param("filter", filter.as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"total": 1, "items": [record(id)]})),
        )
        .with_priority(2)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_creates_once_then_finds_existing() {
    let server = MockServer::start().await;
    let manifest = manifest();
    mount_login(&server, 1).await;
    mount_search_then_found(&server, &manifest, 42).await;
    mount_key(&server, 42, 2).await;

    Mock::given(method("POST"))
        .and(path("/certificates"))
        .and(header("authorization", format!("Bearer {}", TOKEN).as_str()))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(json!({
            "authority": {"name": "internal-ca"},
            "commonName": "svc.example.com",
            "owner": "owner@example.com",
            "validityStart": "2024-01-01",
            "validityEnd": "2024-01-15",
            "organization": "platform",
            "organizationalUnit": "platform",
            "description": manifest.description(),
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(record(42)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);

    let created = client.resolve_certificate(&manifest).await.unwrap();
    assert_eq!(created.certificate, "BODY-PEM");
    assert_eq!(created.chain, "CHAIN-PEM");
    assert_eq!(created.private_key, "KEY-PEM");

    let found = client.resolve_certificate(&manifest).await.unwrap();
    assert_eq!(found, created);
}

#[tokio::test]
async fn test_search_sends_sort_and_bearer() {
    let server = MockServer::start().await;
    let manifest = manifest();
    mount_login(&server, 1).await;

    Mock::given(method("GET"))
        .and(path("/certificates"))
        .and(query_param("sortBy", "date_created"))
        .and(query_param("sortDir", "desc"))
        .and(query_param(
            "filter",
            format!("description;{}", manifest.description()).as_str(),
        ))
        .and(header("authorization", format!("Bearer {}", TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 0})))
        .expect(1)
        .mount(&server)
        .await;

    let page = client(&server).search(manifest.description()).await.unwrap();
    assert_eq!(page.total, 0);
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn test_login_failure_stops_resolve() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/certificates"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = client(&server)
        .resolve_certificate(&manifest())
        .await
        .unwrap_err();

    match &err {
        CertError::Status { status, url, body } => {
            assert_eq!(*status, 500);
            assert!(url.ends_with("/auth/login"));
            assert_eq!(body, "boom");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.to_string().contains("response body: 'boom'"));
}

#[tokio::test]
async fn test_create_rejection_skips_key_fetch() {
    let server = MockServer::start().await;
    mount_login(&server, 1).await;

    Mock::given(method("GET"))
        .and(path("/certificates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 0, "items": []})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/certificates"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad owner"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/certificates/42/key"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = client(&server)
        .resolve_certificate(&manifest())
        .await
        .unwrap_err();

    assert!(matches!(err, CertError::Status { status: 400, .. }));
}

#[tokio::test]
async fn test_total_without_items_is_malformed() {
    let server = MockServer::start().await;
    mount_login(&server, 1).await;

    Mock::given(method("GET"))
        .and(path("/certificates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 2, "items": []})))
        .mount(&server)
        .await;

    let err = client(&server)
        .resolve_certificate(&manifest())
        .await
        .unwrap_err();

    assert!(matches!(err, CertError::MalformedResponse { .. }));
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn test_non_json_body_is_malformed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let err = client(&server).authenticate().await.unwrap_err();
    assert!(matches!(err, CertError::MalformedResponse { .. }));
}

#[tokio::test]
async fn test_session_is_reused_within_ttl() {
    let server = MockServer::start().await;
    mount_login(&server, 1).await;

    let client = client(&server);
    assert_eq!(client.authenticate().await.unwrap(), TOKEN);
    assert_eq!(client.authenticate().await.unwrap(), TOKEN);
}

#[tokio::test]
async fn test_expired_session_logs_in_again() {
    let server = MockServer::start().await;
    mount_login(&server, 2).await;

    let client = client_with(
        &server,
        CaConfig {
            session_ttl_secs: 1,
            ..CaConfig::default()
        },
    );
    client.authenticate().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    client.authenticate().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_resolves_create_once() {
    let server = MockServer::start().await;
    let manifest = manifest();
    mount_login(&server, 1).await;
    mount_search_then_found(&server, &manifest, 7).await;
    mount_key(&server, 7, 2).await;

    Mock::given(method("POST"))
        .and(path("/certificates"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(record(7))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = Arc::new(client(&server));
    let (first, second) = tokio::join!(
        client.resolve_certificate(&manifest),
        client.resolve_certificate(&manifest)
    );

    assert_eq!(first.unwrap(), second.unwrap());
}

#[tokio::test]
async fn test_missing_environment_credentials_fail_before_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = CaClient::new(&CaConfig {
        base_url: server.uri(),
        user_env: "LEMUR_GATEWAY_TEST_UNSET_USER".into(),
        password_env: "LEMUR_GATEWAY_TEST_UNSET_PASS".into(),
        ..CaConfig::default()
    })
    .unwrap();

    let err = client.resolve_certificate(&manifest()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err
        .to_string()
        .contains("LEMUR_GATEWAY_TEST_UNSET_USER|LEMUR_GATEWAY_TEST_UNSET_PASS"));
}

#[tokio::test]
async fn test_unreachable_ca_is_network_error() {
    // Nothing listens on a port once its listener is dropped
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = CaClient::new(&CaConfig {
        base_url: format!("http://{}", addr),
        ..CaConfig::default()
    })
    .unwrap()
    .with_credentials(CredentialSource::Static {
        username: "gateway".into(),
        password: "secret".into(),
    });

    let err = client.authenticate().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
}
