#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Consul client against a mocked agent HTTP API.

use std::time::Duration;

use httpmock::Method::{GET, PUT};
use httpmock::MockServer;
use serde_json::json;
use svckit::directory_sdk::{
    DirectoryClient, DirectoryError, HealthStatus, RegistrationRecord, ServiceDescriptor,
};
use svckit::{ConsulDirectoryClient, DirectoryConfig, DirectoryKind};

fn client(server: &MockServer, token: Option<&str>) -> ConsulDirectoryClient {
    let config = DirectoryConfig {
        kind: DirectoryKind::Consul,
        address: server.base_url(),
        token: token.map(str::to_owned),
        request_timeout: Duration::from_secs(2),
        ..DirectoryConfig::default()
    };
    ConsulDirectoryClient::new(&config).unwrap()
}

fn record() -> RegistrationRecord {
    let descriptor = ServiceDescriptor::new("billing", "10.0.0.5", 9000).unwrap();
    RegistrationRecord::passing(descriptor, Duration::from_secs(10))
}

#[tokio::test]
async fn register_puts_service_definition() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        })
        .await;

    let descriptor = ServiceDescriptor::new("billing", "10.0.0.5", 9000).unwrap();
    let record = client(&server, None)
        .register(&descriptor, Duration::from_secs(10))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(record.instance_id(), descriptor.instance_id());
    assert_eq!(record.status, HealthStatus::Passing);
    assert_eq!(record.health_check_endpoint, "http://10.0.0.5:9000/healthz");
}

#[tokio::test]
async fn register_sends_acl_token() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/v1/agent/service/register")
                .header("x-consul-token", "s3cr3t");
            then.status(200);
        })
        .await;

    let descriptor = ServiceDescriptor::new("billing", "10.0.0.5", 9000).unwrap();
    client(&server, Some("s3cr3t"))
        .register(&descriptor, Duration::from_secs(10))
        .await
        .unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn register_rejection_is_unavailable() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(503).body("agent is shutting down");
        })
        .await;

    let descriptor = ServiceDescriptor::new("billing", "10.0.0.5", 9000).unwrap();
    let err = client(&server, None)
        .register(&descriptor, Duration::from_secs(10))
        .await
        .unwrap_err();

    assert!(err.is_transient());
    assert!(err.to_string().contains("shutting down"), "{err}");
}

#[tokio::test]
async fn heartbeat_passes_ttl_check() {
    let server = MockServer::start_async().await;
    let record = record();
    let path = format!("/v1/agent/check/pass/service:{}", record.instance_id());
    let mock = server
        .mock_async(|when, then| {
            when.method(PUT).path(path.as_str());
            then.status(200);
        })
        .await;

    client(&server, None).heartbeat(&record).await.unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn heartbeat_for_unknown_check_means_expired() {
    let server = MockServer::start_async().await;
    let record = record();
    let path = format!("/v1/agent/check/pass/service:{}", record.instance_id());
    server
        .mock_async(|when, then| {
            when.method(PUT).path(path.as_str());
            then.status(404);
        })
        .await;

    let err = client(&server, None).heartbeat(&record).await.unwrap_err();

    assert!(matches!(err, DirectoryError::RecordExpired { ref instance_id } if instance_id == record.instance_id()));
}

#[tokio::test]
async fn heartbeat_unknown_check_500_means_expired() {
    let server = MockServer::start_async().await;
    let record = record();
    server
        .mock_async(|when, then| {
            when.method(PUT).path_includes("/v1/agent/check/pass/");
            then.status(500)
                .body("CheckID \"service:x\" does not have associated TTL");
        })
        .await;

    let err = client(&server, None).heartbeat(&record).await.unwrap_err();

    assert!(matches!(err, DirectoryError::RecordExpired { .. }));
}

#[tokio::test]
async fn heartbeat_server_error_is_transient() {
    let server = MockServer::start_async().await;
    let record = record();
    server
        .mock_async(|when, then| {
            when.method(PUT).path_includes("/v1/agent/check/pass/");
            then.status(500).body("rpc error: No cluster leader");
        })
        .await;

    let err = client(&server, None).heartbeat(&record).await.unwrap_err();

    assert!(matches!(err, DirectoryError::Unavailable(_)));
}

#[tokio::test]
async fn deregister_treats_missing_service_as_done() {
    let server = MockServer::start_async().await;
    let record = record();
    let path = format!("/v1/agent/service/deregister/{}", record.instance_id());
    let mock = server
        .mock_async(|when, then| {
            when.method(PUT).path(path.as_str());
            then.status(404);
        })
        .await;

    client(&server, None).deregister(&record).await.unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn list_instances_aggregates_check_status() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/health/service/billing");
            then.status(200).json_body(json!([
                {
                    "Service": {"ID": "a", "Service": "billing", "Address": "10.0.0.1", "Port": 9000},
                    "Checks": [{"Status": "passing"}, {"Status": "passing"}]
                },
                {
                    "Service": {"ID": "b", "Service": "billing", "Address": "10.0.0.2", "Port": 9000},
                    "Checks": [{"Status": "passing"}, {"Status": "warning"}]
                },
                {
                    "Service": {"ID": "c", "Service": "billing", "Address": "10.0.0.3", "Port": 9000},
                    "Checks": [{"Status": "maintenance"}]
                }
            ]));
        })
        .await;

    let instances = client(&server, None).list_instances("billing").await.unwrap();

    let summary: Vec<_> = instances
        .iter()
        .map(|i| (i.instance_id.as_str(), i.address.as_str(), i.status))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("a", "10.0.0.1:9000", HealthStatus::Passing),
            ("b", "10.0.0.2:9000", HealthStatus::Warning),
            ("c", "10.0.0.3:9000", HealthStatus::Critical),
        ]
    );
}

#[tokio::test]
async fn unreachable_agent_is_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let config = DirectoryConfig {
        kind: DirectoryKind::Consul,
        address,
        request_timeout: Duration::from_secs(2),
        ..DirectoryConfig::default()
    };
    let err = ConsulDirectoryClient::new(&config)
        .unwrap()
        .heartbeat(&record())
        .await
        .unwrap_err();

    assert!(matches!(err, DirectoryError::Unavailable(_)));
}
