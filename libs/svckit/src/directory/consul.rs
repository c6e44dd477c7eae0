//! Consul agent HTTP API client.
//!
//! Registers the instance with a TTL check (`service:{instance_id}`) that the
//! heartbeat marks as passing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use svckit_directory_sdk::{
    DirectoryClient, DirectoryError, HealthStatus, RegistrationRecord, ServiceDescriptor,
    ServiceInstanceInfo,
};

use crate::config::DirectoryConfig;

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Render a duration the way Consul (Go) parses it.
fn go_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs().max(1))
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn check_id(instance_id: &str) -> String {
    format!("service:{instance_id}")
}

#[derive(Debug, Serialize)]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Check")]
    check: AgentTtlCheck,
}

#[derive(Debug, Serialize)]
struct AgentTtlCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Notes")]
    notes: String,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "Status")]
    status: &'static str,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
}

#[derive(Debug, Deserialize)]
struct HealthServiceEntry {
    #[serde(rename = "Service")]
    service: AgentService,
    #[serde(rename = "Checks", default)]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
}

#[derive(Debug, Deserialize)]
struct HealthCheck {
    #[serde(rename = "Status")]
    status: String,
}

/// Worst status across an instance's checks; no checks counts as passing.
/// Anything Consul reports besides passing/warning (e.g. `maintenance`) is critical.
fn aggregate_status(checks: &[HealthCheck]) -> HealthStatus {
    let mut status = HealthStatus::Passing;
    for check in checks {
        match check.status.as_str() {
            "passing" => {}
            "warning" => status = HealthStatus::Warning,
            _ => return HealthStatus::Critical,
        }
    }
    status
}

/// [`DirectoryClient`] backed by a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulDirectoryClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    deregister_critical_after: Duration,
}

impl ConsulDirectoryClient {
    /// # Errors
    /// Returns [`DirectoryError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DirectoryError::unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.address.trim_end_matches('/').to_owned(),
            token: config.token.clone(),
            deregister_critical_after: config.deregister_critical_after,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<(StatusCode, String), DirectoryError> {
        let resp = req
            .send()
            .await
            .map_err(|e| DirectoryError::unavailable(format!("request to directory failed: {e}")))?;
        let status = resp.status();
        // body is only used for diagnostics
        let body = resp.text().await.unwrap_or_default();
        Ok((status, body))
    }
}

fn unexpected(op: &str, status: StatusCode, body: &str) -> DirectoryError {
    DirectoryError::unavailable(format!("{op} returned {status}: {}", body.trim()))
}

#[async_trait]
impl DirectoryClient for ConsulDirectoryClient {
    async fn register(
        &self,
        descriptor: &ServiceDescriptor,
        ttl: Duration,
    ) -> Result<RegistrationRecord, DirectoryError> {
        let payload = AgentServiceRegistration {
            id: descriptor.instance_id(),
            name: descriptor.name(),
            address: descriptor.host(),
            port: descriptor.port(),
            check: AgentTtlCheck {
                check_id: check_id(descriptor.instance_id()),
                name: format!("{} heartbeat", descriptor.name()),
                notes: format!("health endpoint {}", descriptor.health_check_endpoint()),
                ttl: go_duration(ttl),
                status: "passing",
                deregister_critical_service_after: go_duration(self.deregister_critical_after),
            },
        };

        let (status, body) = self
            .send(
                self.request(Method::PUT, "/v1/agent/service/register")
                    .json(&payload),
            )
            .await?;
        if !status.is_success() {
            return Err(unexpected("service register", status, &body));
        }

        tracing::debug!(
            service = descriptor.name(),
            instance_id = descriptor.instance_id(),
            ttl = %go_duration(ttl),
            "Registered instance with consul"
        );
        Ok(RegistrationRecord::passing(descriptor.clone(), ttl))
    }

    async fn heartbeat(&self, record: &RegistrationRecord) -> Result<(), DirectoryError> {
        let path = format!("/v1/agent/check/pass/{}", check_id(record.instance_id()));
        let (status, body) = self.send(self.request(Method::PUT, &path)).await?;

        if status.is_success() {
            return Ok(());
        }
        // Older agents answer 500 for unknown checks instead of 404.
        let unknown_check = status == StatusCode::NOT_FOUND
            || (status == StatusCode::INTERNAL_SERVER_ERROR
                && (body.contains("Unknown check") || body.contains("does not have associated TTL")));
        if unknown_check {
            return Err(DirectoryError::RecordExpired {
                instance_id: record.instance_id().to_owned(),
            });
        }
        Err(unexpected("check pass", status, &body))
    }

    async fn deregister(&self, record: &RegistrationRecord) -> Result<(), DirectoryError> {
        let path = format!("/v1/agent/service/deregister/{}", record.instance_id());
        let (status, body) = self.send(self.request(Method::PUT, &path)).await?;

        // already gone counts as deregistered
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(unexpected("service deregister", status, &body))
        }
    }

    async fn list_instances(&self, name: &str) -> Result<Vec<ServiceInstanceInfo>, DirectoryError> {
        let resp = self
            .request(Method::GET, &format!("/v1/health/service/{name}"))
            .send()
            .await
            .map_err(|e| DirectoryError::unavailable(format!("request to directory failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(unexpected("health service", status, &body));
        }
        let entries: Vec<HealthServiceEntry> = resp
            .json()
            .await
            .map_err(|e| DirectoryError::unavailable(format!("malformed directory response: {e}")))?;

        Ok(entries
            .into_iter()
            .map(|entry| ServiceInstanceInfo {
                status: aggregate_status(&entry.checks),
                address: format!("{}:{}", entry.service.address, entry.service.port),
                name: entry.service.service,
                instance_id: entry.service.id,
            })
            .collect())
    }
}
