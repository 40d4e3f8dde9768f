//! The REST client of the backend control plane

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::types::{
    AclPolicy, AppInstance, AppInstanceCreate, Initiator, IpPool, PerformancePolicy,
    SnapshotCreate, SnapshotResource, System, app_instance_path, storage_instance_path,
    volume_path,
};
use super::{Backend, Metadata};
use crate::common::error::{ApiError, Context, DateraError, DateraResult};
use crate::config::BackendConfig;

/// Port the management REST API listens on
const API_PORT: u16 = 7718;
/// Timeout of a single request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Header carrying the session key
const AUTH_HEADER: &str = "Auth-Token";
/// Header carrying the tenant
const TENANT_HEADER: &str = "tenant";
/// Ecosystem reported with uploaded logs
const LOG_ECOSYSTEM: &str = "kubernetes";

/// Successful responses wrap the payload in `data`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    /// Payload
    data: T,
}

/// Body of a successful login
#[derive(Debug, Deserialize)]
struct LoginResponse {
    /// Session key
    key: String,
}

/// Backend reached over HTTPS
#[derive(Debug)]
pub struct HttpBackend {
    /// HTTP client
    client: Client,
    /// `https://<mgmt>:7718/v<api>`
    base_url: String,
    /// Credentials and tenant
    config: BackendConfig,
    /// Session key, `None` before login
    api_key: RwLock<Option<String>>,
}

impl HttpBackend {
    /// Create `HttpBackend`, the login happens on first use
    pub fn new(config: BackendConfig) -> DateraResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .user_agent(format!("datera-csi-{}", env!("CARGO_PKG_VERSION")))
            .build()
            .add_context("failed to build http client")?;
        let base_url = format!(
            "https://{}:{API_PORT}/v{}",
            config.mgmt_ip, config.api_version
        );
        Ok(Self {
            client,
            base_url,
            config,
            api_key: RwLock::new(None),
        })
    }

    /// Log in and cache the session key
    async fn login(&self) -> DateraResult<String> {
        let url = format!("{}/login", self.base_url);
        debug!("logging in to {} as {}", url, self.config.username);
        let resp = self
            .client
            .put(url)
            .json(&json!({
                "name": self.config.username,
                "password": self.config.password,
            }))
            .send()
            .await
            .add_context("failed to send login request")?;
        let status = resp.status();
        let body = resp.bytes().await.add_context("failed to read login response")?;
        if !status.is_success() {
            return Err(Self::decode_api_error(status, &body).add_context("login failed"));
        }
        let login: LoginResponse =
            serde_json::from_slice(&body).add_context("failed to decode login response")?;
        info!("logged in to backend {}", self.config.mgmt_ip);
        *self.api_key.write() = Some(login.key.clone());
        Ok(login.key)
    }

    /// Cached session key, logging in when there is none
    async fn api_key(&self) -> DateraResult<String> {
        let cached = self.api_key.read().clone();
        match cached {
            Some(key) => Ok(key),
            None => self.login().await,
        }
    }

    /// Decode a failure body into a business error
    fn decode_api_error(status: StatusCode, body: &[u8]) -> DateraError {
        let mut api_err = serde_json::from_slice::<ApiError>(body).unwrap_or_else(|_| {
            ApiError::new(
                "HttpError",
                0,
                String::from_utf8_lossy(body).trim(),
            )
        });
        api_err.http = status.as_u16();
        api_err.into()
    }

    /// Send a request, logging in again once when the session expired
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> DateraResult<Value> {
        let url = format!("{}{path}", self.base_url);
        let mut relogin = true;
        loop {
            let key = self.api_key().await?;
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .header(AUTH_HEADER, key)
                .header(TENANT_HEADER, &self.config.tenant)
                .query(query);
            if let Some(b) = body {
                builder = builder.json(b);
            }
            debug!("{} {}", method, url);
            let resp = builder
                .send()
                .await
                .with_context(|| format!("failed to send {method} {path}"))?;
            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && relogin {
                warn!("session expired during {} {}, logging in again", method, path);
                relogin = false;
                *self.api_key.write() = None;
                continue;
            }
            let bytes = resp
                .bytes()
                .await
                .with_context(|| format!("failed to read response of {method} {path}"))?;
            if !status.is_success() {
                return Err(Self::decode_api_error(status, &bytes)
                    .add_context(format!("{method} {path} failed")));
            }
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            let envelope: Envelope<Value> = serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to decode response of {method} {path}"))?;
            return Ok(envelope.data);
        }
    }

    /// Send a request and decode its payload
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> DateraResult<T> {
        let data = self.send(method, path, &[], body).await?;
        serde_json::from_value(data).with_context(|| format!("failed to decode payload of {path}"))
    }

    /// Serialize a request body
    fn to_body<T: serde::Serialize>(value: &T) -> DateraResult<Value> {
        serde_json::to_value(value).add_context("failed to encode request body")
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn get_app_instance(&self, name: &str) -> DateraResult<AppInstance> {
        self.call(Method::GET, &app_instance_path(name), None).await
    }

    async fn create_app_instance(&self, req: &AppInstanceCreate) -> DateraResult<AppInstance> {
        let body = Self::to_body(req)?;
        self.call(Method::POST, "/app_instances", Some(&body)).await
    }

    async fn set_admin_state(&self, name: &str, state: &str, force: bool) -> DateraResult<()> {
        let body = json!({ "admin_state": state, "force": force });
        self.send(Method::PUT, &app_instance_path(name), &[], Some(&body))
            .await
            .map(|_| ())
    }

    async fn delete_app_instance(&self, name: &str, force: bool) -> DateraResult<()> {
        let body = json!({ "force": force });
        self.send(Method::DELETE, &app_instance_path(name), &[], Some(&body))
            .await
            .map(|_| ())
    }

    async fn list_app_instances(
        &self,
        limit: usize,
        offset: usize,
    ) -> DateraResult<Vec<AppInstance>> {
        let mut query = vec![("offset", offset.to_string())];
        if limit > 0 {
            query.push(("limit", limit.to_string()));
        }
        let data = self
            .send(Method::GET, "/app_instances", &query, None)
            .await?;
        serde_json::from_value(data).add_context("failed to decode app instance list")
    }

    async fn get_metadata(&self, name: &str) -> DateraResult<Metadata> {
        let path = format!("{}/metadata", app_instance_path(name));
        self.call(Method::GET, &path, None).await
    }

    async fn set_metadata(&self, name: &str, metadata: &Metadata) -> DateraResult<Metadata> {
        let path = format!("{}/metadata", app_instance_path(name));
        let body = Self::to_body(metadata)?;
        self.call(Method::PUT, &path, Some(&body)).await
    }

    async fn set_volume_size(&self, name: &str, size: u64) -> DateraResult<()> {
        let body = json!({ "size": size });
        self.send(Method::PUT, &volume_path(name), &[], Some(&body))
            .await
            .map(|_| ())
    }

    async fn get_performance_policy(&self, name: &str) -> DateraResult<PerformancePolicy> {
        let path = format!("{}/performance_policy", volume_path(name));
        self.call(Method::GET, &path, None).await
    }

    async fn create_performance_policy(
        &self,
        name: &str,
        policy: &PerformancePolicy,
    ) -> DateraResult<PerformancePolicy> {
        let path = format!("{}/performance_policy", volume_path(name));
        let body = Self::to_body(policy)?;
        self.call(Method::POST, &path, Some(&body)).await
    }

    async fn list_snapshots(&self, name: &str) -> DateraResult<Vec<SnapshotResource>> {
        let path = format!("{}/snapshots", volume_path(name));
        self.call(Method::GET, &path, None).await
    }

    async fn create_snapshot(
        &self,
        name: &str,
        req: &SnapshotCreate,
    ) -> DateraResult<SnapshotResource> {
        let path = format!("{}/snapshots", volume_path(name));
        let body = Self::to_body(req)?;
        self.call(Method::POST, &path, Some(&body)).await
    }

    async fn get_snapshot(&self, name: &str, utc_ts: &str) -> DateraResult<SnapshotResource> {
        let path = format!("{}/snapshots/{utc_ts}", volume_path(name));
        self.call(Method::GET, &path, None).await
    }

    async fn delete_snapshot(&self, name: &str, utc_ts: &str) -> DateraResult<()> {
        let path = format!("{}/snapshots/{utc_ts}", volume_path(name));
        self.send(Method::DELETE, &path, &[], None).await.map(|_| ())
    }

    async fn get_acl_policy(&self, name: &str) -> DateraResult<AclPolicy> {
        let path = format!("{}/acl_policy", storage_instance_path(name));
        self.call(Method::GET, &path, None).await
    }

    async fn set_acl_policy(&self, name: &str, acl: &AclPolicy) -> DateraResult<AclPolicy> {
        let path = format!("{}/acl_policy", storage_instance_path(name));
        let body = Self::to_body(acl)?;
        self.call(Method::PUT, &path, Some(&body)).await
    }

    async fn get_initiator(&self, iqn: &str) -> DateraResult<Initiator> {
        self.call(Method::GET, &format!("/initiators/{iqn}"), None)
            .await
    }

    async fn create_initiator(
        &self,
        iqn: &str,
        name: &str,
        force: bool,
    ) -> DateraResult<Initiator> {
        let body = json!({ "id": iqn, "name": name, "force": force });
        self.call(Method::POST, "/initiators", Some(&body)).await
    }

    async fn get_ip_pool(&self, pool: &str) -> DateraResult<IpPool> {
        self.call(
            Method::GET,
            &format!("/access_network_ip_pools/{pool}"),
            None,
        )
        .await
    }

    async fn set_ip_pool(&self, name: &str, pool_path: &str) -> DateraResult<()> {
        let body = json!({ "ip_pool": { "path": pool_path } });
        self.send(Method::PUT, &storage_instance_path(name), &[], Some(&body))
            .await
            .map(|_| ())
    }

    async fn get_system(&self) -> DateraResult<System> {
        self.call(Method::GET, "/system", None).await
    }

    async fn upload_logs(&self, archive: &Path) -> DateraResult<()> {
        let content = tokio::fs::read(archive)
            .await
            .with_context(|| format!("failed to read log archive {}", archive.display()))?;
        let file_name = archive
            .file_name()
            .map_or_else(|| "logs.gz".to_owned(), |n| n.to_string_lossy().into_owned());
        let url = format!("{}/logs_upload", self.base_url);
        let key = self.api_key().await?;
        let form = Form::new()
            .text("ecosystem", LOG_ECOSYSTEM)
            .part("file", Part::bytes(content).file_name(file_name));
        let resp = self
            .client
            .put(url)
            .header(AUTH_HEADER, key)
            .header(TENANT_HEADER, &self.config.tenant)
            .multipart(form)
            .send()
            .await
            .add_context("failed to upload logs")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.bytes().await.add_context("failed to read upload response")?;
            return Err(Self::decode_api_error(status, &body).add_context("log upload failed"));
        }
        info!("uploaded log archive {}", archive.display());
        Ok(())
    }
}
