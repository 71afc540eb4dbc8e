//! Consul v1 HTTP API backend.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{
    Backend, HealthCheck, HealthFilter, Indexed, KvPair, QueryOptions, ServiceInstance,
    ServiceRegistration, SessionRequest,
};
use crate::common::{consul_duration, encode_key, ConsulConfig, Error, Result};

/// Header carrying the blocking-query index.
pub const INDEX_HEADER: &str = "X-Consul-Index";

/// Wrapper around the HTTP API of a local Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulHttp {
    client: Client,
    base_uri: String,
    request_timeout: Duration,
    node_name: OnceCell<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawKvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    modify_index: u64,
    #[serde(default)]
    lock_index: u64,
}

impl RawKvPair {
    fn decode(self) -> Result<KvPair> {
        let value = match self.value {
            Some(encoded) => BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| Error::RequestFailed(format!("invalid base64 in {}: {}", self.key, e)))?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: self.key,
            value,
            session: self.session.filter(|s| !s.is_empty()),
            modify_index: self.modify_index,
            lock_index: self.lock_index,
        })
    }
}

#[derive(Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct AgentSelf {
    #[serde(rename = "Member")]
    member: AgentMember,
}

#[derive(Deserialize)]
struct AgentMember {
    #[serde(rename = "Name")]
    name: String,
}

impl ConsulHttp {
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_uri: format!("{}/v1", config.addr.trim_end_matches('/')),
            request_timeout: config.request_timeout(),
            node_name: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_uri, path)
    }

    /// Attach the index cursor and bound the round trip. Consul may hold a
    /// blocking query for up to `wait + wait/16`.
    fn with_query(&self, request: RequestBuilder, opts: QueryOptions) -> RequestBuilder {
        match (opts.index, opts.wait) {
            (Some(index), wait) => {
                let wait = wait.unwrap_or(Duration::from_secs(300));
                request
                    .query(&[
                        ("index", index.to_string()),
                        ("wait", consul_duration(wait)),
                    ])
                    .timeout(wait + wait / 16 + self.request_timeout)
            }
            (None, _) => request.timeout(self.request_timeout),
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let request = request.build()?;
        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!("{} {}", method, url);

        let response = self.client.execute(request).await?;
        if !response.status().is_success() {
            return Err(Error::RequestFailed(format!(
                "{} on {}",
                response.status().as_u16(),
                url
            )));
        }
        Ok(response)
    }

    fn index_of(response: &Response) -> u64 {
        response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    async fn put_bool(&self, request: RequestBuilder) -> Result<bool> {
        let response = self.send(request).await?;
        let body = response.text().await?;
        Ok(body.trim() == "true")
    }
}

#[async_trait]
impl Backend for ConsulHttp {
    async fn node_name(&self) -> Result<String> {
        let name = self
            .node_name
            .get_or_try_init(|| async {
                let response = self.send(self.client.get(self.url("/agent/self"))).await?;
                let agent: AgentSelf = serde_json::from_slice(&response.bytes().await?)?;
                Ok::<_, Error>(agent.member.name)
            })
            .await?;
        Ok(name.clone())
    }

    async fn kv_get(&self, key: &str, opts: QueryOptions) -> Result<Indexed<Option<KvPair>>> {
        let url = self.url(&format!("/kv/{}", encode_key(key)));
        let request = self.with_query(self.client.get(url.as_str()), opts);
        let request = request.build()?;
        tracing::debug!("GET {}", request.url());

        let response = self.client.execute(request).await?;
        let index = Self::index_of(&response);
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Indexed { value: None, index }),
            status if status.is_success() => {
                let entries: Vec<RawKvPair> = serde_json::from_slice(&response.bytes().await?)?;
                let value = entries.into_iter().next().map(RawKvPair::decode).transpose()?;
                Ok(Indexed { value, index })
            }
            status => Err(Error::RequestFailed(format!("{} on {}", status.as_u16(), url))),
        }
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<bool> {
        let url = self.url(&format!("/kv/{}", encode_key(key)));
        self.put_bool(
            self.client
                .put(url)
                .timeout(self.request_timeout)
                .body(value.to_vec()),
        )
        .await
    }

    async fn kv_acquire(&self, key: &str, session: &str, value: &[u8]) -> Result<bool> {
        let url = self.url(&format!("/kv/{}", encode_key(key)));
        self.put_bool(
            self.client
                .put(url)
                .query(&[("acquire", session)])
                .timeout(self.request_timeout)
                .body(value.to_vec()),
        )
        .await
    }

    async fn kv_release(&self, key: &str, session: &str) -> Result<bool> {
        let url = self.url(&format!("/kv/{}", encode_key(key)));
        self.put_bool(
            self.client
                .put(url)
                .query(&[("release", session)])
                .timeout(self.request_timeout),
        )
        .await
    }

    async fn session_create(&self, request: &SessionRequest) -> Result<String> {
        let mut body = json!({
            "LockDelay": consul_duration(request.lock_delay),
            "Checks": request.checks,
            "Behavior": "release",
        });
        if let Some(name) = &request.name {
            body["Name"] = json!(name);
        }

        let response = self
            .send(
                self.client
                    .put(self.url("/session/create"))
                    .timeout(self.request_timeout)
                    .json(&body),
            )
            .await?;
        let created: SessionCreated = serde_json::from_slice(&response.bytes().await?)?;
        Ok(created.id)
    }

    async fn session_destroy(&self, id: &str) -> Result<()> {
        self.send(
            self.client
                .put(self.url(&format!("/session/destroy/{}", encode_key(id))))
                .timeout(self.request_timeout),
        )
        .await?;
        Ok(())
    }

    async fn health_service(
        &self,
        service: &str,
        filter: &HealthFilter,
        opts: QueryOptions,
    ) -> Result<Indexed<Vec<ServiceInstance>>> {
        let mut request = self
            .client
            .get(self.url(&format!("/health/service/{}", encode_key(service))));
        if filter.passing {
            request = request.query(&[("passing", "true")]);
        }
        if let Some(tag) = &filter.tag {
            request = request.query(&[("tag", tag.as_str())]);
        }

        let response = self.send(self.with_query(request, opts)).await?;
        let index = Self::index_of(&response);
        let value = serde_json::from_slice(&response.bytes().await?)?;
        Ok(Indexed { value, index })
    }

    async fn health_node(&self, node: &str, opts: QueryOptions) -> Result<Indexed<Vec<HealthCheck>>> {
        let request = self
            .client
            .get(self.url(&format!("/health/node/{}", encode_key(node))));

        let response = self.send(self.with_query(request, opts)).await?;
        let index = Self::index_of(&response);
        let value = serde_json::from_slice(&response.bytes().await?)?;
        Ok(Indexed { value, index })
    }

    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        self.send(
            self.client
                .put(self.url("/agent/service/register"))
                .timeout(self.request_timeout)
                .json(registration),
        )
        .await?;
        Ok(())
    }
}
