//! DigitalOcean cloud provider
//!
//! Thin client over the droplet, region and size endpoints of the v2 API.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use bf_core::config::DigitalOceanConfig;
use bf_core::error::{CloudError, ConfigError};
use bf_core::traits::{CloudProvider, Instance, InstanceSpec, InstanceStatus, Region, Size};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`CloudProvider`] backed by the DigitalOcean API
pub struct DigitalOceanProvider {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl DigitalOceanProvider {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Build from config, reading the token from the configured variable
    pub fn from_config(config: &DigitalOceanConfig) -> Result<Self, ConfigError> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            ConfigError::Invalid(format!("{} is not set", config.token_env))
        })?;
        Self::new(config.api_base.clone(), token).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/{}", self.api_base, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, CloudError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        tracing::warn!(status = %status, message = %message, "DigitalOcean request failed");

        if status == reqwest::StatusCode::NOT_FOUND {
            Err(CloudError::NotFound(message))
        } else {
            Err(CloudError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CloudError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| CloudError::Decode(e.to_string()))
    }
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Serialize)]
struct CreateDroplet<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
    tags: &'a [String],
}

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct Droplet {
    id: u64,
    status: InstanceStatus,
    #[serde(default)]
    networks: Networks,
}

#[derive(Deserialize, Default)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl From<Droplet> for Instance {
    fn from(droplet: Droplet) -> Self {
        Instance {
            id: droplet.id.to_string(),
            status: droplet.status,
            public_ipv4: droplet
                .networks
                .v4
                .into_iter()
                .filter(|n| n.kind == "public")
                .map(|n| n.ip_address)
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct RegionList {
    regions: Vec<DoRegion>,
}

#[derive(Deserialize)]
struct DoRegion {
    slug: String,
    name: String,
    available: bool,
    #[serde(default)]
    sizes: Vec<String>,
}

#[derive(Deserialize)]
struct SizeList {
    sizes: Vec<DoSize>,
}

#[derive(Deserialize)]
struct DoSize {
    slug: String,
    memory: u64,
    vcpus: u32,
    price_monthly: f64,
    available: bool,
    #[serde(default)]
    regions: Vec<String>,
    #[serde(default)]
    gpu_info: Option<serde_json::Value>,
}

impl From<DoSize> for Size {
    fn from(size: DoSize) -> Self {
        let gpu = size.gpu_info.is_some() || size.slug.starts_with("gpu-");
        Size {
            slug: size.slug,
            memory_mb: size.memory,
            vcpus: size.vcpus,
            price_monthly: size.price_monthly,
            available: size.available,
            regions: size.regions,
            gpu,
        }
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    async fn create(&self, spec: &InstanceSpec) -> Result<Instance, CloudError> {
        let body = CreateDroplet {
            name: &spec.name,
            region: &spec.region,
            size: &spec.size,
            image: &spec.image,
            user_data: spec.user_data.as_deref(),
            tags: &spec.tags,
        };
        let response = self
            .send(self.client.post(self.url("droplets")).json(&body))
            .await?;
        let envelope: DropletEnvelope = Self::json(response).await?;
        tracing::info!(droplet_id = envelope.droplet.id, name = %spec.name, "Created droplet");
        Ok(envelope.droplet.into())
    }

    async fn get(&self, id: &str) -> Result<Instance, CloudError> {
        let response = self
            .send(self.client.get(self.url(&format!("droplets/{}", id))))
            .await?;
        let envelope: DropletEnvelope = Self::json(response).await?;
        Ok(envelope.droplet.into())
    }

    async fn delete(&self, id: &str) -> Result<(), CloudError> {
        self.send(self.client.delete(self.url(&format!("droplets/{}", id))))
            .await?;
        tracing::info!(droplet_id = %id, "Deleted droplet");
        Ok(())
    }

    async fn list_regions(&self) -> Result<Vec<Region>, CloudError> {
        let response = self
            .send(self.client.get(self.url("regions")).query(&[("per_page", "200")]))
            .await?;
        let list: RegionList = Self::json(response).await?;
        Ok(list
            .regions
            .into_iter()
            .map(|r| Region {
                slug: r.slug,
                name: r.name,
                available: r.available,
                sizes: r.sizes,
            })
            .collect())
    }

    async fn list_sizes(&self) -> Result<Vec<Size>, CloudError> {
        let response = self
            .send(self.client.get(self.url("sizes")).query(&[("per_page", "200")]))
            .await?;
        let list: SizeList = Self::json(response).await?;
        Ok(list.sizes.into_iter().map(Size::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_droplet_keeps_public_addresses_only() {
        let droplet: Droplet = serde_json::from_str(
            r#"{
                "id": 42,
                "status": "active",
                "networks": {"v4": [
                    {"ip_address": "10.10.0.2", "type": "private"},
                    {"ip_address": "203.0.113.9", "type": "public"}
                ]}
            }"#,
        )
        .unwrap();

        let instance = Instance::from(droplet);
        assert_eq!(instance.id, "42");
        assert_eq!(instance.status, InstanceStatus::Active);
        assert_eq!(instance.public_address(), Some("203.0.113.9"));
    }

    #[test]
    fn test_new_droplet_without_networks() {
        let droplet: Droplet = serde_json::from_str(r#"{"id": 7, "status": "new"}"#).unwrap();
        assert_eq!(Instance::from(droplet).public_address(), None);
    }

    #[test]
    fn test_gpu_size_detection() {
        let sizes: SizeList = serde_json::from_str(
            r#"{"sizes": [
                {"slug": "s-2vcpu-4gb", "memory": 4096, "vcpus": 2, "price_monthly": 24.0, "available": true},
                {"slug": "gpu-h100x1-80gb", "memory": 245760, "vcpus": 20, "price_monthly": 2534.4, "available": true},
                {"slug": "x-accel", "memory": 8192, "vcpus": 4, "price_monthly": 99.0, "available": true,
                 "gpu_info": {"count": 1, "model": "l40s"}}
            ]}"#,
        )
        .unwrap();

        let gpu: Vec<bool> = sizes.sizes.into_iter().map(|s| Size::from(s).gpu).collect();
        assert_eq!(gpu, vec![false, true, true]);
    }

    #[test]
    fn test_from_config_requires_token() {
        let config = DigitalOceanConfig {
            api_base: "http://localhost".to_string(),
            token_env: "BOTFLEET_TEST_TOKEN_THAT_IS_NEVER_SET".to_string(),
        };
        let err = DigitalOceanProvider::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("BOTFLEET_TEST_TOKEN_THAT_IS_NEVER_SET"));
    }
}
