//! Minimal in-cluster API server client.
//!
//! Built from the service-account environment the kubelet mounts into every
//! pod; absent that environment there is no API access and callers fall back
//! to unenriched behavior.

use std::collections::BTreeMap;

use log::debug;
use reqwest::Client;
use serde::Deserialize;

use crate::error::ExporterError;

pub struct ApiClient {
    client: Client,
    api_url: String,
    token: String,
}

impl ApiClient {
    pub fn from_cluster_env() -> Option<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").ok()?;
        let api_url = format!("https://{host}:{port}");

        let token =
            std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/token").ok()?;
        let ca_cert = std::fs::read("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt").ok()?;

        let client = Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca_cert).ok()?)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .ok()?;

        debug!("[apiserver] using in-cluster endpoint {api_url}");
        Some(Self {
            client,
            api_url,
            token,
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ExporterError> {
        let url = format!("{}{}", self.api_url, path);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| ExporterError::Kubernetes(format!("GET {path}: {e}")))?;
        if !resp.status().is_success() {
            return Err(ExporterError::Kubernetes(format!(
                "GET {path}: {}",
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ExporterError::Kubernetes(format!("decode {path}: {e}")))
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ExporterError> {
        self.get(&format!("/api/v1/namespaces/{namespace}/pods/{name}"))
            .await
    }

    pub async fn get_configmap(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMap, ExporterError> {
        self.get(&format!("/api/v1/namespaces/{namespace}/configmaps/{name}"))
            .await
    }

    pub async fn list_resource_slices(&self) -> Result<ResourceSliceList, ExporterError> {
        self.get("/apis/resource.k8s.io/v1beta1/resourceslices").await
    }
}

#[derive(Debug, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

#[derive(Debug, Default, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigMap {
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceSliceList {
    #[serde(default)]
    pub items: Vec<ResourceSlice>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceSlice {
    pub spec: ResourceSliceSpec,
}

#[derive(Debug, Deserialize)]
pub struct ResourceSliceSpec {
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub pool: ResourcePool,
    #[serde(default)]
    pub devices: Vec<SliceDevice>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResourcePool {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SliceDevice {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub basic: Option<BasicDevice>,
}

#[derive(Debug, Deserialize)]
pub struct BasicDevice {
    #[serde(default)]
    pub attributes: BTreeMap<String, DeviceAttribute>,
}

/// One-of attribute value as published in a ResourceSlice.
#[derive(Debug, Deserialize)]
pub struct DeviceAttribute {
    #[serde(default)]
    pub string: Option<String>,
    #[serde(default)]
    pub int: Option<i64>,
    #[serde(default)]
    pub bool: Option<bool>,
}

impl DeviceAttribute {
    pub fn as_str(&self) -> Option<&str> {
        self.string.as_deref()
    }
}
