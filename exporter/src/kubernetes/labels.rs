//! Pod label enrichment.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::ExporterError;
use crate::kubernetes::apiserver::ApiClient;

/// Source of a pod's labels, keyed by namespace and name.
#[async_trait]
pub trait PodLabeler: Send + Sync {
    async fn pod_labels(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ExporterError>;
}

pub struct ApiServerLabeler {
    api: ApiClient,
}

impl ApiServerLabeler {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl PodLabeler for ApiServerLabeler {
    async fn pod_labels(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ExporterError> {
        let pod = self.api.get_pod(namespace, name).await?;
        Ok(pod
            .metadata
            .labels
            .into_iter()
            .map(|(k, v)| (sanitize_label_name(&k), v))
            .collect())
    }
}

/// Rewrite a Kubernetes label key into the exposition charset
/// `[A-Za-z_][A-Za-z0-9_]*`.
pub fn sanitize_label_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, c) in name.chars().enumerate() {
        let ok = c == '_'
            || c.is_ascii_alphabetic()
            || (i > 0 && c.is_ascii_digit());
        out.push(if ok { c } else { '_' });
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
