//! Dynamic Resource Allocation: resolving claim devices to GPUs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, warn};
use tokio::time::sleep;

use crate::error::ExporterError;
use crate::kubernetes::apiserver::ApiClient;

/// MIG placement of a DRA device, when the driver published one.
#[derive(Debug, Clone, PartialEq)]
pub struct MigInfo {
    pub profile: String,
    pub device_uuid: String,
}

/// What a (pool, device) pair resolves to: the metric mapping key (a GPU
/// UUID, or the parent UUID for MIG) and optional MIG placement.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProperties {
    pub uuid: String,
    pub mig: Option<MigInfo>,
}

/// View over the cluster's ResourceSlices for one driver.
pub trait ResourceSliceManager: Send + Sync {
    fn resolve(&self, pool: &str, device: &str) -> Option<DeviceProperties>;
}

/// ResourceSlice watcher backed by the API server. The map refreshes in the
/// background; readers always see the last good snapshot.
pub struct ApiResourceSliceManager {
    api: ApiClient,
    driver: String,
    devices: RwLock<HashMap<(String, String), DeviceProperties>>,
}

impl ApiResourceSliceManager {
    pub fn new(api: ApiClient, driver: String) -> Arc<Self> {
        Arc::new(Self {
            api,
            driver,
            devices: RwLock::new(HashMap::new()),
        })
    }

    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                if let Err(err) = self.refresh().await {
                    warn!("[dra] failed to refresh resource slices: {err}");
                }
                sleep(Duration::from_secs(30)).await;
            }
        });
    }

    pub async fn refresh(&self) -> Result<(), ExporterError> {
        let slices = self.api.list_resource_slices().await?;
        let mut map = HashMap::new();
        for slice in slices.items {
            if slice.spec.driver != self.driver {
                continue;
            }
            let pool = slice.spec.pool.name.clone();
            for device in slice.spec.devices {
                let attributes = match &device.basic {
                    Some(basic) => &basic.attributes,
                    None => continue,
                };
                let uuid = attributes.get("uuid").and_then(|a| a.as_str());
                let uuid = match uuid {
                    Some(uuid) => uuid.to_string(),
                    None => continue,
                };
                let is_mig = attributes
                    .get("type")
                    .and_then(|a| a.as_str())
                    .map(|t| t == "mig")
                    .unwrap_or(false);
                let properties = if is_mig {
                    let parent = attributes
                        .get("parentUuid")
                        .and_then(|a| a.as_str())
                        .unwrap_or(&uuid)
                        .to_string();
                    DeviceProperties {
                        uuid: parent,
                        mig: Some(MigInfo {
                            profile: attributes
                                .get("profile")
                                .and_then(|a| a.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            device_uuid: uuid,
                        }),
                    }
                } else {
                    DeviceProperties { uuid, mig: None }
                };
                map.insert((pool.clone(), device.name), properties);
            }
        }
        debug!("[dra] tracking {} slice device(s)", map.len());
        *self.devices.write().unwrap() = map;
        Ok(())
    }
}

impl ResourceSliceManager for ApiResourceSliceManager {
    fn resolve(&self, pool: &str, device: &str) -> Option<DeviceProperties> {
        self.devices
            .read()
            .unwrap()
            .get(&(pool.to_string(), device.to_string()))
            .cloned()
    }
}

/// Fixed mapping for tests and single-node development.
#[derive(Default)]
pub struct StaticResourceSliceManager {
    devices: HashMap<(String, String), DeviceProperties>,
}

impl StaticResourceSliceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pool: &str, device: &str, properties: DeviceProperties) {
        self.devices
            .insert((pool.to_string(), device.to_string()), properties);
    }
}

impl ResourceSliceManager for StaticResourceSliceManager {
    fn resolve(&self, pool: &str, device: &str) -> Option<DeviceProperties> {
        self.devices
            .get(&(pool.to_string(), device.to_string()))
            .cloned()
    }
}
