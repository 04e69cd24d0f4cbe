//! Pod-to-device attribution.
//!
//! After collection, every metric is matched against what the kubelet says it
//! handed to pods, and annotated with the owning pod, container, and
//! namespace. Attribution is best effort: no failure in here may abort a
//! scrape.

pub mod apiserver;
pub mod device_id;
pub mod dra;
pub mod labels;
pub mod podresources;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dcgm_client::DeviceInfo;
use log::{debug, warn};

use crate::config::{Config, GpuIdType};
use crate::error::ExporterError;
use crate::metrics::{Metric, MetricsByCounter};
use self::device_id::{parse_device_id, DeviceIdForm};
use self::dra::{MigInfo, ResourceSliceManager};
use self::labels::PodLabeler;
use self::podresources::{ListPodResourcesRequest, ListPodResourcesResponse, PodResourcesClient};

pub const DEFAULT_NVIDIA_RESOURCE_NAME: &str = "nvidia.com/gpu";
pub const MIG_RESOURCE_PREFIX: &str = "nvidia.com/mig-";

const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// One pod/container that owns (part of) a device, valid for one scrape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub container: String,
    pub vgpu: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// A resolved DRA claim allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicResourceInfo {
    pub claim_name: String,
    pub claim_namespace: String,
    pub driver_name: String,
    pub pool_name: String,
    pub device_name: String,
    pub mig: Option<MigInfo>,
}

pub struct PodMapper {
    gpu_id_type: GpuIdType,
    virtual_gpus: bool,
    dra: bool,
    dra_driver: String,
    pod_labels: bool,
    use_old_namespace: bool,
    resource_names: Vec<String>,
    socket: PathBuf,
    labeler: Option<Arc<dyn PodLabeler>>,
    slices: Option<Arc<dyn ResourceSliceManager>>,
}

impl PodMapper {
    pub fn from_config(config: &Config) -> Self {
        Self {
            gpu_id_type: config.kubernetes_gpu_id_type,
            virtual_gpus: config.kubernetes_virtual_gpus,
            dra: config.dra,
            dra_driver: config.dra_driver.clone(),
            pod_labels: config.kubernetes_pod_labels,
            use_old_namespace: config.use_old_namespace,
            resource_names: config.nvidia_resource_names.clone(),
            socket: config.pod_resources_socket.clone(),
            labeler: None,
            slices: None,
        }
    }

    pub fn with_labeler(mut self, labeler: Arc<dyn PodLabeler>) -> Self {
        self.labeler = Some(labeler);
        self
    }

    pub fn with_slice_manager(mut self, slices: Arc<dyn ResourceSliceManager>) -> Self {
        self.slices = Some(slices);
        self
    }

    pub fn name(&self) -> &'static str {
        "pod_mapper"
    }

    /// Query the kubelet and annotate `metrics` in place. A missing socket
    /// means "not on Kubernetes" and is skipped silently; everything else
    /// that fails is reported so the caller can log and move on.
    pub async fn process(
        &self,
        metrics: &mut MetricsByCounter,
        devices: &[DeviceInfo],
    ) -> Result<(), ExporterError> {
        if !self.socket.exists() {
            debug!("[podmap] {} not present, skipping", self.socket.display());
            return Ok(());
        }
        let mut client = PodResourcesClient::connect(&self.socket)
            .await
            .map_err(|e| ExporterError::Kubernetes(format!("kubelet dial: {e}")))?;
        let response = tokio::time::timeout(LIST_TIMEOUT, client.list(ListPodResourcesRequest {}))
            .await
            .map_err(|_| ExporterError::Kubernetes("kubelet list timed out".into()))?
            .map_err(|e| ExporterError::Kubernetes(format!("kubelet list: {e}")))?;
        self.annotate(&response, metrics, devices).await;
        Ok(())
    }

    /// Annotation core, independent of the kubelet transport.
    pub async fn annotate(
        &self,
        response: &ListPodResourcesResponse,
        metrics: &mut MetricsByCounter,
        devices: &[DeviceInfo],
    ) {
        if self.dra {
            self.annotate_dra(response, metrics).await;
            return;
        }

        let uuid_to_index: HashMap<&str, u32> =
            devices.iter().map(|d| (d.uuid.as_str(), d.index)).collect();
        let mut device_to_pods = self.device_to_pods(response, &uuid_to_index);
        self.fill_pod_labels(device_to_pods.values_mut().flatten())
            .await;

        if self.virtual_gpus {
            self.annotate_virtual(&device_to_pods, metrics);
        } else {
            self.annotate_plain(&device_to_pods, metrics);
        }
    }

    fn is_nvidia_resource(&self, name: &str) -> bool {
        name == DEFAULT_NVIDIA_RESOURCE_NAME
            || name.starts_with(MIG_RESOURCE_PREFIX)
            || self.resource_names.iter().any(|r| r == name)
    }

    /// Mapping key → owning pods, from the kubelet snapshot. A MIG device id
    /// registers under both the parent UUID and the index-instance composite
    /// when the parent is one of ours.
    fn device_to_pods(
        &self,
        response: &ListPodResourcesResponse,
        uuid_to_index: &HashMap<&str, u32>,
    ) -> HashMap<String, Vec<PodInfo>> {
        let mut map: HashMap<String, Vec<PodInfo>> = HashMap::new();
        for pod in &response.pod_resources {
            for container in &pod.containers {
                for device in &container.devices {
                    if !self.is_nvidia_resource(&device.resource_name) {
                        continue;
                    }
                    for raw_id in &device.device_ids {
                        let (keys, vgpu) = match parse_device_id(raw_id) {
                            DeviceIdForm::Mig {
                                parent_uuid,
                                gpu_instance_id,
                            } => {
                                let mut keys = vec![parent_uuid.clone()];
                                if let (Some(gi), Some(index)) =
                                    (gpu_instance_id, uuid_to_index.get(parent_uuid.as_str()))
                                {
                                    keys.push(format!("{index}-{gi}"));
                                }
                                (keys, None)
                            }
                            DeviceIdForm::GkeMig {
                                gpu_index,
                                instance_id,
                                vgpu,
                            } => (vec![format!("{gpu_index}-{instance_id}")], vgpu),
                            DeviceIdForm::TimeShared { id, vgpu } => (vec![id], Some(vgpu)),
                            DeviceIdForm::Replica { id, vgpu } => (vec![id], Some(vgpu)),
                            DeviceIdForm::Plain(id) => (vec![id], None),
                        };
                        let info = PodInfo {
                            name: pod.name.clone(),
                            namespace: pod.namespace.clone(),
                            container: container.name.clone(),
                            vgpu,
                            labels: BTreeMap::new(),
                        };
                        for key in keys {
                            map.entry(key).or_default().push(info.clone());
                        }
                    }
                }
            }
        }
        map
    }

    /// Fetch pod labels once per (namespace, name) per scrape. A fetch
    /// failure caches the empty result so the metric still goes out.
    async fn fill_pod_labels(&self, pods: impl Iterator<Item = &mut PodInfo>) {
        let labeler = match (&self.labeler, self.pod_labels) {
            (Some(labeler), true) => labeler,
            _ => return,
        };
        let mut cache: HashMap<String, BTreeMap<String, String>> = HashMap::new();
        for pod in pods {
            let key = format!("{}/{}", pod.namespace, pod.name);
            if !cache.contains_key(&key) {
                let labels = match labeler.pod_labels(&pod.namespace, &pod.name).await {
                    Ok(labels) => labels,
                    Err(err) => {
                        warn!("[podmap] label fetch for {key} failed: {err}");
                        BTreeMap::new()
                    }
                };
                cache.insert(key.clone(), labels);
            }
            pod.labels = cache[&key].clone();
        }
    }

    /// The key this metric is matched under, or `None` when the metric can
    /// never map (a partition without a usable instance id).
    fn metric_id(&self, metric: &Metric) -> Option<String> {
        if !metric.mig_profile.is_empty() {
            let instance_id: u32 = metric.gpu_instance_id.parse().ok()?;
            return match self.gpu_id_type {
                GpuIdType::Uid => Some(format!("{}-{}", metric.gpu_id, instance_id)),
                GpuIdType::DeviceName => Some(metric.gpu_device.clone()),
            };
        }
        match self.gpu_id_type {
            GpuIdType::Uid => Some(metric.gpu_uuid.clone()),
            GpuIdType::DeviceName => Some(metric.gpu_device.clone()),
        }
    }

    fn set_pod_attributes(&self, metric: &mut Metric, pod: &PodInfo) {
        let (pod_key, namespace_key, container_key) = if self.use_old_namespace {
            ("exported_pod", "exported_namespace", "exported_container")
        } else {
            ("pod", "namespace", "container")
        };
        metric
            .attributes
            .insert(pod_key.to_string(), pod.name.clone());
        metric
            .attributes
            .insert(namespace_key.to_string(), pod.namespace.clone());
        metric
            .attributes
            .insert(container_key.to_string(), pod.container.clone());
        for (k, v) in &pod.labels {
            metric.labels.insert(k.clone(), v.clone());
        }
    }

    /// 1:1 attribution. Unmatched metrics are left as they are.
    fn annotate_plain(
        &self,
        device_to_pods: &HashMap<String, Vec<PodInfo>>,
        metrics: &mut MetricsByCounter,
    ) {
        for (_, list) in metrics.iter_mut() {
            for metric in list.iter_mut() {
                let id = match self.metric_id(metric) {
                    Some(id) => id,
                    None => continue,
                };
                if let Some(pod) = device_to_pods.get(&id).and_then(|pods| pods.first()) {
                    self.set_pod_attributes(metric, pod);
                }
            }
        }
    }

    /// Time-shared attribution: one deep copy per owning pod; metrics with no
    /// owner are dropped.
    fn annotate_virtual(
        &self,
        device_to_pods: &HashMap<String, Vec<PodInfo>>,
        metrics: &mut MetricsByCounter,
    ) {
        for (_, list) in metrics.iter_mut() {
            let mut fanned_out = Vec::new();
            for metric in list.iter() {
                let id = match self.metric_id(metric) {
                    Some(id) => id,
                    None => continue,
                };
                let pods = match device_to_pods.get(&id) {
                    Some(pods) => pods,
                    None => continue,
                };
                for pod in pods {
                    let mut copy = metric.clone();
                    self.set_pod_attributes(&mut copy, pod);
                    if let Some(vgpu) = &pod.vgpu {
                        copy.attributes.insert("vgpu".to_string(), vgpu.clone());
                    }
                    fanned_out.push(copy);
                }
            }
            *list = fanned_out;
        }
    }

    /// DRA attribution: resolve every claim of our driver through the
    /// ResourceSlice view and fan matched metrics out per (device, pod,
    /// container). Claims the slices cannot resolve are skipped.
    async fn annotate_dra(&self, response: &ListPodResourcesResponse, metrics: &mut MetricsByCounter) {
        let slices = match &self.slices {
            Some(slices) => slices,
            None => return,
        };

        let mut by_uuid: HashMap<String, Vec<(PodInfo, DynamicResourceInfo)>> = HashMap::new();
        let mut seen: HashSet<(String, String, String, String)> = HashSet::new();
        for pod in &response.pod_resources {
            for container in &pod.containers {
                for claim in &container.dynamic_resources {
                    for resource in &claim.claim_resources {
                        if resource.driver_name != self.dra_driver {
                            continue;
                        }
                        let properties =
                            match slices.resolve(&resource.pool_name, &resource.device_name) {
                                Some(properties) => properties,
                                None => {
                                    debug!(
                                        "[podmap] no slice entry for {}/{}, skipping claim {}",
                                        resource.pool_name, resource.device_name, claim.claim_name
                                    );
                                    continue;
                                }
                            };
                        let dedupe_key = (
                            resource.pool_name.clone(),
                            resource.device_name.clone(),
                            pod.name.clone(),
                            container.name.clone(),
                        );
                        if !seen.insert(dedupe_key) {
                            continue;
                        }
                        by_uuid.entry(properties.uuid.clone()).or_default().push((
                            PodInfo {
                                name: pod.name.clone(),
                                namespace: pod.namespace.clone(),
                                container: container.name.clone(),
                                vgpu: None,
                                labels: BTreeMap::new(),
                            },
                            DynamicResourceInfo {
                                claim_name: claim.claim_name.clone(),
                                claim_namespace: claim.claim_namespace.clone(),
                                driver_name: resource.driver_name.clone(),
                                pool_name: resource.pool_name.clone(),
                                device_name: resource.device_name.clone(),
                                mig: properties.mig,
                            },
                        ));
                    }
                }
            }
        }

        self.fill_pod_labels(by_uuid.values_mut().flatten().map(|(pod, _)| pod))
            .await;

        for (_, list) in metrics.iter_mut() {
            let mut rewritten = Vec::new();
            for metric in list.iter() {
                let owners = by_uuid.get(&metric.gpu_uuid);
                match owners {
                    None => rewritten.push(metric.clone()),
                    Some(owners) => {
                        for (pod, resource) in owners {
                            let mut copy = metric.clone();
                            self.set_pod_attributes(&mut copy, pod);
                            let attrs = &mut copy.attributes;
                            attrs.insert("dra_claim_name".into(), resource.claim_name.clone());
                            attrs.insert(
                                "dra_claim_namespace".into(),
                                resource.claim_namespace.clone(),
                            );
                            attrs.insert("dra_driver_name".into(), resource.driver_name.clone());
                            attrs.insert("dra_pool_name".into(), resource.pool_name.clone());
                            attrs.insert("dra_device_name".into(), resource.device_name.clone());
                            if let Some(mig) = &resource.mig {
                                attrs.insert("dra_mig_profile".into(), mig.profile.clone());
                                attrs.insert(
                                    "dra_mig_device_uuid".into(),
                                    mig.device_uuid.clone(),
                                );
                            }
                            rewritten.push(copy);
                        }
                    }
                }
            }
            *list = rewritten;
        }
    }
}
