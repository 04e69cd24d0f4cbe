//! Watch lists: one per entity kind, owning the engine-side groups.
//!
//! A watch list is unarmed until `watch()` succeeds, after which it holds
//! live group handles and the cleanup closures that destroy them in LIFO
//! order. The transition is one-way until `cleanup()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dcgm_client::fields::{field_by_id, FieldId};
use dcgm_client::{DcgmClient, EntityKind, FieldGroupHandle, GroupHandle};
use log::{debug, warn};

use crate::counters::Counter;
use crate::devices::{MonitoringInfo, SystemInfo};
use crate::error::ExporterError;

static GROUP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Whether a hardware field can be shipped to a group of `kind` entities.
/// The engine's field namespace encodes this in the name.
pub fn field_applies_to(field_id: FieldId, kind: EntityKind) -> bool {
    let name = match field_by_id(field_id) {
        Some(meta) => meta.name,
        None => return false,
    };
    if name.starts_with("DCGM_FI_DEV_NVSWITCH_LINK_") {
        kind == EntityKind::Link
    } else if name.starts_with("DCGM_FI_DEV_NVSWITCH_") {
        kind == EntityKind::Switch
    } else if name.starts_with("DCGM_FI_DEV_CPU_") {
        kind == EntityKind::Cpu || kind == EntityKind::CpuCore
    } else {
        kind == EntityKind::Gpu || kind == EntityKind::GpuInstance
    }
}

/// The subset of `counters` applicable to `kind`, split into streamed device
/// fields and on-demand label fields.
pub fn split_fields_for_kind(counters: &[Counter], kind: EntityKind) -> (Vec<FieldId>, Vec<FieldId>) {
    let mut device_fields = Vec::new();
    let mut label_fields = Vec::new();
    for counter in counters {
        if !field_applies_to(counter.field_id, kind) {
            continue;
        }
        let bucket = if counter.is_label() {
            &mut label_fields
        } else {
            &mut device_fields
        };
        if !bucket.contains(&counter.field_id) {
            bucket.push(counter.field_id);
        }
    }
    (device_fields, label_fields)
}

type Cleanup = Box<dyn FnOnce() + Send + Sync>;

pub struct WatchList {
    kind: EntityKind,
    client: Arc<dyn DcgmClient>,
    monitored: Vec<MonitoringInfo>,
    device_fields: Vec<FieldId>,
    label_fields: Vec<FieldId>,
    collect_interval_ms: u64,
    groups: Vec<GroupHandle>,
    field_group: Option<FieldGroupHandle>,
    cleanups: Vec<Cleanup>,
    armed: bool,
}

impl WatchList {
    pub fn new(
        client: Arc<dyn DcgmClient>,
        kind: EntityKind,
        system: &SystemInfo,
        counters: &[Counter],
        collect_interval_ms: u64,
    ) -> Self {
        let (device_fields, label_fields) = split_fields_for_kind(counters, kind);
        Self {
            kind,
            client,
            monitored: system.monitored(kind),
            device_fields,
            label_fields,
            collect_interval_ms,
            groups: Vec::new(),
            field_group: None,
            cleanups: Vec::new(),
            armed: false,
        }
    }

    /// A watch list over an explicit field set, for collectors that stream a
    /// single engine field rather than a catalogue subset.
    pub fn for_fields(
        client: Arc<dyn DcgmClient>,
        kind: EntityKind,
        system: &SystemInfo,
        device_fields: Vec<FieldId>,
        collect_interval_ms: u64,
    ) -> Self {
        Self {
            kind,
            client,
            monitored: system.monitored(kind),
            device_fields,
            label_fields: Vec::new(),
            collect_interval_ms,
            groups: Vec::new(),
            field_group: None,
            cleanups: Vec::new(),
            armed: false,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn monitored(&self) -> &[MonitoringInfo] {
        &self.monitored
    }

    pub fn device_fields(&self) -> &[FieldId] {
        &self.device_fields
    }

    pub fn label_fields(&self) -> &[FieldId] {
        &self.label_fields
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn groups(&self) -> &[GroupHandle] {
        &self.groups
    }

    pub fn field_group(&self) -> Option<FieldGroupHandle> {
        self.field_group
    }

    /// Register the device group, field group, and periodic watch with the
    /// engine. With nothing to monitor the list simply stays unarmed. On
    /// failure every already-created handle is destroyed before returning.
    pub fn watch(&mut self) -> Result<(), ExporterError> {
        debug_assert!(!self.armed, "watch() called on an armed watch list");
        if self.armed {
            return Ok(());
        }
        if self.monitored.is_empty() || self.device_fields.is_empty() {
            debug!(
                "[watcher] nothing to watch for {} (entities={}, fields={})",
                self.kind,
                self.monitored.len(),
                self.device_fields.len()
            );
            return Ok(());
        }

        match self.arm() {
            Ok(()) => {
                self.armed = true;
                Ok(())
            }
            Err(err) => {
                self.run_cleanups();
                self.groups.clear();
                self.field_group = None;
                Err(err)
            }
        }
    }

    fn arm(&mut self) -> Result<(), ExporterError> {
        let seq = GROUP_SEQ.fetch_add(1, Ordering::Relaxed);
        let group = self
            .client
            .create_group(&format!("dcgm-exporter-{}-{}", self.kind, seq))?;
        self.groups.push(group);
        self.push_group_cleanup(group);

        for info in &self.monitored {
            match (info.entity.kind, info.parent_id) {
                (EntityKind::Link, Some(parent)) => {
                    self.client.add_link_to_group(group, parent, info.entity.id)?
                }
                _ => self.client.add_entity_to_group(group, info.entity)?,
            }
        }

        let field_group = self.client.create_field_group(
            &format!("dcgm-exporter-fields-{}-{}", self.kind, seq),
            &self.device_fields,
        )?;
        self.field_group = Some(field_group);
        self.push_field_group_cleanup(field_group);

        // Keep only the freshest sample engine-side; the exporter re-reads
        // on every scrape.
        self.client.watch_fields_with_group(
            field_group,
            group,
            (self.collect_interval_ms as i64) * 1000,
            0.0,
            1,
        )?;
        debug!(
            "[watcher] armed {} watch list: {} entities, {} fields",
            self.kind,
            self.monitored.len(),
            self.device_fields.len()
        );
        Ok(())
    }

    fn push_group_cleanup(&mut self, group: GroupHandle) {
        let client = Arc::clone(&self.client);
        self.cleanups.push(Box::new(move || {
            if let Err(err) = client.destroy_group(group) {
                warn!("[watcher] failed to destroy group {group:?}: {err}");
            }
        }));
    }

    fn push_field_group_cleanup(&mut self, field_group: FieldGroupHandle) {
        let client = Arc::clone(&self.client);
        self.cleanups.push(Box::new(move || {
            if let Err(err) = client.destroy_field_group(field_group) {
                warn!("[watcher] failed to destroy field group {field_group:?}: {err}");
            }
        }));
    }

    fn run_cleanups(&mut self) {
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
    }

    /// Destroy engine-side handles. Safe to call any number of times.
    pub fn cleanup(&mut self) {
        self.run_cleanups();
        self.groups.clear();
        self.field_group = None;
        self.armed = false;
    }
}

impl Drop for WatchList {
    fn drop(&mut self) {
        self.run_cleanups();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceOptions;
    use crate::counters::{Counter, PromType};
    use dcgm_client::mock::MockDcgm;

    fn counter(field_id: FieldId, name: &str, prom_type: PromType) -> Counter {
        Counter {
            field_id,
            field_name: name.to_string(),
            prom_type,
            help: String::new(),
        }
    }

    fn gpu_counters() -> Vec<Counter> {
        vec![
            counter(150, "DCGM_FI_DEV_GPU_TEMP", PromType::Gauge),
            counter(1, "DCGM_FI_DRIVER_VERSION", PromType::Label),
            counter(711, "DCGM_FI_DEV_NVSWITCH_THROUGHPUT_TX", PromType::Counter),
        ]
    }

    #[test]
    fn fields_route_to_their_entity_kind() {
        assert!(field_applies_to(150, EntityKind::Gpu));
        assert!(field_applies_to(150, EntityKind::GpuInstance));
        assert!(!field_applies_to(150, EntityKind::Switch));

        assert!(field_applies_to(711, EntityKind::Switch));
        assert!(!field_applies_to(711, EntityKind::Link));

        assert!(field_applies_to(780, EntityKind::Link));
        assert!(!field_applies_to(780, EntityKind::Switch));

        assert!(field_applies_to(1132, EntityKind::Cpu));
        assert!(field_applies_to(1132, EntityKind::CpuCore));
        assert!(!field_applies_to(1132, EntityKind::Gpu));
    }

    #[test]
    fn split_keeps_labels_apart_from_device_fields() {
        let (device, labels) = split_fields_for_kind(&gpu_counters(), EntityKind::Gpu);
        assert_eq!(device, vec![150]);
        assert_eq!(labels, vec![1]);

        let (device, labels) = split_fields_for_kind(&gpu_counters(), EntityKind::Switch);
        assert_eq!(device, vec![711]);
        assert!(labels.is_empty());
    }

    fn one_gpu_system(mock: &MockDcgm) -> SystemInfo {
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        SystemInfo::initialize(mock, EntityKind::Gpu, DeviceOptions::Flex).unwrap()
    }

    #[test]
    fn watch_arms_and_registers_the_periodic_watch() {
        let mock = std::sync::Arc::new(MockDcgm::new());
        let system = one_gpu_system(&mock);
        let mut list = WatchList::new(mock.clone(), EntityKind::Gpu, &system, &gpu_counters(), 30_000);

        assert!(!list.is_armed());
        list.watch().unwrap();
        assert!(list.is_armed());
        assert_eq!(list.groups().len(), 1);
        assert!(list.field_group().is_some());

        let watches = mock.watch_calls();
        assert_eq!(watches.len(), 1);
        assert_eq!(watches[0].update_interval_us, 30_000_000);
        assert_eq!(watches[0].max_keep_age_secs, 0.0);
        assert_eq!(watches[0].max_keep_samples, 1);
    }

    #[test]
    fn empty_watch_list_stays_unarmed_without_error() {
        let mock = std::sync::Arc::new(MockDcgm::new());
        let system = SystemInfo::initialize(&*mock, EntityKind::Gpu, DeviceOptions::all()).unwrap();
        let mut list = WatchList::new(mock.clone(), EntityKind::Gpu, &system, &gpu_counters(), 1000);
        list.watch().unwrap();
        assert!(!list.is_armed());
        assert_eq!(mock.live_groups(), 0);
    }

    #[test]
    fn watch_failure_rolls_back_handles_created_so_far() {
        let mock = std::sync::Arc::new(MockDcgm::new());
        let system = one_gpu_system(&mock);
        let mut list = WatchList::new(mock.clone(), EntityKind::Gpu, &system, &gpu_counters(), 1000);

        mock.fail_field_group_create();
        assert!(list.watch().is_err());
        assert!(!list.is_armed());
        // The device group created before the failure was destroyed again.
        assert_eq!(mock.live_groups(), 0);
        assert_eq!(mock.live_field_groups(), 0);
    }

    #[test]
    fn cleanup_destroys_handles_in_lifo_order_and_is_idempotent() {
        let mock = std::sync::Arc::new(MockDcgm::new());
        let system = one_gpu_system(&mock);
        let mut list = WatchList::new(mock.clone(), EntityKind::Gpu, &system, &gpu_counters(), 1000);
        list.watch().unwrap();

        let group = list.groups()[0];
        let field_group = list.field_group().unwrap();
        list.cleanup();
        list.cleanup();

        assert_eq!(mock.live_groups(), 0);
        assert_eq!(mock.live_field_groups(), 0);
        assert_eq!(
            mock.destroy_order(),
            vec![
                format!("field_group:{}", field_group.0),
                format!("group:{}", group.0),
            ]
        );
        assert!(!list.is_armed());
    }
}
