//! Device enumeration and device-option resolution.
//!
//! One `SystemInfo` is built per entity family (GPUs, switches, CPUs) at
//! startup. It owns the enumerated topology and answers which entities a
//! watch list should monitor, flattened into `MonitoringInfo` records.

use dcgm_client::{
    CpuInfo, DcgmClient, DeviceInfo, Entity, EntityId, EntityKind, GpuInstanceInfo, LinkState,
    SwitchInfo,
};
use log::info;

use crate::config::DeviceOptions;
use crate::error::{ConfigError, ExporterError};

/// A monitorable entity joined with the hardware it lives on. For GPU
/// partitions `device` is the parent GPU; for switches, links, CPUs, and
/// cores there is no GPU identity block.
#[derive(Debug, Clone)]
pub struct MonitoringInfo {
    pub entity: Entity,
    pub device: Option<DeviceInfo>,
    pub instance: Option<GpuInstanceInfo>,
    pub parent_id: Option<EntityId>,
}

impl MonitoringInfo {
    pub(crate) fn gpu(device: &DeviceInfo) -> Self {
        Self {
            entity: Entity::new(EntityKind::Gpu, device.index),
            device: Some(device.clone()),
            instance: None,
            parent_id: None,
        }
    }

    fn gpu_instance(device: &DeviceInfo, instance: &GpuInstanceInfo) -> Self {
        Self {
            entity: Entity::new(EntityKind::GpuInstance, instance.entity_id),
            device: Some(device.clone()),
            instance: Some(instance.clone()),
            parent_id: Some(device.index),
        }
    }

    fn bare(kind: EntityKind, id: EntityId, parent_id: Option<EntityId>) -> Self {
        Self {
            entity: Entity::new(kind, id),
            device: None,
            instance: None,
            parent_id,
        }
    }
}

/// Enumerated topology of one entity family plus the operator's selection.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    family: EntityKind,
    options: DeviceOptions,
    gpus: Vec<DeviceInfo>,
    switches: Vec<SwitchInfo>,
    cpus: Vec<CpuInfo>,
}

impl SystemInfo {
    /// Enumerate `family` devices and verify the options against what is
    /// present. Enumeration failure is fatal to startup.
    pub fn initialize(
        client: &dyn DcgmClient,
        family: EntityKind,
        options: DeviceOptions,
    ) -> Result<Self, ExporterError> {
        let mut info = SystemInfo {
            family,
            options,
            gpus: Vec::new(),
            switches: Vec::new(),
            cpus: Vec::new(),
        };
        match family {
            EntityKind::Gpu => {
                info.gpus = client.enumerate_gpus()?;
                info.gpus.sort_by_key(|g| g.index);
                info!("[devices] found {} GPU(s)", info.gpus.len());
            }
            EntityKind::Switch => {
                info.switches = client.enumerate_switches()?;
                info.switches.sort_by_key(|s| s.entity_id);
                info!("[devices] found {} NVSwitch(es)", info.switches.len());
            }
            EntityKind::Cpu => {
                info.cpus = client.enumerate_cpus()?;
                info.cpus.sort_by_key(|c| c.entity_id);
                info!("[devices] found {} CPU(s)", info.cpus.len());
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "{other} is not an enumerable device family"
                ))
                .into())
            }
        }
        info.verify_options()?;
        Ok(info)
    }

    pub fn family(&self) -> EntityKind {
        self.family
    }

    pub fn gpus(&self) -> &[DeviceInfo] {
        &self.gpus
    }

    fn verify_options(&self) -> Result<(), ConfigError> {
        let (major, minor) = match &self.options {
            DeviceOptions::Flex => return Ok(()),
            DeviceOptions::Ranged { major, minor } => (major, minor),
        };

        let (majors, minors): (Vec<EntityId>, Vec<EntityId>) = match self.family {
            EntityKind::Gpu => (
                self.gpus.iter().map(|g| g.index).collect(),
                self.gpus
                    .iter()
                    .flat_map(|g| g.instances.iter().map(|i| i.nvml_instance_id))
                    .collect(),
            ),
            EntityKind::Switch => (
                self.switches.iter().map(|s| s.entity_id).collect(),
                self.switches
                    .iter()
                    .flat_map(|s| s.links.iter().map(|l| l.entity_id))
                    .collect(),
            ),
            EntityKind::Cpu => (
                self.cpus.iter().map(|c| c.entity_id).collect(),
                self.cpus.iter().flat_map(|c| c.cores.iter().copied()).collect(),
            ),
            _ => (Vec::new(), Vec::new()),
        };

        if let Some(wanted) = major {
            for id in wanted {
                if !majors.contains(id) {
                    return Err(ConfigError::Invalid(format!(
                        "{} {} requested for monitoring but not present",
                        self.family, id
                    )));
                }
            }
        }
        if let Some(wanted) = minor {
            for id in wanted {
                if !minors.contains(id) {
                    return Err(ConfigError::Invalid(format!(
                        "{} child {} requested for monitoring but not present",
                        self.family, id
                    )));
                }
            }
        }
        Ok(())
    }

    /// The entities a watch list of `kind` should monitor, in stable order:
    /// GPUs ascending index then partitions ascending entity id; switches,
    /// links, CPUs, and cores each ascending id.
    pub fn monitored(&self, kind: EntityKind) -> Vec<MonitoringInfo> {
        match kind {
            EntityKind::Gpu | EntityKind::GpuInstance => self.monitored_gpus(),
            EntityKind::Switch => self.monitored_switches(),
            EntityKind::Link => self.monitored_links(),
            EntityKind::Cpu => self.monitored_cpus(),
            EntityKind::CpuCore => self.monitored_cores(),
        }
    }

    fn monitored_gpus(&self) -> Vec<MonitoringInfo> {
        let mut out = Vec::new();
        match &self.options {
            DeviceOptions::Flex => {
                // A partitioned GPU is monitored through its partitions,
                // never both levels at once.
                for gpu in &self.gpus {
                    if gpu.instances.is_empty() {
                        out.push(MonitoringInfo::gpu(gpu));
                    }
                }
                out.extend(self.instances_sorted(|_| true));
            }
            DeviceOptions::Ranged { major, minor } => {
                for gpu in &self.gpus {
                    if matches(major, gpu.index) {
                        out.push(MonitoringInfo::gpu(gpu));
                    }
                }
                out.extend(self.instances_sorted(|i| matches(minor, i.nvml_instance_id)));
            }
        }
        out
    }

    fn instances_sorted(&self, keep: impl Fn(&GpuInstanceInfo) -> bool) -> Vec<MonitoringInfo> {
        let mut selected: Vec<(&DeviceInfo, &GpuInstanceInfo)> = self
            .gpus
            .iter()
            .flat_map(|g| g.instances.iter().map(move |i| (g, i)))
            .filter(|(_, i)| keep(i))
            .collect();
        selected.sort_by_key(|(_, i)| i.entity_id);
        selected
            .into_iter()
            .map(|(g, i)| MonitoringInfo::gpu_instance(g, i))
            .collect()
    }

    fn monitored_switches(&self) -> Vec<MonitoringInfo> {
        let major = self.major_filter();
        self.switches
            .iter()
            .filter(|s| matches(&major, s.entity_id))
            .map(|s| MonitoringInfo::bare(EntityKind::Switch, s.entity_id, None))
            .collect()
    }

    fn monitored_links(&self) -> Vec<MonitoringInfo> {
        let major = self.major_filter();
        let minor = self.minor_filter();
        let mut out = Vec::new();
        for switch in &self.switches {
            if !matches(&major, switch.entity_id) {
                continue;
            }
            for link in &switch.links {
                // Only up links can be sampled.
                if link.state != LinkState::Up {
                    continue;
                }
                if matches(&minor, link.entity_id) {
                    out.push(MonitoringInfo::bare(
                        EntityKind::Link,
                        link.entity_id,
                        Some(switch.entity_id),
                    ));
                }
            }
        }
        out
    }

    fn monitored_cpus(&self) -> Vec<MonitoringInfo> {
        let major = self.major_filter();
        self.cpus
            .iter()
            .filter(|c| matches(&major, c.entity_id))
            .map(|c| MonitoringInfo::bare(EntityKind::Cpu, c.entity_id, None))
            .collect()
    }

    fn monitored_cores(&self) -> Vec<MonitoringInfo> {
        let major = self.major_filter();
        let minor = self.minor_filter();
        let mut out = Vec::new();
        for cpu in &self.cpus {
            if !matches(&major, cpu.entity_id) {
                continue;
            }
            for core in &cpu.cores {
                if matches(&minor, *core) {
                    out.push(MonitoringInfo::bare(
                        EntityKind::CpuCore,
                        *core,
                        Some(cpu.entity_id),
                    ));
                }
            }
        }
        out
    }

    fn major_filter(&self) -> Option<Vec<u32>> {
        match &self.options {
            DeviceOptions::Flex => None,
            DeviceOptions::Ranged { major, .. } => major.clone(),
        }
    }

    fn minor_filter(&self) -> Option<Vec<u32>> {
        match &self.options {
            DeviceOptions::Flex => None,
            DeviceOptions::Ranged { minor, .. } => minor.clone(),
        }
    }
}

fn matches(filter: &Option<Vec<u32>>, id: u32) -> bool {
    match filter {
        None => true,
        Some(list) => list.contains(&id),
    }
}
