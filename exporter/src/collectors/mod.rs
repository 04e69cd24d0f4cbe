//! Metric collectors.
//!
//! One generic collector samples native fields per watch list; each exporter
//! counter selects a bespoke collector variant. Collectors are constructed at
//! startup, produce a fresh `MetricsByCounter` per scrape, and release their
//! engine handles on cleanup.

pub mod clock_events;
pub mod health;
pub mod native;
pub mod p2p;
pub mod xid;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dcgm_client::{DcgmClient, EntityKind, EntitySample};
use log::info;

use crate::config::Config;
use crate::counters::{
    Counter, CounterSet, DCGM_EXP_CLOCK_EVENTS_COUNT, DCGM_EXP_GPU_HEALTH_STATUS,
    DCGM_EXP_P2P_STATUS, DCGM_EXP_XID_ERRORS_COUNT,
};
use crate::devices::{MonitoringInfo, SystemInfo};
use crate::error::ExporterError;
use crate::metrics::{Metric, MetricsByCounter};
use crate::watchlist::WatchList;

pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Derived collectors are omitted from a scrape when they fail; a native
    /// collector failure fails the scrape.
    fn is_derived(&self) -> bool {
        false
    }

    fn get_metrics(&self) -> Result<MetricsByCounter, ExporterError>;

    fn cleanup(&mut self);
}

/// The enumerated topologies the collectors draw entities from.
pub struct Systems {
    pub gpu: SystemInfo,
    pub switch: SystemInfo,
    pub cpu: SystemInfo,
}

/// Identity block for a metric of `info`, with the per-kind slug rules.
pub(crate) fn base_metric(counter: &Counter, info: &MonitoringInfo, hostname: &str) -> Metric {
    let mut metric = Metric {
        counter: counter.clone(),
        hostname: hostname.to_string(),
        ..Default::default()
    };
    match info.entity.kind {
        EntityKind::Gpu | EntityKind::GpuInstance => {
            if let Some(device) = &info.device {
                metric.gpu_id = device.index.to_string();
                metric.gpu_uuid = device.uuid.clone();
                metric.gpu_device = format!("nvidia{}", device.index);
                metric.gpu_model = device.model.clone();
                metric.gpu_pci_bus_id = device.pci_bus_id.clone();
            }
            if let Some(instance) = &info.instance {
                metric.mig_profile = instance.profile_name.clone();
                metric.gpu_instance_id = instance.nvml_instance_id.to_string();
            }
        }
        EntityKind::Switch => {
            metric.gpu_id = info.entity.id.to_string();
            metric.gpu_device = format!("nvswitch{}", info.entity.id);
        }
        EntityKind::Link => {
            metric.gpu_id = info.entity.id.to_string();
            let parent = info.parent_id.unwrap_or_default();
            metric.gpu_device = format!("nvswitch{parent}");
        }
        EntityKind::Cpu => {
            metric.gpu_id = info.entity.id.to_string();
            metric.gpu_device = info.entity.id.to_string();
        }
        EntityKind::CpuCore => {
            metric.gpu_id = info.entity.id.to_string();
            let parent = info.parent_id.unwrap_or_default();
            metric.gpu_device = parent.to_string();
        }
    }
    metric
}

pub(crate) fn now_unix_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Samples from every group of `watch_list` with engine timestamps inside the
/// trailing window. Any engine failure fails the whole read.
pub(crate) fn windowed_samples(
    client: &dyn DcgmClient,
    watch_list: &WatchList,
    window_ms: u64,
) -> Result<Vec<EntitySample>, ExporterError> {
    let mut samples = Vec::new();
    let field_group = match watch_list.field_group() {
        Some(fg) => fg,
        None => return Ok(samples),
    };
    let since = now_unix_micros() - (window_ms as i64) * 1000;
    for group in watch_list.groups() {
        let (batch, _) = client.values_since(*group, field_group, since)?;
        samples.extend(batch);
    }
    Ok(samples)
}

/// Build every collector the catalogue asks for and arm their watch lists.
/// Duplicate exporter counters collapse to the first occurrence.
pub fn build_collectors(
    client: Arc<dyn DcgmClient>,
    counters: &CounterSet,
    systems: &Systems,
    config: &Config,
    hostname: &str,
) -> Result<Vec<Box<dyn Collector>>, ExporterError> {
    let mut collectors: Vec<Box<dyn Collector>> = Vec::new();

    for kind in [
        EntityKind::Gpu,
        EntityKind::Switch,
        EntityKind::Link,
        EntityKind::Cpu,
        EntityKind::CpuCore,
    ] {
        let system = match kind {
            EntityKind::Gpu => &systems.gpu,
            EntityKind::Switch | EntityKind::Link => &systems.switch,
            _ => &systems.cpu,
        };
        let mut watch_list = WatchList::new(
            Arc::clone(&client),
            kind,
            system,
            &counters.native,
            config.collect_interval_ms,
        );
        if watch_list.device_fields().is_empty() {
            continue;
        }
        watch_list.watch()?;
        info!(
            "[collectors] native collector for {kind}: {} entities",
            watch_list.monitored().len()
        );
        collectors.push(Box::new(native::NativeCollector::new(
            Arc::clone(&client),
            watch_list,
            counters.native.clone(),
            hostname.to_string(),
        )));
    }

    let mut seen = Vec::new();
    for counter in &counters.exporter {
        if seen.contains(&counter.field_id) {
            continue;
        }
        seen.push(counter.field_id);
        match counter.field_id {
            DCGM_EXP_CLOCK_EVENTS_COUNT => {
                collectors.push(Box::new(clock_events::ClockEventsCollector::new(
                    Arc::clone(&client),
                    counter.clone(),
                    &systems.gpu,
                    config.clock_events_window_ms,
                    config.collect_interval_ms,
                    hostname.to_string(),
                )?));
            }
            DCGM_EXP_XID_ERRORS_COUNT => {
                collectors.push(Box::new(xid::XidCollector::new(
                    Arc::clone(&client),
                    counter.clone(),
                    &systems.gpu,
                    config.xid_window_ms,
                    config.collect_interval_ms,
                    hostname.to_string(),
                )?));
            }
            DCGM_EXP_GPU_HEALTH_STATUS => {
                collectors.push(Box::new(health::HealthCollector::new(
                    Arc::clone(&client),
                    counter.clone(),
                    &systems.gpu,
                    hostname.to_string(),
                )?));
            }
            DCGM_EXP_P2P_STATUS => {
                collectors.push(Box::new(p2p::P2pCollector::new(
                    Arc::clone(&client),
                    counter.clone(),
                    &systems.gpu,
                    hostname.to_string(),
                )));
            }
            other => {
                // Parsing guarantees the id is one of the reserved set.
                unreachable!("unhandled exporter counter id {other}");
            }
        }
    }

    Ok(collectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Args, DeviceOptions};
    use crate::counters::{parse_counters, ProfilingPolicy};
    use crate::devices::SystemInfo;
    use clap::Parser;
    use dcgm_client::mock::MockDcgm;
    use std::collections::HashSet;

    fn build(mock: &Arc<MockDcgm>, csv: &str) -> Vec<Box<dyn Collector>> {
        let counters = parse_counters(
            csv,
            &ProfilingPolicy {
                enabled: false,
                supported: HashSet::new(),
            },
        )
        .unwrap();
        let config = Config::from_args(&Args::parse_from(["dcgm-exporter", "-f", "c.csv"])).unwrap();
        let systems = Systems {
            gpu: SystemInfo::initialize(&**mock, EntityKind::Gpu, DeviceOptions::Flex).unwrap(),
            switch: SystemInfo::initialize(&**mock, EntityKind::Switch, DeviceOptions::Flex)
                .unwrap(),
            cpu: SystemInfo::initialize(&**mock, EntityKind::Cpu, DeviceOptions::Flex).unwrap(),
        };
        build_collectors(
            Arc::clone(mock) as Arc<dyn DcgmClient>,
            &counters,
            &systems,
            &config,
            "node-a",
        )
        .unwrap()
    }

    #[test]
    fn catalogue_routes_each_counter_to_one_collector() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        let csv = "DCGM_FI_DEV_GPU_TEMP, gauge, temp\n\
                   DCGM_EXP_CLOCK_EVENTS_COUNT, gauge, clocks\n\
                   DCGM_EXP_GPU_HEALTH_STATUS, gauge, health\n";
        let collectors = build(&mock, csv);
        let names: Vec<&str> = collectors.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["native", "clock_events", "gpu_health"]);
    }

    #[test]
    fn duplicate_exporter_counters_collapse_to_the_first() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        let csv = "DCGM_EXP_XID_ERRORS_COUNT, gauge, first\n\
                   DCGM_EXP_XID_ERRORS_COUNT, counter, second\n";
        let collectors = build(&mock, csv);
        assert_eq!(collectors.len(), 1);
        assert_eq!(collectors[0].name(), "xid_errors");
        let out = collectors[0].get_metrics().unwrap();
        let (counter, _) = out.iter().next().unwrap();
        assert_eq!(counter.help, "first");
    }

    #[test]
    fn base_metric_identity_per_kind() {
        let counter = Counter::default();
        let gpu = MonitoringInfo {
            entity: dcgm_client::Entity::new(EntityKind::Gpu, 0),
            device: Some(dcgm_client::DeviceInfo {
                index: 0,
                uuid: "GPU-aaaa".into(),
                pci_bus_id: "0000:01:00.0".into(),
                model: "NVIDIA H100".into(),
                instances: vec![],
            }),
            instance: None,
            parent_id: None,
        };
        let m = base_metric(&counter, &gpu, "node-a");
        assert_eq!(m.gpu_device, "nvidia0");
        assert_eq!(m.gpu_uuid, "GPU-aaaa");
        assert_eq!(m.hostname, "node-a");
    }
}
