//! GPU health collector, backed by the engine's health subsystem rather than
//! the fields pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dcgm_client::health::{error_code_name, HealthResult, HealthSystem};
use dcgm_client::{DcgmClient, Entity, GroupHandle};
use log::warn;

use crate::collectors::{base_metric, Collector};
use crate::counters::Counter;
use crate::devices::{MonitoringInfo, SystemInfo};
use crate::error::ExporterError;
use crate::metrics::MetricsByCounter;

static HEALTH_GROUP_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct HealthCollector {
    client: Arc<dyn DcgmClient>,
    counter: Counter,
    group: Option<GroupHandle>,
    gpus: Vec<MonitoringInfo>,
    hostname: String,
}

impl HealthCollector {
    /// Creates a dedicated group with every enumerated GPU and enables the
    /// full health watch on it.
    pub fn new(
        client: Arc<dyn DcgmClient>,
        counter: Counter,
        system: &SystemInfo,
        hostname: String,
    ) -> Result<Self, ExporterError> {
        let gpus: Vec<MonitoringInfo> = system.gpus().iter().map(MonitoringInfo::gpu).collect();
        if gpus.is_empty() {
            return Ok(Self {
                client,
                counter,
                group: None,
                gpus,
                hostname,
            });
        }

        let seq = HEALTH_GROUP_SEQ.fetch_add(1, Ordering::Relaxed);
        let group = client.create_group(&format!("dcgm-exporter-health-{seq}"))?;
        let result: Result<(), ExporterError> = (|| {
            for info in &gpus {
                client.add_entity_to_group(group, info.entity)?;
            }
            client.health_watch_all(group)?;
            Ok(())
        })();
        if let Err(err) = result {
            if let Err(destroy_err) = client.destroy_group(group) {
                warn!("[health] failed to destroy group after setup error: {destroy_err}");
            }
            return Err(err);
        }

        Ok(Self {
            client,
            counter,
            group: Some(group),
            gpus,
            hostname,
        })
    }
}

impl Collector for HealthCollector {
    fn name(&self) -> &'static str {
        "gpu_health"
    }

    fn is_derived(&self) -> bool {
        true
    }

    fn get_metrics(&self) -> Result<MetricsByCounter, ExporterError> {
        let mut out = MetricsByCounter::new();
        let group = match self.group {
            Some(group) => group,
            None => return Ok(out),
        };

        let response = self.client.health_check(group)?;
        let members = self.client.group_entities(group)?;

        // Incidents keyed by (entity, system); when several arrive for the
        // same pair the last one wins.
        let mut incidents: HashMap<(Entity, HealthSystem), (HealthResult, u32, String)> =
            HashMap::new();
        for incident in &response.incidents {
            incidents.insert(
                (incident.entity, incident.system),
                (
                    incident.health,
                    incident.error_code,
                    incident.error_message.clone(),
                ),
            );
        }

        for info in &self.gpus {
            if !members.contains(&info.entity) {
                continue;
            }
            for system in HealthSystem::ALL {
                let (health, code) = match incidents.get(&(info.entity, system)) {
                    Some((health, code, _)) => (*health, Some(*code)),
                    None => (HealthResult::Pass, None),
                };
                let mut metric = base_metric(&self.counter, info, &self.hostname);
                metric.value = health.as_code().to_string();
                metric
                    .labels
                    .insert("health_watch".to_string(), system.as_str().to_string());
                metric.labels.insert(
                    "health_error_code".to_string(),
                    code.and_then(error_code_name).unwrap_or("").to_string(),
                );
                out.push(metric);
            }
        }
        Ok(out)
    }

    fn cleanup(&mut self) {
        if let Some(group) = self.group.take() {
            if let Err(err) = self.client.destroy_group(group) {
                warn!("[health] failed to destroy group {group:?}: {err}");
            }
        }
    }
}

impl Drop for HealthCollector {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceOptions;
    use crate::counters::PromType;
    use dcgm_client::health::{HealthResponse, Incident};
    use dcgm_client::mock::MockDcgm;
    use dcgm_client::EntityKind;

    fn counter() -> Counter {
        Counter {
            field_id: crate::counters::DCGM_EXP_GPU_HEALTH_STATUS,
            field_name: "DCGM_EXP_GPU_HEALTH_STATUS".into(),
            prom_type: PromType::Gauge,
            help: String::new(),
        }
    }

    fn collector(mock: &Arc<MockDcgm>) -> HealthCollector {
        let system =
            SystemInfo::initialize(&**mock, EntityKind::Gpu, DeviceOptions::Flex).unwrap();
        HealthCollector::new(
            Arc::clone(mock) as Arc<dyn DcgmClient>,
            counter(),
            &system,
            "node-a".into(),
        )
        .unwrap()
    }

    #[test]
    fn defaults_every_system_to_pass_and_overwrites_from_incidents() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        let c = collector(&mock);
        assert_eq!(mock.health_watched_groups().len(), 1);

        let gpu0 = Entity::new(EntityKind::Gpu, 0);
        mock.set_health(HealthResponse {
            overall: HealthResult::Warn,
            incidents: vec![Incident {
                entity: gpu0,
                system: HealthSystem::NvLink,
                health: HealthResult::Warn,
                error_code: 14,
                error_message: "link down".into(),
            }],
        });

        let out = c.get_metrics().unwrap();
        let metrics = out.get(&counter()).unwrap();
        assert_eq!(metrics.len(), HealthSystem::ALL.len());

        for m in metrics {
            let system = m.labels.get("health_watch").unwrap();
            if system == "NVLINK" {
                assert_eq!(m.value, "10");
                assert_eq!(m.labels.get("health_error_code").unwrap(), "DCGM_FR_NVLINK_DOWN");
            } else {
                // value == 0 exactly when no incident was reported.
                assert_eq!(m.value, "0");
                assert_eq!(m.labels.get("health_error_code").unwrap(), "");
            }
        }
    }

    #[test]
    fn duplicate_incidents_for_one_system_keep_the_last() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        let c = collector(&mock);

        let gpu0 = Entity::new(EntityKind::Gpu, 0);
        let incident = |health, code: u32| Incident {
            entity: gpu0,
            system: HealthSystem::Mem,
            health,
            error_code: code,
            error_message: String::new(),
        };
        mock.set_health(HealthResponse {
            overall: HealthResult::Fail,
            incidents: vec![
                incident(HealthResult::Warn, 5),
                incident(HealthResult::Fail, 4),
            ],
        });

        let out = c.get_metrics().unwrap();
        let mem = out
            .get(&counter())
            .unwrap()
            .iter()
            .find(|m| m.labels.get("health_watch").map(String::as_str) == Some("MEM"))
            .cloned()
            .unwrap();
        assert_eq!(mem.value, "20");
        assert_eq!(
            mem.labels.get("health_error_code").unwrap(),
            "DCGM_FR_VOLATILE_DBE_DETECTED"
        );
    }

    #[test]
    fn cleanup_destroys_the_health_group() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        let mut c = collector(&mock);
        assert_eq!(mock.live_groups(), 1);
        c.cleanup();
        assert_eq!(mock.live_groups(), 0);
        c.cleanup(); // idempotent
    }

    #[test]
    fn health_failure_omits_the_counter() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        let c = collector(&mock);
        mock.fail_health();
        assert!(c.get_metrics().is_err());
    }
}
