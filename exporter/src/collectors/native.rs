//! The generic collector for engine-served fields.

use std::collections::BTreeMap;
use std::sync::Arc;

use dcgm_client::fields::DCGM_FI_DEV_XID_ERRORS;
use dcgm_client::values::{FieldValue, SampleValue};
use dcgm_client::{DcgmClient, EntityKind};

use crate::collectors::{base_metric, Collector};
use crate::counters::Counter;
use crate::devices::MonitoringInfo;
use crate::error::ExporterError;
use crate::metrics::{render_value, MetricsByCounter, SKIP_VALUE};
use crate::watchlist::WatchList;

pub struct NativeCollector {
    client: Arc<dyn DcgmClient>,
    watch_list: WatchList,
    counters: Vec<Counter>,
    hostname: String,
}

impl NativeCollector {
    pub fn new(
        client: Arc<dyn DcgmClient>,
        watch_list: WatchList,
        counters: Vec<Counter>,
        hostname: String,
    ) -> Self {
        Self {
            client,
            watch_list,
            counters,
            hostname,
        }
    }

    fn latest(
        &self,
        info: &MonitoringInfo,
        fields: &[dcgm_client::FieldId],
    ) -> Result<Vec<FieldValue>, ExporterError> {
        let values = match (info.entity.kind, info.parent_id) {
            (EntityKind::Link, Some(parent)) => {
                self.client.link_latest_values(info.entity.id, parent, fields)?
            }
            _ => self
                .client
                .entity_latest_values(info.entity.kind, info.entity.id, fields)?,
        };
        Ok(values)
    }

    /// Labels contributed by this entity's label counters. Blank readings
    /// contribute nothing.
    fn entity_labels(&self, info: &MonitoringInfo) -> Result<BTreeMap<String, String>, ExporterError> {
        let mut labels = BTreeMap::new();
        let label_fields = self.watch_list.label_fields();
        if label_fields.is_empty() {
            return Ok(labels);
        }
        for value in self.latest(info, label_fields)? {
            if value.is_blank() {
                continue;
            }
            let counter = self
                .counters
                .iter()
                .find(|c| c.field_id == value.field_id && c.is_label());
            if let Some(counter) = counter {
                labels.insert(counter.field_name.clone(), render_value(&value.value));
            }
        }
        Ok(labels)
    }
}

impl Collector for NativeCollector {
    fn name(&self) -> &'static str {
        "native"
    }

    fn get_metrics(&self) -> Result<MetricsByCounter, ExporterError> {
        let mut out = MetricsByCounter::new();
        if !self.watch_list.is_armed() {
            return Ok(out);
        }

        for info in self.watch_list.monitored() {
            let labels = self.entity_labels(info)?;
            for value in self.latest(info, self.watch_list.device_fields())? {
                let counter = self
                    .counters
                    .iter()
                    .find(|c| c.field_id == value.field_id && !c.is_label());
                let counter = match counter {
                    Some(c) => c,
                    None => continue,
                };
                let rendered = render_value(&value.value);
                if rendered == SKIP_VALUE {
                    continue;
                }

                let mut metric = base_metric(counter, info, &self.hostname);
                metric.value = rendered;
                metric.labels = labels.clone();
                if value.field_id == DCGM_FI_DEV_XID_ERRORS {
                    if let SampleValue::Int64(code) = value.value {
                        metric
                            .attributes
                            .insert("err_code".to_string(), code.to_string());
                        metric
                            .attributes
                            .insert("err_msg".to_string(), xid_error_message(code).to_string());
                    }
                }
                out.push(metric);
            }
        }
        Ok(out)
    }

    fn cleanup(&mut self) {
        self.watch_list.cleanup();
    }
}

/// Human text for an XID error code.
pub fn xid_error_message(code: i64) -> &'static str {
    match code {
        13 => "Graphics Engine Exception",
        31 => "GPU memory page fault",
        32 => "Invalid or corrupted push buffer stream",
        42 => "Video processor exception",
        43 => "GPU stopped processing",
        45 => "Preemptive cleanup, due to previous errors",
        46 => "GPU stopped processing",
        48 => "Double Bit ECC Error",
        61 => "Internal micro-controller breakpoint/warning",
        62 => "Internal micro-controller halt",
        63 => "ECC page retirement or row remapping recording event",
        64 => "ECC page retirement or row remapper recording failure",
        68 => "NVDEC0 Exception",
        74 => "NVLINK Error",
        79 => "GPU has fallen off the bus",
        92 => "High single-bit ECC error rate",
        94 => "Contained ECC error",
        95 => "Uncontained ECC error",
        119 => "GSP RPC Timeout",
        120 => "GSP Error",
        121 => "C2C Link Error",
        140 => "Unrecovered ECC Error",
        _ => "Unknown Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceOptions;
    use crate::counters::PromType;
    use crate::devices::SystemInfo;
    use dcgm_client::mock::MockDcgm;
    use dcgm_client::values::INT64_BLANK;

    fn counters() -> Vec<Counter> {
        vec![
            Counter {
                field_id: 150,
                field_name: "DCGM_FI_DEV_GPU_TEMP".into(),
                prom_type: PromType::Gauge,
                help: String::new(),
            },
            Counter {
                field_id: 230,
                field_name: "DCGM_FI_DEV_XID_ERRORS".into(),
                prom_type: PromType::Gauge,
                help: String::new(),
            },
            Counter {
                field_id: 1,
                field_name: "DCGM_FI_DRIVER_VERSION".into(),
                prom_type: PromType::Label,
                help: String::new(),
            },
        ]
    }

    fn collector_for(mock: &Arc<MockDcgm>) -> NativeCollector {
        let system =
            SystemInfo::initialize(&**mock, EntityKind::Gpu, DeviceOptions::Flex).unwrap();
        let mut watch_list = WatchList::new(
            Arc::clone(mock) as Arc<dyn DcgmClient>,
            EntityKind::Gpu,
            &system,
            &counters(),
            1000,
        );
        watch_list.watch().unwrap();
        NativeCollector::new(
            Arc::clone(mock) as Arc<dyn DcgmClient>,
            watch_list,
            counters(),
            "node-a".into(),
        )
    }

    #[test]
    fn emits_one_metric_per_field_with_identity_and_labels() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        mock.set_latest(EntityKind::Gpu, 0, FieldValue::int64(150, 10, 85));
        mock.set_latest(EntityKind::Gpu, 0, FieldValue::string(1, 10, "550.54.15"));

        let collector = collector_for(&mock);
        let out = collector.get_metrics().unwrap();
        let temp_counter = &counters()[0];
        let metrics = out.get(temp_counter).unwrap();
        assert_eq!(metrics.len(), 1);
        let m = &metrics[0];
        assert_eq!(m.value, "85");
        assert_eq!(m.gpu_id, "0");
        assert_eq!(m.gpu_uuid, "GPU-aaaa");
        assert_eq!(m.gpu_device, "nvidia0");
        assert_eq!(m.hostname, "node-a");
        assert_eq!(m.labels.get("DCGM_FI_DRIVER_VERSION").unwrap(), "550.54.15");
    }

    #[test]
    fn blank_values_are_dropped_not_zeroed() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        mock.set_latest(
            EntityKind::Gpu,
            0,
            FieldValue::int64(150, 10, INT64_BLANK + 2),
        );

        let collector = collector_for(&mock);
        let out = collector.get_metrics().unwrap();
        assert_eq!(out.metric_count(), 0);
    }

    #[test]
    fn xid_metrics_carry_error_attributes() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        mock.set_latest(EntityKind::Gpu, 0, FieldValue::int64(230, 10, 79));

        let collector = collector_for(&mock);
        let out = collector.get_metrics().unwrap();
        let m = &out.get(&counters()[1]).unwrap()[0];
        assert_eq!(m.attributes.get("err_code").unwrap(), "79");
        assert_eq!(m.attributes.get("err_msg").unwrap(), "GPU has fallen off the bus");

        // Out-of-table codes degrade to the generic message.
        assert_eq!(xid_error_message(12345), "Unknown Error");
    }

    #[test]
    fn switch_and_link_metrics_use_the_nvswitch_identity() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_switch(3, &[(0, dcgm_client::LinkState::Up)]);
        let system =
            SystemInfo::initialize(&*mock, EntityKind::Switch, DeviceOptions::Flex).unwrap();

        let switch_counters = vec![Counter {
            field_id: 711,
            field_name: "DCGM_FI_DEV_NVSWITCH_THROUGHPUT_TX".into(),
            prom_type: PromType::Counter,
            help: String::new(),
        }];
        mock.set_latest(EntityKind::Switch, 3, FieldValue::int64(711, 10, 1024));
        let mut watch_list = WatchList::new(
            Arc::clone(&mock) as Arc<dyn DcgmClient>,
            EntityKind::Switch,
            &system,
            &switch_counters,
            1000,
        );
        watch_list.watch().unwrap();
        let collector = NativeCollector::new(
            Arc::clone(&mock) as Arc<dyn DcgmClient>,
            watch_list,
            switch_counters,
            "node-a".into(),
        );
        let out = collector.get_metrics().unwrap();
        let m = &out.iter().next().unwrap().1[0];
        assert_eq!(m.gpu_id, "3");
        assert_eq!(m.gpu_device, "nvswitch3");
        assert!(m.gpu_uuid.is_empty());
        assert_eq!(m.value, "1024");

        let link_counters = vec![Counter {
            field_id: 780,
            field_name: "DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX".into(),
            prom_type: PromType::Counter,
            help: String::new(),
        }];
        mock.set_link_latest(3, 0, FieldValue::int64(780, 10, 2048));
        let mut watch_list = WatchList::new(
            Arc::clone(&mock) as Arc<dyn DcgmClient>,
            EntityKind::Link,
            &system,
            &link_counters,
            1000,
        );
        watch_list.watch().unwrap();
        let collector = NativeCollector::new(
            Arc::clone(&mock) as Arc<dyn DcgmClient>,
            watch_list,
            link_counters,
            "node-a".into(),
        );
        let out = collector.get_metrics().unwrap();
        let m = &out.iter().next().unwrap().1[0];
        assert_eq!(m.gpu_id, "0");
        assert_eq!(m.gpu_device, "nvswitch3");
        assert_eq!(m.value, "2048");
    }

    #[test]
    fn cpu_core_metrics_carry_the_parent_cpu_slug() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_cpu(1, &[4, 5]);
        let system =
            SystemInfo::initialize(&*mock, EntityKind::Cpu, DeviceOptions::Flex).unwrap();

        let cpu_counters = vec![Counter {
            field_id: 1132,
            field_name: "DCGM_FI_DEV_CPU_UTIL_TOTAL".into(),
            prom_type: PromType::Gauge,
            help: String::new(),
        }];
        mock.set_latest(EntityKind::CpuCore, 4, FieldValue::double(1132, 10, 75.0));
        let mut watch_list = WatchList::new(
            Arc::clone(&mock) as Arc<dyn DcgmClient>,
            EntityKind::CpuCore,
            &system,
            &cpu_counters,
            1000,
        );
        watch_list.watch().unwrap();
        let collector = NativeCollector::new(
            Arc::clone(&mock) as Arc<dyn DcgmClient>,
            watch_list,
            cpu_counters,
            "node-a".into(),
        );
        let out = collector.get_metrics().unwrap();
        let m = &out.iter().next().unwrap().1[0];
        assert_eq!(m.gpu_id, "4");
        assert_eq!(m.gpu_device, "1");
        assert_eq!(m.value, "75.000000");
    }

    #[test]
    fn connection_loss_is_fatal() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        let collector = collector_for(&mock);
        mock.lose_connection();

        let err = collector.get_metrics().unwrap_err();
        assert!(err.is_fatal());
    }
}
