//! Peer-to-peer link status over the NVLink fabric.

use std::sync::Arc;

use dcgm_client::{DcgmClient, DeviceInfo, P2pLinkStatus};

use crate::collectors::{base_metric, Collector};
use crate::counters::Counter;
use crate::devices::{MonitoringInfo, SystemInfo};
use crate::error::ExporterError;
use crate::metrics::MetricsByCounter;

pub struct P2pCollector {
    client: Arc<dyn DcgmClient>,
    counter: Counter,
    gpus: Vec<DeviceInfo>,
    hostname: String,
}

impl P2pCollector {
    pub fn new(
        client: Arc<dyn DcgmClient>,
        counter: Counter,
        system: &SystemInfo,
        hostname: String,
    ) -> Self {
        Self {
            client,
            counter,
            gpus: system.gpus().to_vec(),
            hostname,
        }
    }
}

impl Collector for P2pCollector {
    fn name(&self) -> &'static str {
        "p2p_status"
    }

    fn is_derived(&self) -> bool {
        true
    }

    fn get_metrics(&self) -> Result<MetricsByCounter, ExporterError> {
        let mut out = MetricsByCounter::new();
        let status = self.client.nvlink_p2p_status()?;

        for (i, row) in status.gpus.iter().enumerate() {
            let device = match self.gpus.iter().find(|g| g.index as usize == i) {
                Some(device) => device,
                None => continue,
            };
            let info = MonitoringInfo::gpu(device);
            for (j, code) in row.iter().enumerate() {
                if i == j {
                    continue;
                }
                let mut metric = base_metric(&self.counter, &info, &self.hostname);
                metric.value = code.to_string();
                metric.labels.insert("peer_gpu".to_string(), j.to_string());
                metric.labels.insert(
                    "link_status".to_string(),
                    P2pLinkStatus::from_code(*code).as_str().to_string(),
                );
                out.push(metric);
            }
        }
        Ok(out)
    }

    fn cleanup(&mut self) {}
}
