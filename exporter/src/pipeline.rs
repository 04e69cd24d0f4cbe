//! The scrape pipeline: fence, collect, attribute.

use std::sync::Arc;

use dcgm_client::{DcgmClient, DeviceInfo};
use log::{debug, warn};

use crate::collectors::Collector;
use crate::error::ExporterError;
use crate::kubernetes::PodMapper;
use crate::metrics::MetricsByCounter;

pub struct Pipeline {
    client: Arc<dyn DcgmClient>,
    collectors: Vec<Box<dyn Collector>>,
    pod_mapper: Option<PodMapper>,
    devices: Vec<DeviceInfo>,
}

impl Pipeline {
    pub fn new(
        client: Arc<dyn DcgmClient>,
        collectors: Vec<Box<dyn Collector>>,
        pod_mapper: Option<PodMapper>,
        devices: Vec<DeviceInfo>,
    ) -> Self {
        Self {
            client,
            collectors,
            pod_mapper,
            devices,
        }
    }

    /// One scrape. All collectors read behind the same update fence. A
    /// failing derived collector drops out of this scrape; a failing native
    /// collector (or the fence itself) fails the scrape. Fatal errors
    /// propagate untouched for the caller to act on.
    pub async fn scrape(&mut self) -> Result<MetricsByCounter, ExporterError> {
        self.client.update_all_fields(true)?;

        let mut out = MetricsByCounter::new();
        for collector in &self.collectors {
            match collector.get_metrics() {
                Ok(metrics) => {
                    debug!(
                        "[pipeline] {}: {} metric(s)",
                        collector.name(),
                        metrics.metric_count()
                    );
                    out.merge(metrics);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) if collector.is_derived() => {
                    warn!(
                        "[pipeline] {} failed, omitting from this scrape: {err}",
                        collector.name()
                    );
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(mapper) = &self.pod_mapper {
            if let Err(err) = mapper.process(&mut out, &self.devices).await {
                warn!("[pipeline] pod attribution unavailable: {err}");
            }
        }
        Ok(out)
    }

    /// Release engine-side state. Idempotent; called once at shutdown.
    pub fn cleanup(&mut self) {
        for collector in &mut self.collectors {
            collector.cleanup();
        }
    }
}
