//! Clock-events counter: decomposes the event-reason bitmask over a sliding
//! window into per-reason counts.

use std::collections::HashMap;
use std::sync::Arc;

use dcgm_client::fields::DCGM_FI_DEV_CLOCKS_EVENT_REASONS;
use dcgm_client::{DcgmClient, Entity};

use crate::collectors::{base_metric, windowed_samples, Collector};
use crate::counters::Counter;
use crate::devices::SystemInfo;
use crate::error::ExporterError;
use crate::metrics::MetricsByCounter;
use crate::watchlist::WatchList;

pub const WINDOW_LABEL: &str = "window_size_in_ms";

/// Bit positions of the engine's clock-event reason mask, in emission order.
pub const REASONS: &[(i64, &str)] = &[
    (0x0001, "gpu_idle"),
    (0x0002, "clocks_setting"),
    (0x0004, "sw_power_cap"),
    (0x0008, "hw_slowdown"),
    (0x0010, "sync_boost"),
    (0x0020, "sw_thermal"),
    (0x0040, "hw_thermal"),
    (0x0080, "hw_power_brake"),
    (0x0100, "display_clocks"),
];

pub struct ClockEventsCollector {
    client: Arc<dyn DcgmClient>,
    counter: Counter,
    watch_list: WatchList,
    window_ms: u64,
    hostname: String,
}

impl ClockEventsCollector {
    pub fn new(
        client: Arc<dyn DcgmClient>,
        counter: Counter,
        system: &SystemInfo,
        window_ms: u64,
        collect_interval_ms: u64,
        hostname: String,
    ) -> Result<Self, ExporterError> {
        let mut watch_list = WatchList::for_fields(
            Arc::clone(&client),
            dcgm_client::EntityKind::Gpu,
            system,
            vec![DCGM_FI_DEV_CLOCKS_EVENT_REASONS],
            collect_interval_ms,
        );
        watch_list.watch()?;
        Ok(Self {
            client,
            counter,
            watch_list,
            window_ms,
            hostname,
        })
    }
}

impl Collector for ClockEventsCollector {
    fn name(&self) -> &'static str {
        "clock_events"
    }

    fn is_derived(&self) -> bool {
        true
    }

    fn get_metrics(&self) -> Result<MetricsByCounter, ExporterError> {
        let mut out = MetricsByCounter::new();
        if !self.watch_list.is_armed() {
            return Ok(out);
        }

        let samples = windowed_samples(&*self.client, &self.watch_list, self.window_ms)?;
        let mut counts: HashMap<(Entity, i64), u64> = HashMap::new();
        for sample in &samples {
            let mask = match sample.value.value.as_int64() {
                Some(mask) => mask,
                None => continue,
            };
            for (bit, _) in REASONS {
                if mask & bit != 0 {
                    *counts.entry((sample.entity, *bit)).or_default() += 1;
                }
            }
        }

        let window = self.window_ms.to_string();
        for info in self.watch_list.monitored() {
            let mut seen_any = false;
            for (bit, reason) in REASONS {
                if let Some(count) = counts.get(&(info.entity, *bit)) {
                    seen_any = true;
                    let mut metric = base_metric(&self.counter, info, &self.hostname);
                    metric.value = count.to_string();
                    metric
                        .labels
                        .insert("clock_event".to_string(), (*reason).to_string());
                    metric.labels.insert(WINDOW_LABEL.to_string(), window.clone());
                    out.push(metric);
                }
            }
            if !seen_any {
                // Keep the series alive for entities that were quiet.
                let mut metric = base_metric(&self.counter, info, &self.hostname);
                metric.value = "0".to_string();
                metric.labels.insert(WINDOW_LABEL.to_string(), window.clone());
                out.push(metric);
            }
        }
        Ok(out)
    }

    fn cleanup(&mut self) {
        self.watch_list.cleanup();
    }
}
