//! XID-errors counter: counts XID occurrences per GPU over a sliding window.

use std::collections::HashMap;
use std::sync::Arc;

use dcgm_client::fields::DCGM_FI_DEV_XID_ERRORS;
use dcgm_client::{DcgmClient, Entity};

use crate::collectors::clock_events::WINDOW_LABEL;
use crate::collectors::{base_metric, windowed_samples, Collector};
use crate::counters::Counter;
use crate::devices::SystemInfo;
use crate::error::ExporterError;
use crate::metrics::MetricsByCounter;
use crate::watchlist::WatchList;

pub struct XidCollector {
    client: Arc<dyn DcgmClient>,
    counter: Counter,
    watch_list: WatchList,
    window_ms: u64,
    hostname: String,
}

impl XidCollector {
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
            vec![DCGM_FI_DEV_XID_ERRORS],
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

impl Collector for XidCollector {
    fn name(&self) -> &'static str {
        "xid_errors"
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
        let mut counts: HashMap<Entity, HashMap<i64, u64>> = HashMap::new();
        for sample in &samples {
            // A zero reading means "no error", not XID 0.
            match sample.value.value.as_int64() {
                Some(xid) if xid > 0 => {
                    *counts
                        .entry(sample.entity)
                        .or_default()
                        .entry(xid)
                        .or_default() += 1;
                }
                _ => continue,
            }
        }

        let window = self.window_ms.to_string();
        for info in self.watch_list.monitored() {
            match counts.get(&info.entity) {
                Some(by_xid) => {
                    let mut xids: Vec<i64> = by_xid.keys().copied().collect();
                    xids.sort_unstable();
                    for xid in xids {
                        let mut metric = base_metric(&self.counter, info, &self.hostname);
                        metric.value = by_xid[&xid].to_string();
                        metric.labels.insert("xid".to_string(), xid.to_string());
                        metric.labels.insert(WINDOW_LABEL.to_string(), window.clone());
                        out.push(metric);
                    }
                }
                None => {
                    let mut metric = base_metric(&self.counter, info, &self.hostname);
                    metric.value = "0".to_string();
                    metric.labels.insert(WINDOW_LABEL.to_string(), window.clone());
                    out.push(metric);
                }
            }
        }
        Ok(out)
    }

    fn cleanup(&mut self) {
        self.watch_list.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::now_unix_micros;
    use crate::config::DeviceOptions;
    use crate::counters::PromType;
    use dcgm_client::mock::MockDcgm;
    use dcgm_client::values::FieldValue;
    use dcgm_client::EntityKind;

    fn counter() -> Counter {
        Counter {
            field_id: crate::counters::DCGM_EXP_XID_ERRORS_COUNT,
            field_name: "DCGM_EXP_XID_ERRORS_COUNT".into(),
            prom_type: PromType::Gauge,
            help: String::new(),
        }
    }

    #[test]
    fn counts_xids_per_gpu_in_ascending_xid_order() {
        let mock = Arc::new(MockDcgm::new());
        mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
        mock.add_gpu(1, "GPU-bbbb", "0000:41:00.0", "NVIDIA H100");
        let system =
            SystemInfo::initialize(&*mock, EntityKind::Gpu, DeviceOptions::Flex).unwrap();
        let c = XidCollector::new(
            Arc::clone(&mock) as Arc<dyn DcgmClient>,
            counter(),
            &system,
            60_000,
            1000,
            "node-a".into(),
        )
        .unwrap();

        let now = now_unix_micros();
        let gpu0 = Entity::new(EntityKind::Gpu, 0);
        let gpu1 = Entity::new(EntityKind::Gpu, 1);
        for xid in [42, 42, 46] {
            mock.push_sample(gpu0, FieldValue::int64(230, now, xid));
        }
        for xid in [42, 46, 46, 46] {
            mock.push_sample(gpu1, FieldValue::int64(230, now, xid));
        }

        let out = c.get_metrics().unwrap();
        let metrics = out.get(&counter()).unwrap();
        let shape: Vec<(String, String, String)> = metrics
            .iter()
            .map(|m| {
                (
                    m.gpu_id.clone(),
                    m.labels.get("xid").cloned().unwrap_or_default(),
                    m.value.clone(),
                )
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                ("0".into(), "42".into(), "2".into()),
                ("0".into(), "46".into(), "1".into()),
                ("1".into(), "42".into(), "1".into()),
                ("1".into(), "46".into(), "3".into()),
            ]
        );
    }
}
