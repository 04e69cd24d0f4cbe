//! The universal metric record and the collector-to-renderer transport.

use std::collections::BTreeMap;

use dcgm_client::values::SampleValue;

use crate::counters::Counter;

/// Value marking a reading that must not be rendered.
pub const SKIP_VALUE: &str = "SKIP";

/// One sample of one counter on one entity, fully labeled.
///
/// Identification fields that do not apply to the entity kind are left empty
/// and render as empty label values. `labels` become Prometheus labels;
/// `attributes` are reserved for pod attribution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metric {
    pub counter: Counter,
    pub value: String,

    pub gpu_id: String,
    pub gpu_uuid: String,
    pub gpu_device: String,
    pub gpu_model: String,
    pub gpu_pci_bus_id: String,
    pub mig_profile: String,
    pub gpu_instance_id: String,
    pub hostname: String,

    pub labels: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
}

impl Metric {
    pub fn should_render(&self) -> bool {
        self.value != SKIP_VALUE
    }
}

/// Render a sample for the exposition text. Blanks become the skip sentinel;
/// int64 renders as a plain integer and doubles in fixed `%f` style.
pub fn render_value(value: &SampleValue) -> String {
    if value.is_blank() {
        return SKIP_VALUE.to_string();
    }
    match value {
        SampleValue::Int64(v) => format!("{v}"),
        SampleValue::Double(v) => format!("{v:.6}"),
        SampleValue::Str(v) => v.clone(),
    }
}

/// Insertion-ordered multimap from counter to its metrics. Counter order is
/// catalogue order; metric order within a counter is collector emission
/// order.
#[derive(Debug, Clone, Default)]
pub struct MetricsByCounter {
    entries: Vec<(Counter, Vec<Metric>)>,
}

impl MetricsByCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metric: Metric) {
        let counter = metric.counter.clone();
        match self.entries.iter_mut().find(|(c, _)| *c == counter) {
            Some((_, list)) => list.push(metric),
            None => self.entries.push((counter, vec![metric])),
        }
    }

    pub fn get(&self, counter: &Counter) -> Option<&[Metric]> {
        self.entries
            .iter()
            .find(|(c, _)| c == counter)
            .map(|(_, list)| list.as_slice())
    }

    /// Append all of `other`, preserving its counter order after ours.
    pub fn merge(&mut self, other: MetricsByCounter) {
        for (_, metrics) in other.entries {
            for m in metrics {
                self.push(m);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Counter, &Vec<Metric>)> {
        self.entries.iter().map(|(c, m)| (c, m))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Counter, &mut Vec<Metric>)> {
        self.entries.iter_mut().map(|(c, m)| (&*c, m))
    }

    pub fn counter_count(&self) -> usize {
        self.entries.len()
    }

    pub fn metric_count(&self) -> usize {
        self.entries.iter().map(|(_, m)| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
