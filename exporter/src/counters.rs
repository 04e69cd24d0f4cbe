//! Counter catalogue parsing and classification.
//!
//! The operator hands us a CSV of (field name, prom type, help). Each record
//! resolves either to a hardware field known to the engine or to one of the
//! reserved exporter counters computed in-process. Anything else refuses to
//! start.

use std::collections::HashSet;

use dcgm_client::fields::{self, is_profiling_field, FieldId};
use dcgm_client::DcgmClient;
use log::{debug, warn};

use crate::error::ConfigError;

/// Synthetic field ids for counters the exporter computes itself. These never
/// reach the engine; they select a derived collector.
pub const DCGM_EXP_CLOCK_EVENTS_COUNT: FieldId = 9001;
pub const DCGM_EXP_XID_ERRORS_COUNT: FieldId = 9002;
pub const DCGM_EXP_GPU_HEALTH_STATUS: FieldId = 9003;
pub const DCGM_EXP_P2P_STATUS: FieldId = 9004;

static EXPORTER_COUNTERS: &[(&str, FieldId)] = &[
    ("DCGM_EXP_CLOCK_EVENTS_COUNT", DCGM_EXP_CLOCK_EVENTS_COUNT),
    ("DCGM_EXP_XID_ERRORS_COUNT", DCGM_EXP_XID_ERRORS_COUNT),
    ("DCGM_EXP_GPU_HEALTH_STATUS", DCGM_EXP_GPU_HEALTH_STATUS),
    ("DCGM_EXP_P2P_STATUS", DCGM_EXP_P2P_STATUS),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PromType {
    #[default]
    Gauge,
    Counter,
    Histogram,
    Summary,
    Label,
}

impl PromType {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "gauge" => Ok(PromType::Gauge),
            "counter" => Ok(PromType::Counter),
            "histogram" => Ok(PromType::Histogram),
            "summary" => Ok(PromType::Summary),
            "label" => Ok(PromType::Label),
            other => Err(ConfigError::UnknownPromType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PromType::Gauge => "gauge",
            PromType::Counter => "counter",
            PromType::Histogram => "histogram",
            PromType::Summary => "summary",
            PromType::Label => "label",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Counter {
    pub field_id: FieldId,
    pub field_name: String,
    pub prom_type: PromType,
    pub help: String,
}

impl Counter {
    pub fn is_label(&self) -> bool {
        self.prom_type == PromType::Label
    }
}

/// The parsed catalogue: fields the engine serves, and counters we derive.
#[derive(Debug, Clone, Default)]
pub struct CounterSet {
    pub native: Vec<Counter>,
    pub exporter: Vec<Counter>,
}

impl CounterSet {
    /// Label counters, in catalogue order.
    pub fn labels(&self) -> Vec<&Counter> {
        self.native.iter().filter(|c| c.is_label()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.native.is_empty() && self.exporter.is_empty()
    }

    /// Render back to catalogue CSV. Parsing this output yields the same set
    /// modulo record order.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for c in self.native.iter().chain(self.exporter.iter()) {
            out.push_str(&format!(
                "{}, {}, {}\n",
                c.field_name,
                c.prom_type.as_str(),
                c.help
            ));
        }
        out
    }
}

/// Whether profiling-range fields may be kept, and which ones the hardware
/// actually serves.
pub struct ProfilingPolicy {
    pub enabled: bool,
    pub supported: HashSet<FieldId>,
}

impl ProfilingPolicy {
    pub fn from_client(client: &dyn DcgmClient, enabled: bool) -> Self {
        let supported = if enabled {
            match client.supported_profiling_fields() {
                Ok(fields) => fields.into_iter().collect(),
                Err(err) => {
                    warn!("[counters] profiling capability probe failed: {err}");
                    HashSet::new()
                }
            }
        } else {
            HashSet::new()
        };
        Self { enabled, supported }
    }

    fn keeps(&self, id: FieldId) -> bool {
        self.enabled && self.supported.contains(&id)
    }
}

/// Parse catalogue CSV into a CounterSet.
///
/// Records are `FieldName, PromType, Help`; `#` starts a comment line and
/// blank lines are skipped. Duplicates are allowed.
pub fn parse_counters(data: &str, policy: &ProfilingPolicy) -> Result<CounterSet, ConfigError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(data.as_bytes());

    let mut set = CounterSet::default();
    for (idx, record) in reader.records().enumerate() {
        let line = idx + 1;
        let record = record.map_err(|e| ConfigError::MalformedRecord {
            line,
            msg: e.to_string(),
        })?;
        // A lone empty field is what an empty-ish line parses to.
        if record.len() == 1 && record[0].is_empty() {
            continue;
        }
        if record.len() != 3 {
            return Err(ConfigError::MalformedRecord {
                line,
                msg: format!("expected 3 fields, got {}", record.len()),
            });
        }

        let name = record[0].to_string();
        if name.is_empty() {
            continue;
        }
        let prom_type = PromType::parse(&record[1])?;
        let help = record[2].to_string();

        if let Some(meta) = fields::field_by_name(&name) {
            if is_profiling_field(meta.id) && !policy.keeps(meta.id) {
                debug!("[counters] skipping profiling field {name}: not collectable here");
                continue;
            }
            set.native.push(Counter {
                field_id: meta.id,
                // Canonical spelling, so legacy names render consistently.
                field_name: meta.name.to_string(),
                prom_type,
                help,
            });
        } else if let Some((_, id)) = EXPORTER_COUNTERS.iter().find(|(n, _)| *n == name) {
            set.exporter.push(Counter {
                field_id: *id,
                field_name: name,
                prom_type,
                help,
            });
        } else {
            return Err(ConfigError::UnknownField(name));
        }
    }

    if set.is_empty() {
        return Err(ConfigError::Invalid("counter catalogue is empty".into()));
    }
    Ok(set)
}
