//! Typed interface to the NVIDIA DCGM host engine.
//!
//! The engine is stateful and process-wide; it is initialized once and every
//! consumer holds an `Arc<dyn DcgmClient>` capability handle rather than
//! touching a global. The FFI-backed implementation lives out of tree; the
//! `mock` feature provides a scriptable in-memory engine for tests.

pub mod entity;
pub mod fields;
pub mod health;
#[cfg(feature = "mock")]
pub mod mock;
pub mod values;

pub use entity::{Entity, EntityId, EntityKind};
pub use fields::{FieldId, FieldMeta, FieldType};
pub use health::{HealthResponse, HealthResult, HealthSystem, Incident};
pub use values::{FieldValue, SampleValue};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DcgmError {
    /// The host engine connection is gone. Unrecoverable within this process;
    /// callers are expected to surface it to the top and exit non-zero.
    #[error("host engine connection is not valid")]
    ConnectionNotValid,
    #[error("no data is available yet for the request")]
    NoData,
    #[error("bad parameter: {0}")]
    BadParam(String),
    #[error("{op} failed: {msg}")]
    Api { op: &'static str, msg: String },
}

impl DcgmError {
    pub fn api(op: &'static str, msg: impl Into<String>) -> Self {
        DcgmError::Api {
            op,
            msg: msg.into(),
        }
    }
}

/// Engine-owned handle to a set of entities watched together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle(pub u64);

/// Engine-owned handle to a set of fields watched together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldGroupHandle(pub u64);

/// A physical GPU as enumerated by the engine, with any MIG children.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub index: u32,
    pub uuid: String,
    pub pci_bus_id: String,
    pub model: String,
    pub instances: Vec<GpuInstanceInfo>,
}

/// One MIG partition. `entity_id` addresses it at the engine; the NVML
/// instance id is what shows up in device plugins and `nvidia-smi`.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuInstanceInfo {
    pub entity_id: EntityId,
    pub nvml_instance_id: u32,
    pub profile_name: String,
    pub parent_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    NotSupported,
    Disabled,
    Down,
    Up,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub entity_id: EntityId,
    pub parent_switch: EntityId,
    pub state: LinkState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchInfo {
    pub entity_id: EntityId,
    pub links: Vec<LinkInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpuInfo {
    pub entity_id: EntityId,
    pub cores: Vec<EntityId>,
}

/// A reading attributed to the entity it came from, as returned by the
/// since-timestamp bulk read.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySample {
    pub entity: Entity,
    pub value: FieldValue,
}

/// NVLink peer-to-peer reachability. `gpus[i][j]` holds the status code for
/// the path from GPU index i to GPU index j; the diagonal is meaningless.
#[derive(Debug, Clone, PartialEq)]
pub struct P2pStatus {
    pub gpus: Vec<Vec<i64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2pLinkStatus {
    Ok,
    ChipsetNotSupported,
    TopologyNotSupported,
    DisabledByRegKey,
    NotSupported,
    Unknown,
}

impl P2pLinkStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => P2pLinkStatus::Ok,
            1 => P2pLinkStatus::ChipsetNotSupported,
            2 => P2pLinkStatus::TopologyNotSupported,
            3 => P2pLinkStatus::DisabledByRegKey,
            4 => P2pLinkStatus::NotSupported,
            _ => P2pLinkStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            P2pLinkStatus::Ok => "OK",
            P2pLinkStatus::ChipsetNotSupported => "CHIPSET_NOT_SUPPORTED",
            P2pLinkStatus::TopologyNotSupported => "TOPOLOGY_NOT_SUPPORTED",
            P2pLinkStatus::DisabledByRegKey => "DISABLED_BY_REG_KEY",
            P2pLinkStatus::NotSupported => "NOT_SUPPORTED",
            P2pLinkStatus::Unknown => "UNKNOWN",
        }
    }
}

/// Capability handle over one initialized host engine.
///
/// All calls are serialized per collector by the caller; the engine itself is
/// stateful per process. Watches established through this handle live until
/// the matching destroy call or engine shutdown.
pub trait DcgmClient: Send + Sync {
    // Enumeration.
    fn enumerate_gpus(&self) -> Result<Vec<DeviceInfo>, DcgmError>;
    fn enumerate_switches(&self) -> Result<Vec<SwitchInfo>, DcgmError>;
    fn enumerate_cpus(&self) -> Result<Vec<CpuInfo>, DcgmError>;

    /// Profiling fields the installed hardware can serve, across all metric
    /// groups. Empty when the profiling subsystem is unavailable.
    fn supported_profiling_fields(&self) -> Result<Vec<FieldId>, DcgmError>;

    // Entity groups.
    fn create_group(&self, name: &str) -> Result<GroupHandle, DcgmError>;
    fn add_entity_to_group(&self, group: GroupHandle, entity: Entity) -> Result<(), DcgmError>;
    fn add_link_to_group(
        &self,
        group: GroupHandle,
        parent_switch: EntityId,
        link_index: EntityId,
    ) -> Result<(), DcgmError>;
    fn destroy_group(&self, group: GroupHandle) -> Result<(), DcgmError>;
    fn group_entities(&self, group: GroupHandle) -> Result<Vec<Entity>, DcgmError>;

    // Field groups and watches.
    fn create_field_group(
        &self,
        name: &str,
        fields: &[FieldId],
    ) -> Result<FieldGroupHandle, DcgmError>;
    fn destroy_field_group(&self, handle: FieldGroupHandle) -> Result<(), DcgmError>;
    fn watch_fields_with_group(
        &self,
        fields: FieldGroupHandle,
        group: GroupHandle,
        update_interval_us: i64,
        max_keep_age_secs: f64,
        max_keep_samples: i32,
    ) -> Result<(), DcgmError>;
    fn update_all_fields(&self, wait_for_update: bool) -> Result<(), DcgmError>;

    // Reads.
    fn entity_latest_values(
        &self,
        kind: EntityKind,
        id: EntityId,
        fields: &[FieldId],
    ) -> Result<Vec<FieldValue>, DcgmError>;
    fn link_latest_values(
        &self,
        link_index: EntityId,
        parent_switch: EntityId,
        fields: &[FieldId],
    ) -> Result<Vec<FieldValue>, DcgmError>;
    /// Returns samples with engine timestamps at or after `since_us`, plus the
    /// cursor to pass on the next call.
    fn values_since(
        &self,
        group: GroupHandle,
        fields: FieldGroupHandle,
        since_us: i64,
    ) -> Result<(Vec<EntitySample>, i64), DcgmError>;

    // Health.
    fn health_watch_all(&self, group: GroupHandle) -> Result<(), DcgmError>;
    fn health_check(&self, group: GroupHandle) -> Result<HealthResponse, DcgmError>;

    // Topology.
    fn nvlink_p2p_status(&self) -> Result<P2pStatus, DcgmError>;
}
