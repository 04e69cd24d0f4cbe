//! Health subsystem types.

use crate::entity::Entity;

/// Subsystems covered by a health watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthSystem {
    Pcie,
    NvLink,
    Pmu,
    Mcu,
    Mem,
    Sm,
    Inforom,
    Thermal,
    Power,
    Driver,
}

impl HealthSystem {
    pub const ALL: [HealthSystem; 10] = [
        HealthSystem::Pcie,
        HealthSystem::NvLink,
        HealthSystem::Pmu,
        HealthSystem::Mcu,
        HealthSystem::Mem,
        HealthSystem::Sm,
        HealthSystem::Inforom,
        HealthSystem::Thermal,
        HealthSystem::Power,
        HealthSystem::Driver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthSystem::Pcie => "PCIE",
            HealthSystem::NvLink => "NVLINK",
            HealthSystem::Pmu => "PMU",
            HealthSystem::Mcu => "MCU",
            HealthSystem::Mem => "MEM",
            HealthSystem::Sm => "SM",
            HealthSystem::Inforom => "INFOROM",
            HealthSystem::Thermal => "THERMAL",
            HealthSystem::Power => "POWER",
            HealthSystem::Driver => "DRIVER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthResult {
    Pass,
    Warn,
    Fail,
}

impl HealthResult {
    /// Numeric encoding used on the wire: PASS=0, WARN=10, FAIL=20.
    pub fn as_code(&self) -> i64 {
        match self {
            HealthResult::Pass => 0,
            HealthResult::Warn => 10,
            HealthResult::Fail => 20,
        }
    }
}

/// One diagnosed problem on one (entity, system).
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub entity: Entity,
    pub system: HealthSystem,
    pub health: HealthResult,
    pub error_code: u32,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub overall: HealthResult,
    pub incidents: Vec<Incident>,
}

/// Engine diagnostic error codes that can accompany an incident. Codes not in
/// this table render as an empty name.
pub fn error_code_name(code: u32) -> Option<&'static str> {
    let name = match code {
        0 => "DCGM_FR_OK",
        1 => "DCGM_FR_UNKNOWN",
        2 => "DCGM_FR_UNRECOGNIZED",
        3 => "DCGM_FR_PCI_REPLAY_RATE",
        4 => "DCGM_FR_VOLATILE_DBE_DETECTED",
        5 => "DCGM_FR_VOLATILE_SBE_DETECTED",
        6 => "DCGM_FR_PENDING_PAGE_RETIREMENTS",
        7 => "DCGM_FR_RETIRED_PAGES_LIMIT",
        8 => "DCGM_FR_RETIRED_PAGES_DBE_LIMIT",
        9 => "DCGM_FR_CORRUPT_INFOROM",
        10 => "DCGM_FR_CLOCKS_EVENT_THERMAL",
        11 => "DCGM_FR_POWER_UNREADABLE",
        12 => "DCGM_FR_CLOCKS_EVENT_POWER",
        13 => "DCGM_FR_NVLINK_ERROR_THRESHOLD",
        14 => "DCGM_FR_NVLINK_DOWN",
        15 => "DCGM_FR_NVSWITCH_FATAL_ERROR",
        16 => "DCGM_FR_NVSWITCH_NON_FATAL_ERROR",
        17 => "DCGM_FR_NVSWITCH_DOWN",
        18 => "DCGM_FR_NO_ACCESS_TO_FILE",
        19 => "DCGM_FR_NVML_API",
        20 => "DCGM_FR_DEVICE_COUNT_MISMATCH",
        21 => "DCGM_FR_BAD_PARAMETER",
        22 => "DCGM_FR_CANNOT_OPEN_LIB",
        30 => "DCGM_FR_XID_ERROR",
        31 => "DCGM_FR_ILLEGAL_XID",
        40 => "DCGM_FR_UNCONTAINED_ERROR",
        41 => "DCGM_FR_ROW_REMAP_FAILURE",
        42 => "DCGM_FR_PENDING_ROW_REMAP",
        50 => "DCGM_FR_THERMAL_VIOLATIONS",
        51 => "DCGM_FR_THERMAL_VIOLATIONS_TS",
        52 => "DCGM_FR_TEMP_VIOLATION",
        60 => "DCGM_FR_PCIE_GENERATION",
        61 => "DCGM_FR_PCIE_WIDTH",
        70 => "DCGM_FR_ECC_UNSUPPORTED",
        71 => "DCGM_FR_ECC_PENDING",
        80 => "DCGM_FR_MEMORY_NEGATIVE_ALLOCATION",
        _ => return None,
    };
    Some(name)
}
