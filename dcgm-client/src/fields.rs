//! The host engine's field catalogue.
//!
//! Fields are identified by a 16-bit id shared with the engine. The table
//! below mirrors the engine's own field index for the fields the exporter can
//! be asked to watch; lookup is by name (including renamed legacy spellings)
//! or by id.

use once_cell::sync::Lazy;
use std::collections::HashMap;

pub type FieldId = u16;

/// Profiling fields live in a dedicated id range and need the profiling
/// subsystem enabled before they can be watched.
pub const PROF_FIELD_FIRST: FieldId = 1000;
pub const PROF_FIELD_LAST: FieldId = 1100;

pub fn is_profiling_field(id: FieldId) -> bool {
    (PROF_FIELD_FIRST..PROF_FIELD_LAST).contains(&id)
}

// Ids referenced directly by the exporter.
pub const DCGM_FI_DRIVER_VERSION: FieldId = 1;
pub const DCGM_FI_DEV_UUID: FieldId = 54;
pub const DCGM_FI_DEV_CLOCKS_EVENT_REASONS: FieldId = 112;
pub const DCGM_FI_DEV_XID_ERRORS: FieldId = 230;
pub const DCGM_FI_DEV_CPU_UTIL_TOTAL: FieldId = 1132;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int64,
    Double,
    Str,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub id: FieldId,
    pub name: &'static str,
    pub field_type: FieldType,
}

macro_rules! field {
    ($id:expr, $name:literal, $ty:ident) => {
        FieldMeta {
            id: $id,
            name: $name,
            field_type: FieldType::$ty,
        }
    };
}

#[rustfmt::skip]
static FIELDS: &[FieldMeta] = &[
    // Identification.
    field!(1,    "DCGM_FI_DRIVER_VERSION", Str),
    field!(2,    "DCGM_FI_NVML_VERSION", Str),
    field!(3,    "DCGM_FI_PROCESS_NAME", Str),
    field!(4,    "DCGM_FI_DEV_COUNT", Int64),
    field!(5,    "DCGM_FI_CUDA_DRIVER_VERSION", Int64),
    field!(50,   "DCGM_FI_DEV_NAME", Str),
    field!(51,   "DCGM_FI_DEV_BRAND", Str),
    field!(52,   "DCGM_FI_DEV_NVML_INDEX", Int64),
    field!(53,   "DCGM_FI_DEV_SERIAL", Str),
    field!(54,   "DCGM_FI_DEV_UUID", Str),
    field!(55,   "DCGM_FI_DEV_MINOR_NUMBER", Int64),
    field!(56,   "DCGM_FI_DEV_OEM_INFOROM_VER", Str),
    field!(57,   "DCGM_FI_DEV_PCI_BUSID", Str),
    field!(58,   "DCGM_FI_DEV_PCI_COMBINED_ID", Int64),
    field!(59,   "DCGM_FI_DEV_PCI_SUBSYS_ID", Int64),
    field!(65,   "DCGM_FI_DEV_COMPUTE_MODE", Int64),
    field!(66,   "DCGM_FI_DEV_PERSISTENCE_MODE", Int64),
    field!(67,   "DCGM_FI_DEV_MIG_MODE", Int64),
    field!(78,   "DCGM_FI_DEV_VBIOS_VERSION", Str),
    field!(80,   "DCGM_FI_DEV_INFOROM_IMAGE_VER", Str),
    field!(81,   "DCGM_FI_DEV_INFOROM_CONFIG_CHECK", Int64),
    // Clocks.
    field!(100,  "DCGM_FI_DEV_SM_CLOCK", Int64),
    field!(101,  "DCGM_FI_DEV_MEM_CLOCK", Int64),
    field!(102,  "DCGM_FI_DEV_VIDEO_CLOCK", Int64),
    field!(110,  "DCGM_FI_DEV_APP_SM_CLOCK", Int64),
    field!(111,  "DCGM_FI_DEV_APP_MEM_CLOCK", Int64),
    field!(112,  "DCGM_FI_DEV_CLOCKS_EVENT_REASONS", Int64),
    field!(113,  "DCGM_FI_DEV_MAX_SM_CLOCK", Int64),
    field!(114,  "DCGM_FI_DEV_MAX_MEM_CLOCK", Int64),
    field!(115,  "DCGM_FI_DEV_MAX_VIDEO_CLOCK", Int64),
    field!(120,  "DCGM_FI_DEV_AUTOBOOST", Int64),
    // Thermals and power.
    field!(140,  "DCGM_FI_DEV_MEMORY_TEMP", Int64),
    field!(150,  "DCGM_FI_DEV_GPU_TEMP", Int64),
    field!(151,  "DCGM_FI_DEV_MEM_MAX_OP_TEMP", Int64),
    field!(152,  "DCGM_FI_DEV_GPU_MAX_OP_TEMP", Int64),
    field!(155,  "DCGM_FI_DEV_POWER_USAGE", Double),
    field!(156,  "DCGM_FI_DEV_TOTAL_ENERGY_CONSUMPTION", Int64),
    field!(158,  "DCGM_FI_DEV_SLOWDOWN_TEMP", Int64),
    field!(159,  "DCGM_FI_DEV_SHUTDOWN_TEMP", Int64),
    field!(160,  "DCGM_FI_DEV_POWER_MGMT_LIMIT", Double),
    field!(161,  "DCGM_FI_DEV_POWER_MGMT_LIMIT_MIN", Double),
    field!(162,  "DCGM_FI_DEV_POWER_MGMT_LIMIT_MAX", Double),
    field!(163,  "DCGM_FI_DEV_POWER_MGMT_LIMIT_DEF", Double),
    field!(164,  "DCGM_FI_DEV_ENFORCED_POWER_LIMIT", Double),
    field!(190,  "DCGM_FI_DEV_PSTATE", Int64),
    field!(191,  "DCGM_FI_DEV_FAN_SPEED", Int64),
    // PCIe and utilization.
    field!(200,  "DCGM_FI_DEV_PCIE_TX_THROUGHPUT", Int64),
    field!(201,  "DCGM_FI_DEV_PCIE_RX_THROUGHPUT", Int64),
    field!(202,  "DCGM_FI_DEV_PCIE_REPLAY_COUNTER", Int64),
    field!(203,  "DCGM_FI_DEV_GPU_UTIL", Int64),
    field!(204,  "DCGM_FI_DEV_MEM_COPY_UTIL", Int64),
    field!(206,  "DCGM_FI_DEV_ENC_UTIL", Int64),
    field!(207,  "DCGM_FI_DEV_DEC_UTIL", Int64),
    field!(230,  "DCGM_FI_DEV_XID_ERRORS", Int64),
    field!(235,  "DCGM_FI_DEV_PCIE_MAX_LINK_GEN", Int64),
    field!(236,  "DCGM_FI_DEV_PCIE_MAX_LINK_WIDTH", Int64),
    field!(237,  "DCGM_FI_DEV_PCIE_LINK_GEN", Int64),
    field!(238,  "DCGM_FI_DEV_PCIE_LINK_WIDTH", Int64),
    // Violation counters.
    field!(240,  "DCGM_FI_DEV_POWER_VIOLATION", Int64),
    field!(241,  "DCGM_FI_DEV_THERMAL_VIOLATION", Int64),
    field!(242,  "DCGM_FI_DEV_SYNC_BOOST_VIOLATION", Int64),
    field!(243,  "DCGM_FI_DEV_BOARD_LIMIT_VIOLATION", Int64),
    field!(244,  "DCGM_FI_DEV_LOW_UTIL_VIOLATION", Int64),
    field!(245,  "DCGM_FI_DEV_RELIABILITY_VIOLATION", Int64),
    // Framebuffer.
    field!(250,  "DCGM_FI_DEV_FB_TOTAL", Int64),
    field!(251,  "DCGM_FI_DEV_FB_FREE", Int64),
    field!(252,  "DCGM_FI_DEV_FB_USED", Int64),
    field!(253,  "DCGM_FI_DEV_FB_RESERVED", Int64),
    field!(254,  "DCGM_FI_DEV_FB_USED_PERCENT", Double),
    // ECC.
    field!(300,  "DCGM_FI_DEV_ECC_CURRENT", Int64),
    field!(301,  "DCGM_FI_DEV_ECC_PENDING", Int64),
    field!(310,  "DCGM_FI_DEV_ECC_SBE_VOL_TOTAL", Int64),
    field!(311,  "DCGM_FI_DEV_ECC_DBE_VOL_TOTAL", Int64),
    field!(312,  "DCGM_FI_DEV_ECC_SBE_AGG_TOTAL", Int64),
    field!(313,  "DCGM_FI_DEV_ECC_DBE_AGG_TOTAL", Int64),
    // Retired and remapped rows.
    field!(390,  "DCGM_FI_DEV_RETIRED_SBE", Int64),
    field!(391,  "DCGM_FI_DEV_RETIRED_DBE", Int64),
    field!(392,  "DCGM_FI_DEV_RETIRED_PENDING", Int64),
    field!(393,  "DCGM_FI_DEV_UNCORRECTABLE_REMAPPED_ROWS", Int64),
    field!(394,  "DCGM_FI_DEV_CORRECTABLE_REMAPPED_ROWS", Int64),
    field!(395,  "DCGM_FI_DEV_ROW_REMAP_FAILURE", Int64),
    field!(396,  "DCGM_FI_DEV_ROW_REMAP_PENDING", Int64),
    // NVLink totals per GPU.
    field!(409,  "DCGM_FI_DEV_NVLINK_CRC_FLIT_ERROR_COUNT_TOTAL", Int64),
    field!(419,  "DCGM_FI_DEV_NVLINK_CRC_DATA_ERROR_COUNT_TOTAL", Int64),
    field!(429,  "DCGM_FI_DEV_NVLINK_REPLAY_ERROR_COUNT_TOTAL", Int64),
    field!(439,  "DCGM_FI_DEV_NVLINK_RECOVERY_ERROR_COUNT_TOTAL", Int64),
    field!(449,  "DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL", Int64),
    // NVSwitch, per switch.
    field!(701,  "DCGM_FI_DEV_NVSWITCH_VOLTAGE_MVOLT", Int64),
    field!(702,  "DCGM_FI_DEV_NVSWITCH_CURRENT_IDDQ", Int64),
    field!(705,  "DCGM_FI_DEV_NVSWITCH_POWER_VDD", Int64),
    field!(708,  "DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT", Int64),
    field!(709,  "DCGM_FI_DEV_NVSWITCH_TEMPERATURE_LIMIT_SLOWDOWN", Int64),
    field!(710,  "DCGM_FI_DEV_NVSWITCH_TEMPERATURE_LIMIT_SHUTDOWN", Int64),
    field!(711,  "DCGM_FI_DEV_NVSWITCH_THROUGHPUT_TX", Int64),
    field!(712,  "DCGM_FI_DEV_NVSWITCH_THROUGHPUT_RX", Int64),
    field!(713,  "DCGM_FI_DEV_NVSWITCH_FATAL_ERRORS", Int64),
    field!(714,  "DCGM_FI_DEV_NVSWITCH_NON_FATAL_ERRORS", Int64),
    // NVSwitch, per link.
    field!(780,  "DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX", Int64),
    field!(781,  "DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_RX", Int64),
    field!(782,  "DCGM_FI_DEV_NVSWITCH_LINK_FATAL_ERRORS", Int64),
    field!(783,  "DCGM_FI_DEV_NVSWITCH_LINK_NON_FATAL_ERRORS", Int64),
    field!(784,  "DCGM_FI_DEV_NVSWITCH_LINK_REPLAY_ERRORS", Int64),
    field!(785,  "DCGM_FI_DEV_NVSWITCH_LINK_RECOVERY_ERRORS", Int64),
    field!(786,  "DCGM_FI_DEV_NVSWITCH_LINK_CRC_ERRORS", Int64),
    // Profiling.
    field!(1001, "DCGM_FI_PROF_GR_ENGINE_ACTIVE", Double),
    field!(1002, "DCGM_FI_PROF_SM_ACTIVE", Double),
    field!(1003, "DCGM_FI_PROF_SM_OCCUPANCY", Double),
    field!(1004, "DCGM_FI_PROF_PIPE_TENSOR_ACTIVE", Double),
    field!(1005, "DCGM_FI_PROF_DRAM_ACTIVE", Double),
    field!(1006, "DCGM_FI_PROF_PIPE_FP64_ACTIVE", Double),
    field!(1007, "DCGM_FI_PROF_PIPE_FP32_ACTIVE", Double),
    field!(1008, "DCGM_FI_PROF_PIPE_FP16_ACTIVE", Double),
    field!(1009, "DCGM_FI_PROF_PCIE_TX_BYTES", Int64),
    field!(1010, "DCGM_FI_PROF_PCIE_RX_BYTES", Int64),
    field!(1011, "DCGM_FI_PROF_NVLINK_TX_BYTES", Int64),
    field!(1012, "DCGM_FI_PROF_NVLINK_RX_BYTES", Int64),
    // Grace CPUs, per CPU or per core.
    field!(1132, "DCGM_FI_DEV_CPU_UTIL_TOTAL", Double),
    field!(1133, "DCGM_FI_DEV_CPU_UTIL_USER", Double),
    field!(1134, "DCGM_FI_DEV_CPU_UTIL_NICE", Double),
    field!(1135, "DCGM_FI_DEV_CPU_UTIL_SYS", Double),
    field!(1136, "DCGM_FI_DEV_CPU_UTIL_IRQ", Double),
    field!(1140, "DCGM_FI_DEV_CPU_TEMP_CURRENT", Double),
    field!(1147, "DCGM_FI_DEV_CPU_CLOCK_CURRENT", Int64),
    field!(1150, "DCGM_FI_DEV_CPU_POWER_UTIL_CURRENT", Double),
    field!(1151, "DCGM_FI_DEV_CPU_POWER_LIMIT", Double),
    field!(1160, "DCGM_FI_DEV_CPU_VENDOR", Str),
    field!(1161, "DCGM_FI_DEV_CPU_MODEL", Str),
];

// Spellings from older engine releases that still resolve.
static LEGACY_NAMES: &[(&str, FieldId)] = &[
    ("DCGM_FI_DEV_CLOCK_THROTTLE_REASONS", DCGM_FI_DEV_CLOCKS_EVENT_REASONS),
];

static BY_NAME: Lazy<HashMap<&'static str, &'static FieldMeta>> = Lazy::new(|| {
    let mut map = HashMap::with_capacity(FIELDS.len() + LEGACY_NAMES.len());
    for meta in FIELDS {
        map.insert(meta.name, meta);
    }
    for (alias, id) in LEGACY_NAMES {
        if let Some(meta) = FIELDS.iter().find(|m| m.id == *id) {
            map.insert(*alias, meta);
        }
    }
    map
});

static BY_ID: Lazy<HashMap<FieldId, &'static FieldMeta>> =
    Lazy::new(|| FIELDS.iter().map(|m| (m.id, m)).collect());

/// Resolve a field by its catalogue name, accepting legacy spellings.
pub fn field_by_name(name: &str) -> Option<&'static FieldMeta> {
    BY_NAME.get(name).copied()
}

pub fn field_by_id(id: FieldId) -> Option<&'static FieldMeta> {
    BY_ID.get(&id).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_and_id_agree() {
        let by_name = field_by_name("DCGM_FI_DEV_GPU_TEMP").unwrap();
        let by_id = field_by_id(by_name.id).unwrap();
        assert_eq!(by_name.name, by_id.name);
        assert_eq!(by_id.field_type, FieldType::Int64);
    }

    #[test]
    fn legacy_spelling_resolves_to_renamed_field() {
        let legacy = field_by_name("DCGM_FI_DEV_CLOCK_THROTTLE_REASONS").unwrap();
        assert_eq!(legacy.id, DCGM_FI_DEV_CLOCKS_EVENT_REASONS);
        assert_eq!(legacy.name, "DCGM_FI_DEV_CLOCKS_EVENT_REASONS");
    }

    #[test]
    fn unknown_name_is_none() {
        assert!(field_by_name("DCGM_FI_DEV_DOES_NOT_EXIST").is_none());
    }

    #[test]
    fn profiling_range_is_half_open() {
        assert!(is_profiling_field(1001));
        assert!(is_profiling_field(1000));
        assert!(!is_profiling_field(1100));
        assert!(!is_profiling_field(DCGM_FI_DEV_CPU_UTIL_TOTAL));
        assert!(!is_profiling_field(DCGM_FI_DEV_XID_ERRORS));
    }

    #[test]
    fn field_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for meta in super::FIELDS {
            assert!(seen.insert(meta.id), "duplicate field id {}", meta.id);
        }
    }
}
