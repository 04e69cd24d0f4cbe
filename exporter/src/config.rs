//! Flags and runtime configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::error::ConfigError;

/// Which identifier the pod mapper matches against kubelet device ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuIdType {
    /// GPU UUID, or `<gpuIndex>-<instanceId>` for MIG partitions.
    Uid,
    /// The `nvidia<N>` device slug.
    DeviceName,
}

impl GpuIdType {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "uid" => Ok(GpuIdType::Uid),
            "device-name" => Ok(GpuIdType::DeviceName),
            other => Err(ConfigError::Invalid(format!(
                "unknown gpu id type '{other}' (expected 'uid' or 'device-name')"
            ))),
        }
    }
}

/// Which devices of one entity family to monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOptions {
    /// Every device; partitioned GPUs contribute their partitions instead of
    /// the flat device.
    Flex,
    /// Explicit index ranges. `None` in a range slot means "all of that
    /// level"; an empty list means "none of that level".
    Ranged {
        major: Option<Vec<u32>>,
        minor: Option<Vec<u32>>,
    },
}

impl DeviceOptions {
    pub fn all() -> Self {
        DeviceOptions::Ranged {
            major: None,
            minor: None,
        }
    }

    /// Flag grammar: `f` for flex; otherwise `g[:list]`, `i[:list]`, or
    /// `g[:list]+i[:list]` where a list is comma-separated indices and
    /// `a-b` spans. A bare `g` or `i` means all of that level.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ConfigError::Invalid("empty device option".into()));
        }
        if spec == "f" {
            return Ok(DeviceOptions::Flex);
        }

        let mut major = Some(Vec::new());
        let mut minor = Some(Vec::new());
        for part in spec.split('+') {
            let (level, list) = match part.split_once(':') {
                Some((level, list)) => (level, Some(list)),
                None => (part, None),
            };
            let parsed = match list {
                Some(list) => Some(parse_range_list(list)?),
                None => None,
            };
            match level {
                "g" => major = parsed,
                "i" => minor = parsed,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unknown device level '{other}' in '{spec}'"
                    )))
                }
            }
        }
        Ok(DeviceOptions::Ranged { major, minor })
    }

    pub fn is_flex(&self) -> bool {
        matches!(self, DeviceOptions::Flex)
    }
}

fn parse_range_list(list: &str) -> Result<Vec<u32>, ConfigError> {
    let mut out = Vec::new();
    for piece in list.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        match piece.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| bad_range(piece))?;
                let hi: u32 = hi.trim().parse().map_err(|_| bad_range(piece))?;
                if hi < lo {
                    return Err(bad_range(piece));
                }
                out.extend(lo..=hi);
            }
            None => out.push(piece.parse().map_err(|_| bad_range(piece))?),
        }
    }
    Ok(out)
}

fn bad_range(piece: &str) -> ConfigError {
    ConfigError::Invalid(format!("bad device range '{piece}'"))
}

#[derive(Debug, Parser)]
#[command(name = "dcgm-exporter", about = "DCGM metrics exporter for Prometheus")]
pub struct Args {
    /// CSV file naming the counters to export.
    #[arg(short = 'f', long = "collectors", env = "DCGM_EXPORTER_COLLECTORS")]
    pub collectors_file: Option<PathBuf>,

    /// Read the counter CSV from a ConfigMap instead, as `namespace:name`.
    #[arg(long = "configmap-data", env = "DCGM_EXPORTER_CONFIGMAP_DATA")]
    pub configmap_data: Option<String>,

    /// Listen address for the metrics endpoint.
    #[arg(short = 'a', long = "address", env = "DCGM_EXPORTER_LISTEN", default_value = "0.0.0.0:9400")]
    pub address: String,

    /// Field update interval handed to the engine, milliseconds.
    #[arg(short = 'c', long = "collect-interval", env = "DCGM_EXPORTER_INTERVAL", default_value_t = 30_000)]
    pub collect_interval_ms: u64,

    /// GPU devices to monitor: `f`, `g[:list]`, `i[:list]`, or `g:..+i:..`.
    #[arg(short = 'd', long = "devices", env = "DCGM_EXPORTER_DEVICES", default_value = "f")]
    pub gpu_devices: String,

    /// NVSwitch devices to monitor (same grammar; `i` selects links).
    #[arg(long = "switch-devices", env = "DCGM_EXPORTER_OTHER_DEVICES", default_value = "f")]
    pub switch_devices: String,

    /// CPUs to monitor (same grammar; `i` selects cores).
    #[arg(long = "cpu-devices", env = "DCGM_EXPORTER_CPU_DEVICES", default_value = "f")]
    pub cpu_devices: String,

    /// Sliding window for the clock-events counter, milliseconds.
    #[arg(long = "clock-events-window", env = "DCGM_EXPORTER_CLOCK_EVENTS_WINDOW", default_value_t = 15_000)]
    pub clock_events_window_ms: u64,

    /// Sliding window for the XID-errors counter, milliseconds.
    #[arg(long = "xid-count-window", env = "DCGM_EXPORTER_XID_COUNT_WINDOW", default_value_t = 15_000)]
    pub xid_window_ms: u64,

    /// Collect profiling-range fields when the hardware supports them.
    #[arg(long = "collect-dcp", env = "DCGM_EXPORTER_COLLECT_DCP", default_value_t = true)]
    pub collect_profiling: bool,

    /// Attribute metrics to Kubernetes pods via the kubelet socket.
    #[arg(short = 'k', long = "kubernetes", env = "DCGM_EXPORTER_KUBERNETES")]
    pub kubernetes: bool,

    /// Kubelet pod-resources socket path.
    #[arg(long = "pod-resources-socket", env = "DCGM_POD_RESOURCES_SOCKET", default_value = "/var/lib/kubelet/pod-resources/kubelet.sock")]
    pub pod_resources_socket: PathBuf,

    /// Identifier used to match kubelet device ids: `uid` or `device-name`.
    #[arg(long = "kubernetes-gpu-id-type", env = "DCGM_EXPORTER_KUBERNETES_GPU_ID_TYPE", default_value = "uid")]
    pub kubernetes_gpu_id_type: String,

    /// Fan metrics out per pod when GPUs are time-shared.
    #[arg(long = "kubernetes-virtual-gpus", env = "DCGM_EXPORTER_KUBERNETES_VIRTUAL_GPUS")]
    pub kubernetes_virtual_gpus: bool,

    /// Attribute devices handed out through DRA claims.
    #[arg(long = "dra", env = "DCGM_EXPORTER_DRA")]
    pub dra: bool,

    /// DRA driver whose claims belong to this exporter.
    #[arg(long = "dra-driver", env = "DCGM_EXPORTER_DRA_DRIVER", default_value = "gpu.nvidia.com")]
    pub dra_driver: String,

    /// Copy pod labels onto metrics (needs API server access).
    #[arg(long = "kubernetes-enable-pod-labels", env = "DCGM_EXPORTER_ENABLE_POD_LABELS")]
    pub kubernetes_pod_labels: bool,

    /// Extra resource names to treat as GPUs, comma separated.
    #[arg(long = "nvidia-resource-names", env = "NVIDIA_RESOURCE_NAMES", value_delimiter = ',')]
    pub nvidia_resource_names: Vec<String>,

    /// Use the pre-1.0 attribute names (exported_pod and friends).
    #[arg(long = "use-old-namespace", env = "DCGM_EXPORTER_USE_OLD_NAMESPACE")]
    pub use_old_namespace: bool,

    /// Number of synthetic GPUs when running with the fake engine build.
    #[cfg(feature = "fake-engine")]
    #[arg(long = "fake-gpus", default_value_t = 2)]
    pub fake_gpus: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub counters_source: CountersSource,
    pub address: String,
    pub collect_interval_ms: u64,
    pub gpu_devices: DeviceOptions,
    pub switch_devices: DeviceOptions,
    pub cpu_devices: DeviceOptions,
    pub clock_events_window_ms: u64,
    pub xid_window_ms: u64,
    pub collect_profiling: bool,
    pub kubernetes: bool,
    pub pod_resources_socket: PathBuf,
    pub kubernetes_gpu_id_type: GpuIdType,
    pub kubernetes_virtual_gpus: bool,
    pub dra: bool,
    pub dra_driver: String,
    pub kubernetes_pod_labels: bool,
    pub nvidia_resource_names: Vec<String>,
    pub use_old_namespace: bool,
    pub hostname: String,
}

#[derive(Debug, Clone)]
pub enum CountersSource {
    File(PathBuf),
    ConfigMap { namespace: String, name: String },
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let counters_source = match (&args.collectors_file, &args.configmap_data) {
            (Some(path), None) => CountersSource::File(path.clone()),
            (None, Some(reference)) => {
                let (namespace, name) = reference.split_once(':').ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "configmap reference '{reference}' is not namespace:name"
                    ))
                })?;
                if namespace.is_empty() || name.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "configmap reference '{reference}' is not namespace:name"
                    )));
                }
                CountersSource::ConfigMap {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
            }
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "--collectors and --configmap-data are mutually exclusive".into(),
                ))
            }
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "one of --collectors or --configmap-data is required".into(),
                ))
            }
        };

        if args.dra && args.kubernetes_virtual_gpus {
            return Err(ConfigError::Invalid(
                "--dra and --kubernetes-virtual-gpus are mutually exclusive".into(),
            ));
        }
        if args.collect_interval_ms == 0 {
            return Err(ConfigError::Invalid("--collect-interval must be positive".into()));
        }

        Ok(Config {
            counters_source,
            address: args.address.clone(),
            collect_interval_ms: args.collect_interval_ms,
            gpu_devices: DeviceOptions::parse(&args.gpu_devices)?,
            switch_devices: DeviceOptions::parse(&args.switch_devices)?,
            cpu_devices: DeviceOptions::parse(&args.cpu_devices)?,
            clock_events_window_ms: args.clock_events_window_ms,
            xid_window_ms: args.xid_window_ms,
            collect_profiling: args.collect_profiling,
            kubernetes: args.kubernetes,
            pod_resources_socket: args.pod_resources_socket.clone(),
            kubernetes_gpu_id_type: GpuIdType::parse(&args.kubernetes_gpu_id_type)?,
            kubernetes_virtual_gpus: args.kubernetes_virtual_gpus,
            dra: args.dra,
            dra_driver: args.dra_driver.clone(),
            kubernetes_pod_labels: args.kubernetes_pod_labels,
            nvidia_resource_names: args.nvidia_resource_names.clone(),
            use_old_namespace: args.use_old_namespace,
            hostname: resolve_hostname(),
        })
    }
}

/// Node name per the downward API when set, the kernel hostname otherwise.
pub fn resolve_hostname() -> String {
    if let Ok(name) = std::env::var("NODE_NAME") {
        if !name.is_empty() {
            return name;
        }
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
