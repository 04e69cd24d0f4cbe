//! Parsing of kubelet device id conventions.
//!
//! Device plugins encode partitioning and time-slicing into the id string;
//! the shapes below are tried in order and the first match wins.

/// A structurally-decoded device id.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceIdForm {
    /// `MIG-<parentUuid>/<gi>/<ci>` or the opaque `MIG-<uuid>` spelling.
    Mig {
        parent_uuid: String,
        gpu_instance_id: Option<u32>,
    },
    /// GKE MIG: `nvidia<N>/gi<M>`, optionally with a `/vgpu<K>` tail.
    GkeMig {
        gpu_index: u32,
        instance_id: u32,
        vgpu: Option<String>,
    },
    /// GKE time-slicing: `<id>/vgpu<K>`.
    TimeShared { id: String, vgpu: String },
    /// NVIDIA device-plugin replicas: `<id>::<replica>`.
    Replica { id: String, vgpu: String },
    /// Anything else is an opaque id matched verbatim.
    Plain(String),
}

pub fn parse_device_id(raw: &str) -> DeviceIdForm {
    if let Some(rest) = raw.strip_prefix("MIG-") {
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() >= 2 {
            if let Ok(gi) = parts[1].parse::<u32>() {
                return DeviceIdForm::Mig {
                    parent_uuid: parts[0].to_string(),
                    gpu_instance_id: Some(gi),
                };
            }
        }
        return DeviceIdForm::Mig {
            parent_uuid: rest.to_string(),
            gpu_instance_id: None,
        };
    }

    let parts: Vec<&str> = raw.split('/').collect();
    if parts.len() >= 2 {
        if let (Some(index), Some(gi)) = (
            suffix_number(parts[0], "nvidia"),
            suffix_number(parts[1], "gi"),
        ) {
            let vgpu = parts
                .get(2)
                .and_then(|p| p.strip_prefix("vgpu"))
                .map(str::to_string);
            return DeviceIdForm::GkeMig {
                gpu_index: index,
                instance_id: gi,
                vgpu,
            };
        }
        if let Some(vgpu) = parts[1].strip_prefix("vgpu") {
            return DeviceIdForm::TimeShared {
                id: parts[0].to_string(),
                vgpu: vgpu.to_string(),
            };
        }
    }

    if let Some((id, replica)) = raw.split_once("::") {
        return DeviceIdForm::Replica {
            id: id.to_string(),
            vgpu: replica.to_string(),
        };
    }

    DeviceIdForm::Plain(raw.to_string())
}

fn suffix_number(s: &str, prefix: &str) -> Option<u32> {
    s.strip_prefix(prefix).and_then(|n| n.parse().ok())
}
