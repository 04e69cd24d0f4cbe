//! Entity addressing for the host engine.
//!
//! Every monitorable object is a (kind, id) pair. Links and CPU cores are
//! addressed relative to a parent switch or CPU; the parent id travels
//! alongside the entity where a call needs it, never inside it.

use std::fmt;

pub type EntityId = u32;

/// The closed set of entity kinds the host engine can monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Gpu,
    GpuInstance,
    Switch,
    Link,
    Cpu,
    CpuCore,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Gpu => "GPU",
            EntityKind::GpuInstance => "GPU_I",
            EntityKind::Switch => "SWITCH",
            EntityKind::Link => "LINK",
            EntityKind::Cpu => "CPU",
            EntityKind::CpuCore => "CPU_CORE",
        }
    }

    /// Kinds that are children of another kind.
    pub fn parent_kind(&self) -> Option<EntityKind> {
        match self {
            EntityKind::GpuInstance => Some(EntityKind::Gpu),
            EntityKind::Link => Some(EntityKind::Switch),
            EntityKind::CpuCore => Some(EntityKind::Cpu),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl Entity {
    pub fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
