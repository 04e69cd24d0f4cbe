//! Scriptable in-memory host engine.
//!
//! Tests construct a `MockDcgm`, script a topology and readings onto it, and
//! hand it to the exporter as `Arc<dyn DcgmClient>`. Bookkeeping of groups,
//! field groups, watches, and destroy ordering is kept so tests can assert
//! on resource discipline as well as on values.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::entity::{Entity, EntityId, EntityKind};
use crate::fields::FieldId;
use crate::health::{HealthResponse, HealthResult};
use crate::values::FieldValue;
use crate::{
    CpuInfo, DcgmClient, DcgmError, DeviceInfo, EntitySample, FieldGroupHandle, GpuInstanceInfo,
    GroupHandle, LinkInfo, LinkState, P2pStatus, SwitchInfo,
};

#[derive(Debug, Clone, PartialEq)]
pub struct WatchCall {
    pub fields: FieldGroupHandle,
    pub group: GroupHandle,
    pub update_interval_us: i64,
    pub max_keep_age_secs: f64,
    pub max_keep_samples: i32,
}

#[derive(Default)]
struct State {
    gpus: Vec<DeviceInfo>,
    switches: Vec<SwitchInfo>,
    cpus: Vec<CpuInfo>,

    next_handle: u64,
    groups: HashMap<GroupHandle, Vec<Entity>>,
    field_groups: HashMap<FieldGroupHandle, Vec<FieldId>>,
    destroy_order: Vec<String>,
    watches: Vec<WatchCall>,
    update_all_calls: u32,

    profiling_fields: Vec<FieldId>,

    // Keyed by (kind, parent id or 0, entity id, field).
    latest: HashMap<(EntityKind, EntityId, EntityId, FieldId), FieldValue>,
    samples: Vec<EntitySample>,
    health: Option<HealthResponse>,
    health_watched: Vec<GroupHandle>,
    p2p: Option<Vec<Vec<i64>>>,

    connection_lost: bool,
    fail_values_since: bool,
    fail_health: bool,
    fail_field_group_create: bool,
}

pub struct MockDcgm {
    state: Mutex<State>,
}

impl Default for MockDcgm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDcgm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    // -- scripting ---------------------------------------------------------

    pub fn add_gpu(&self, index: u32, uuid: &str, pci_bus_id: &str, model: &str) {
        self.state.lock().unwrap().gpus.push(DeviceInfo {
            index,
            uuid: uuid.to_string(),
            pci_bus_id: pci_bus_id.to_string(),
            model: model.to_string(),
            instances: Vec::new(),
        });
    }

    pub fn add_gpu_instance(
        &self,
        gpu_index: u32,
        entity_id: EntityId,
        nvml_instance_id: u32,
        profile_name: &str,
    ) {
        let mut st = self.state.lock().unwrap();
        let gpu = st
            .gpus
            .iter_mut()
            .find(|g| g.index == gpu_index)
            .expect("scripted instance for unknown GPU");
        gpu.instances.push(GpuInstanceInfo {
            entity_id,
            nvml_instance_id,
            profile_name: profile_name.to_string(),
            parent_index: gpu_index,
        });
    }

    pub fn add_switch(&self, entity_id: EntityId, links: &[(EntityId, LinkState)]) {
        self.state.lock().unwrap().switches.push(SwitchInfo {
            entity_id,
            links: links
                .iter()
                .map(|(id, state)| LinkInfo {
                    entity_id: *id,
                    parent_switch: entity_id,
                    state: *state,
                })
                .collect(),
        });
    }

    pub fn add_cpu(&self, entity_id: EntityId, cores: &[EntityId]) {
        self.state.lock().unwrap().cpus.push(CpuInfo {
            entity_id,
            cores: cores.to_vec(),
        });
    }

    pub fn set_profiling_fields(&self, fields: &[FieldId]) {
        self.state.lock().unwrap().profiling_fields = fields.to_vec();
    }

    pub fn set_latest(&self, kind: EntityKind, id: EntityId, value: FieldValue) {
        self.state
            .lock()
            .unwrap()
            .latest
            .insert((kind, 0, id, value.field_id), value);
    }

    pub fn set_link_latest(&self, parent_switch: EntityId, link: EntityId, value: FieldValue) {
        self.state
            .lock()
            .unwrap()
            .latest
            .insert((EntityKind::Link, parent_switch, link, value.field_id), value);
    }

    pub fn push_sample(&self, entity: Entity, value: FieldValue) {
        self.state
            .lock()
            .unwrap()
            .samples
            .push(EntitySample { entity, value });
    }

    pub fn set_health(&self, response: HealthResponse) {
        self.state.lock().unwrap().health = Some(response);
    }

    pub fn set_p2p(&self, matrix: Vec<Vec<i64>>) {
        self.state.lock().unwrap().p2p = Some(matrix);
    }

    /// Every subsequent call fails with `ConnectionNotValid`.
    pub fn lose_connection(&self) {
        self.state.lock().unwrap().connection_lost = true;
    }

    pub fn fail_values_since(&self) {
        self.state.lock().unwrap().fail_values_since = true;
    }

    pub fn fail_health(&self) {
        self.state.lock().unwrap().fail_health = true;
    }

    pub fn fail_field_group_create(&self) {
        self.state.lock().unwrap().fail_field_group_create = true;
    }

    // -- inspection --------------------------------------------------------

    pub fn live_groups(&self) -> usize {
        self.state.lock().unwrap().groups.len()
    }

    pub fn live_field_groups(&self) -> usize {
        self.state.lock().unwrap().field_groups.len()
    }

    /// Destroy calls in the order they happened, rendered as
    /// `group:<h>` / `field_group:<h>`.
    pub fn destroy_order(&self) -> Vec<String> {
        self.state.lock().unwrap().destroy_order.clone()
    }

    pub fn watch_calls(&self) -> Vec<WatchCall> {
        self.state.lock().unwrap().watches.clone()
    }

    pub fn update_all_calls(&self) -> u32 {
        self.state.lock().unwrap().update_all_calls
    }

    pub fn group_members(&self, group: GroupHandle) -> Vec<Entity> {
        self.state
            .lock()
            .unwrap()
            .groups
            .get(&group)
            .cloned()
            .unwrap_or_default()
    }

    pub fn health_watched_groups(&self) -> Vec<GroupHandle> {
        self.state.lock().unwrap().health_watched.clone()
    }

    fn guard(st: &State) -> Result<(), DcgmError> {
        if st.connection_lost {
            Err(DcgmError::ConnectionNotValid)
        } else {
            Ok(())
        }
    }
}

impl DcgmClient for MockDcgm {
    fn enumerate_gpus(&self) -> Result<Vec<DeviceInfo>, DcgmError> {
        let st = self.state.lock().unwrap();
        Self::guard(&st)?;
        Ok(st.gpus.clone())
    }

    fn enumerate_switches(&self) -> Result<Vec<SwitchInfo>, DcgmError> {
        let st = self.state.lock().unwrap();
        Self::guard(&st)?;
        Ok(st.switches.clone())
    }

    fn enumerate_cpus(&self) -> Result<Vec<CpuInfo>, DcgmError> {
        let st = self.state.lock().unwrap();
        Self::guard(&st)?;
        Ok(st.cpus.clone())
    }

    fn supported_profiling_fields(&self) -> Result<Vec<FieldId>, DcgmError> {
        let st = self.state.lock().unwrap();
        Self::guard(&st)?;
        Ok(st.profiling_fields.clone())
    }

    fn create_group(&self, _name: &str) -> Result<GroupHandle, DcgmError> {
        let mut st = self.state.lock().unwrap();
        Self::guard(&st)?;
        st.next_handle += 1;
        let handle = GroupHandle(st.next_handle);
        st.groups.insert(handle, Vec::new());
        Ok(handle)
    }

    fn add_entity_to_group(&self, group: GroupHandle, entity: Entity) -> Result<(), DcgmError> {
        let mut st = self.state.lock().unwrap();
        Self::guard(&st)?;
        st.groups
            .get_mut(&group)
            .ok_or(DcgmError::BadParam("unknown group".into()))?
            .push(entity);
        Ok(())
    }

    fn add_link_to_group(
        &self,
        group: GroupHandle,
        _parent_switch: EntityId,
        link_index: EntityId,
    ) -> Result<(), DcgmError> {
        self.add_entity_to_group(group, Entity::new(EntityKind::Link, link_index))
    }

    fn destroy_group(&self, group: GroupHandle) -> Result<(), DcgmError> {
        let mut st = self.state.lock().unwrap();
        Self::guard(&st)?;
        st.groups
            .remove(&group)
            .ok_or(DcgmError::BadParam("unknown group".into()))?;
        st.destroy_order.push(format!("group:{}", group.0));
        Ok(())
    }

    fn group_entities(&self, group: GroupHandle) -> Result<Vec<Entity>, DcgmError> {
        let st = self.state.lock().unwrap();
        Self::guard(&st)?;
        st.groups
            .get(&group)
            .cloned()
            .ok_or(DcgmError::BadParam("unknown group".into()))
    }

    fn create_field_group(
        &self,
        _name: &str,
        fields: &[FieldId],
    ) -> Result<FieldGroupHandle, DcgmError> {
        let mut st = self.state.lock().unwrap();
        Self::guard(&st)?;
        if st.fail_field_group_create {
            return Err(DcgmError::api("create_field_group", "scripted failure"));
        }
        st.next_handle += 1;
        let handle = FieldGroupHandle(st.next_handle);
        st.field_groups.insert(handle, fields.to_vec());
        Ok(handle)
    }

    fn destroy_field_group(&self, handle: FieldGroupHandle) -> Result<(), DcgmError> {
        let mut st = self.state.lock().unwrap();
        Self::guard(&st)?;
        st.field_groups
            .remove(&handle)
            .ok_or(DcgmError::BadParam("unknown field group".into()))?;
        st.destroy_order.push(format!("field_group:{}", handle.0));
        Ok(())
    }

    fn watch_fields_with_group(
        &self,
        fields: FieldGroupHandle,
        group: GroupHandle,
        update_interval_us: i64,
        max_keep_age_secs: f64,
        max_keep_samples: i32,
    ) -> Result<(), DcgmError> {
        let mut st = self.state.lock().unwrap();
        Self::guard(&st)?;
        if !st.field_groups.contains_key(&fields) {
            return Err(DcgmError::BadParam("unknown field group".into()));
        }
        if !st.groups.contains_key(&group) {
            return Err(DcgmError::BadParam("unknown group".into()));
        }
        st.watches.push(WatchCall {
            fields,
            group,
            update_interval_us,
            max_keep_age_secs,
            max_keep_samples,
        });
        Ok(())
    }

    fn update_all_fields(&self, _wait_for_update: bool) -> Result<(), DcgmError> {
        let mut st = self.state.lock().unwrap();
        Self::guard(&st)?;
        st.update_all_calls += 1;
        Ok(())
    }

    fn entity_latest_values(
        &self,
        kind: EntityKind,
        id: EntityId,
        fields: &[FieldId],
    ) -> Result<Vec<FieldValue>, DcgmError> {
        let st = self.state.lock().unwrap();
        Self::guard(&st)?;
        Ok(fields
            .iter()
            .filter_map(|f| st.latest.get(&(kind, 0, id, *f)).cloned())
            .collect())
    }

    fn link_latest_values(
        &self,
        link_index: EntityId,
        parent_switch: EntityId,
        fields: &[FieldId],
    ) -> Result<Vec<FieldValue>, DcgmError> {
        let st = self.state.lock().unwrap();
        Self::guard(&st)?;
        Ok(fields
            .iter()
            .filter_map(|f| {
                st.latest
                    .get(&(EntityKind::Link, parent_switch, link_index, *f))
                    .cloned()
            })
            .collect())
    }

    fn values_since(
        &self,
        group: GroupHandle,
        fields: FieldGroupHandle,
        since_us: i64,
    ) -> Result<(Vec<EntitySample>, i64), DcgmError> {
        let st = self.state.lock().unwrap();
        Self::guard(&st)?;
        if st.fail_values_since {
            return Err(DcgmError::api("values_since", "scripted failure"));
        }
        let members = st
            .groups
            .get(&group)
            .ok_or(DcgmError::BadParam("unknown group".into()))?;
        let watched = st
            .field_groups
            .get(&fields)
            .ok_or(DcgmError::BadParam("unknown field group".into()))?;
        let out: Vec<EntitySample> = st
            .samples
            .iter()
            .filter(|s| {
                s.value.ts_us >= since_us
                    && members.contains(&s.entity)
                    && watched.contains(&s.value.field_id)
            })
            .cloned()
            .collect();
        let next = out
            .iter()
            .map(|s| s.value.ts_us + 1)
            .max()
            .unwrap_or(since_us);
        Ok((out, next))
    }

    fn health_watch_all(&self, group: GroupHandle) -> Result<(), DcgmError> {
        let mut st = self.state.lock().unwrap();
        Self::guard(&st)?;
        if !st.groups.contains_key(&group) {
            return Err(DcgmError::BadParam("unknown group".into()));
        }
        st.health_watched.push(group);
        Ok(())
    }

    fn health_check(&self, group: GroupHandle) -> Result<HealthResponse, DcgmError> {
        let st = self.state.lock().unwrap();
        Self::guard(&st)?;
        if st.fail_health {
            return Err(DcgmError::api("health_check", "scripted failure"));
        }
        if !st.groups.contains_key(&group) {
            return Err(DcgmError::BadParam("unknown group".into()));
        }
        Ok(st.health.clone().unwrap_or(HealthResponse {
            overall: HealthResult::Pass,
            incidents: Vec::new(),
        }))
    }

    fn nvlink_p2p_status(&self) -> Result<P2pStatus, DcgmError> {
        let st = self.state.lock().unwrap();
        Self::guard(&st)?;
        Ok(P2pStatus {
            gpus: st.p2p.clone().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_track_membership_and_destroy_order() {
        let mock = MockDcgm::new();
        let g = mock.create_group("g").unwrap();
        mock.add_entity_to_group(g, Entity::new(EntityKind::Gpu, 0))
            .unwrap();
        let fg = mock.create_field_group("f", &[150]).unwrap();

        assert_eq!(mock.live_groups(), 1);
        assert_eq!(mock.group_members(g), vec![Entity::new(EntityKind::Gpu, 0)]);

        mock.destroy_field_group(fg).unwrap();
        mock.destroy_group(g).unwrap();
        assert_eq!(
            mock.destroy_order(),
            vec![format!("field_group:{}", fg.0), format!("group:{}", g.0)]
        );
    }

    #[test]
    fn values_since_filters_by_timestamp_group_and_fields() {
        let mock = MockDcgm::new();
        let g = mock.create_group("g").unwrap();
        let gpu0 = Entity::new(EntityKind::Gpu, 0);
        mock.add_entity_to_group(g, gpu0).unwrap();
        let fg = mock.create_field_group("f", &[112]).unwrap();

        mock.push_sample(gpu0, FieldValue::int64(112, 100, 1));
        mock.push_sample(gpu0, FieldValue::int64(112, 200, 2));
        mock.push_sample(gpu0, FieldValue::int64(230, 200, 3)); // not in field group
        mock.push_sample(Entity::new(EntityKind::Gpu, 1), FieldValue::int64(112, 200, 4));

        let (samples, next) = mock.values_since(g, fg, 150).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value.value.as_int64(), Some(2));
        assert_eq!(next, 201);
    }

    #[test]
    fn lost_connection_poisons_every_call() {
        let mock = MockDcgm::new();
        mock.lose_connection();
        assert!(matches!(
            mock.enumerate_gpus(),
            Err(DcgmError::ConnectionNotValid)
        ));
        assert!(matches!(
            mock.update_all_fields(true),
            Err(DcgmError::ConnectionNotValid)
        ));
    }
}
