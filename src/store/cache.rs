use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;
use crate::model::{Entity, EntityType};
use crate::remote::{ApiError, RemoteApi};
use crate::store::codec::{FieldType, FieldValue};
use crate::store::mapping::MappingStore;
use crate::store::schema::MappingName;

/// Last seen snapshot of remote entities, keyed by entity type and target id.
#[derive(Debug, Default)]
pub struct EntityCache {
    entries: HashMap<EntityType, IndexMap<FieldValue, Entity>>,
}

/// Hosts are addressed by string ids; everything else by integers.
pub fn id_type(kind: EntityType) -> FieldType {
    match kind {
        EntityType::Hosts => FieldType::Str,
        _ => FieldType::Int,
    }
}

/// Target id of `entity`, coerced to the id type of `kind`.
pub fn entity_id(kind: EntityType, entity: &Entity) -> Result<FieldValue> {
    entity
        .id()
        .and_then(|id| id_type(kind).from_json(id))
        .ok_or_else(|| {
            ApiError::Malformed(format!("{kind} entity without a usable id: {:?}", entity.id()))
                .into()
        })
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, kind: EntityType) -> bool {
        self.entries.contains_key(&kind)
    }

    /// List every `kind` entity from the target.
    ///
    /// Organization scoped types are listed once per target organization
    /// known to `mappings` (or per cached organization when the
    /// organizations mapping is not loaded); product scoped types once per
    /// cached product. Prerequisite types are loaded first when missing.
    pub fn load(
        &mut self,
        api: &dyn RemoteApi,
        mappings: &MappingStore,
        kind: EntityType,
    ) -> Result<usize> {
        let mut results = Vec::new();
        match kind.prerequisite() {
            None => results.extend(api.index(kind, &Map::new())?),
            Some(scope) => {
                if !self.is_loaded(scope) {
                    self.load(api, mappings, scope)?;
                }
                for scope_id in self.scope_ids(mappings, scope) {
                    let mut filter = Map::new();
                    filter.insert(scope.scope_param(), scope_id.to_json());
                    results.extend(api.index(kind, &filter)?);
                }
            }
        }

        let entries = self.entries.entry(kind).or_default();
        for entity in results {
            entries.insert(entity_id(kind, &entity)?, entity);
        }
        debug!(%kind, count = entries.len(), "listed target entities");
        Ok(entries.len())
    }

    fn scope_ids(&self, mappings: &MappingStore, scope: EntityType) -> Vec<FieldValue> {
        if scope == EntityType::Organizations {
            if let Ok(orgs) = mappings.mapping(MappingName::Organizations) {
                let mut ids: Vec<FieldValue> = Vec::new();
                for (_, value) in orgs.iter() {
                    if let Some(id) = value.as_single() {
                        if !ids.contains(id) {
                            ids.push(id.clone());
                        }
                    }
                }
                return ids;
            }
        }
        self.ids(scope).into_iter().collect()
    }

    pub fn get(&self, kind: EntityType, id: &FieldValue) -> Option<&Entity> {
        self.entries.get(&kind).and_then(|m| m.get(id))
    }

    /// Cached snapshot of `id`, fetched from the target when missing or when
    /// `online` is set. `None` when the target does not know the id.
    pub fn lookup(
        &mut self,
        api: &dyn RemoteApi,
        kind: EntityType,
        id: &FieldValue,
        online: bool,
    ) -> Result<Option<Entity>> {
        if !online {
            if let Some(entity) = self.get(kind, id) {
                debug!(%kind, %id, "taken from cache");
                return Ok(Some(entity.clone()));
            }
        }
        match api.show(kind, id) {
            Ok(entity) => {
                self.insert(kind, id.clone(), entity.clone());
                Ok(Some(entity))
            }
            Err(ApiError::NotFound { .. }) => {
                self.remove(kind, id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn insert(&mut self, kind: EntityType, id: FieldValue, entity: Entity) {
        self.entries.entry(kind).or_default().insert(id, entity);
    }

    pub fn remove(&mut self, kind: EntityType, id: &FieldValue) -> Option<Entity> {
        self.entries.get_mut(&kind).and_then(|m| m.shift_remove(id))
    }

    /// First cached `kind` entity whose `attribute` equals `value`.
    pub fn find_by(&self, kind: EntityType, attribute: &str, value: &Value) -> Option<&Entity> {
        self.entries
            .get(&kind)?
            .values()
            .find(|entity| entity.get(attribute) == Some(value))
    }

    /// True when `id` is the only cached entity of `kind`.
    pub fn is_last(&self, kind: EntityType, id: &FieldValue) -> bool {
        self.entries
            .get(&kind)
            .is_some_and(|m| m.len() == 1 && m.contains_key(id))
    }

    pub fn ids(&self, kind: EntityType) -> HashSet<FieldValue> {
        self.entries
            .get(&kind)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entities(&self, kind: EntityType) -> impl Iterator<Item = &Entity> {
        self.entries.get(&kind).into_iter().flat_map(|m| m.values())
    }

    /// Ids of every loaded entity type, for reconciling the mapping store.
    pub fn live_ids(&self) -> HashMap<EntityType, HashSet<FieldValue>> {
        self.entries
            .iter()
            .map(|(kind, m)| (*kind, m.keys().cloned().collect()))
            .collect()
    }
}
