//! Idempotent creation of remote entities with conflict recovery.
//!
//! Every creation request carries the source key it came from. Requests
//! for keys that are already mapped are answered from the cache, and
//! uniqueness conflicts on the target are resolved by the run-wide
//! [`RecoverStrategy`].

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::{ImportError, Result};
use crate::model::{singular, Attributes, Entity, EntityType, RecoverStrategy, Verb};
use crate::remote::{ApiError, RemoteApi};
use crate::store::cache::{entity_id, EntityCache};
use crate::store::codec::{FieldValue, Tuple};
use crate::store::mapping::MappingStore;
use crate::store::schema::MappingName;

pub const DEFAULT_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub strategy: RecoverStrategy,
    /// Extra creation attempts allowed by the rename strategy.
    pub retries: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            strategy: RecoverStrategy::default(),
            retries: DEFAULT_RETRIES,
        }
    }
}

/// Per-verb, per-mapping counters reported at the end of a run.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Summary(IndexMap<Verb, IndexMap<MappingName, usize>>);

impl Summary {
    pub fn record(&mut self, verb: Verb, mapping: MappingName) {
        *self.0.entry(verb).or_default().entry(mapping).or_insert(0) += 1;
    }

    pub fn count(&self, verb: Verb, mapping: MappingName) -> usize {
        self.0
            .get(&verb)
            .and_then(|m| m.get(&mapping))
            .copied()
            .unwrap_or(0)
    }

    /// Nothing but `found` entries: the run changed nothing.
    pub fn is_idle(&self) -> bool {
        self.0.keys().all(|verb| *verb == Verb::Found)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Verb, MappingName, usize)> + '_ {
        self.0.iter().flat_map(|(verb, counts)| {
            counts
                .iter()
                .map(move |(mapping, count)| (*verb, *mapping, *count))
        })
    }
}

/// Creation/recovery engine. Owns the mapping store and the entity cache
/// for the duration of a run.
pub struct Engine {
    api: Arc<dyn RemoteApi>,
    mappings: MappingStore,
    cache: EntityCache,
    policy: RecoveryPolicy,
    summary: Summary,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("mappings", &self.mappings)
            .field("policy", &self.policy)
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

fn single(mapping: MappingName, value: &Tuple) -> Result<FieldValue> {
    value.as_single().cloned().ok_or_else(|| ImportError::SchemaMismatch {
        mapping: mapping.to_string(),
        tuple: format!("{:?}", value.fields()),
        expected: mapping.schema().describe_value(),
    })
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn only_id(id: &FieldValue) -> Entity {
    let mut attrs = Map::new();
    attrs.insert("id".into(), id.to_json());
    Entity::new(attrs)
}

impl Engine {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        mappings: MappingStore,
        cache: EntityCache,
        policy: RecoveryPolicy,
    ) -> Self {
        Self {
            api,
            mappings,
            cache,
            policy,
            summary: Summary::default(),
        }
    }

    pub fn api(&self) -> &Arc<dyn RemoteApi> {
        &self.api
    }

    pub fn mappings(&self) -> &MappingStore {
        &self.mappings
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn report(&mut self, verb: Verb, mapping: MappingName) {
        self.summary.record(verb, mapping);
    }

    /// List every entity type targeted by the loaded mappings, then drop
    /// mapping entries whose target no longer exists.
    pub fn load_cache(&mut self) -> Result<usize> {
        for kind in self.mappings.targets() {
            self.ensure_cached(kind)?;
        }
        Ok(self.mappings.prune(&self.cache.live_ids()))
    }

    pub fn ensure_cached(&mut self, kind: EntityType) -> Result<()> {
        if !self.cache.is_loaded(kind) {
            self.cache.load(self.api.as_ref(), &self.mappings, kind)?;
        }
        Ok(())
    }

    /// Create the entity for `source_key` unless it was created before.
    pub fn create_entity(
        &mut self,
        mapping: MappingName,
        attrs: Attributes,
        source_key: Tuple,
    ) -> Result<Entity> {
        let target = mapping.target();
        let noun = singular(mapping.as_str());

        if let Some(value) = self.mappings.get(mapping, &source_key).cloned() {
            let id = single(mapping, &value)?;
            info!("{noun} [{source_key}->{id}] already imported");
            self.summary.record(Verb::Found, mapping);
            let cached = self.cache.lookup(self.api.as_ref(), target, &id, false)?;
            return Ok(cached.unwrap_or_else(|| only_id(&id)));
        }

        let mut attrs = attrs;
        let mut retries = self.policy.retries;
        loop {
            info!(
                "creating new {noun}: {}",
                Entity::new(attrs.clone()).label().unwrap_or("")
            );
            let attribute = match self.api.create(target, &attrs) {
                Ok(entity) => return self.record_created(mapping, source_key, entity),
                Err(ApiError::Conflict { attribute, .. }) if attrs.contains_key(&attribute) => {
                    error!("creation of {noun} failed: {attribute} is already taken");
                    attribute
                }
                Err(e) => return Err(e.into()),
            };

            match self.policy.strategy {
                RecoverStrategy::Rename => {
                    if retries == 0 {
                        return Err(self.unrecovered(mapping));
                    }
                    retries -= 1;
                    let current = attrs.get(&attribute).map(render).unwrap_or_default();
                    let renamed = format!("{source_key}-{current}");
                    info!("recovering by renaming to: \"{attribute}\"=\"{renamed}\"");
                    attrs.insert(attribute, Value::String(renamed));
                }
                RecoverStrategy::Map => {
                    self.ensure_cached(target)?;
                    let wanted = attrs.get(&attribute).cloned().unwrap_or(Value::Null);
                    let existing = self
                        .cache
                        .find_by(target, &attribute, &wanted)
                        .map(|e| entity_id(target, e))
                        .transpose()?;
                    let Some(id) = existing else {
                        warn!("creation of {mapping} not recovered by 'map' strategy");
                        return Err(self.unrecovered(mapping));
                    };
                    info!("recovering by remapping to: {id}");
                    self.map_entity(mapping, source_key, id.clone())?;
                    let cached = self.cache.get(target, &id).cloned();
                    return Ok(cached.unwrap_or_else(|| only_id(&id)));
                }
                RecoverStrategy::Fail => {
                    return Err(ApiError::Conflict {
                        message: "has already been taken".into(),
                        attribute,
                    }
                    .into());
                }
            }
        }
    }

    fn record_created(
        &mut self,
        mapping: MappingName,
        source_key: Tuple,
        entity: Entity,
    ) -> Result<Entity> {
        let target = mapping.target();
        let id = entity_id(target, &entity)?;
        debug!(%mapping, %source_key, %id, "created entity");
        self.mappings
            .set(mapping, source_key, Tuple::single(id.clone()))?;
        self.cache.insert(target, id, entity.clone());
        self.summary.record(Verb::Created, mapping);
        Ok(entity)
    }

    fn unrecovered(&self, mapping: MappingName) -> ImportError {
        ImportError::ImportRecovery {
            mapping: mapping.to_string(),
            strategy: self.policy.strategy.to_string(),
        }
    }

    /// Record `source_key -> id` without creating anything.
    /// Returns `false` when the key was already mapped.
    pub fn map_entity(
        &mut self,
        mapping: MappingName,
        source_key: Tuple,
        id: FieldValue,
    ) -> Result<bool> {
        let noun = singular(mapping.as_str());
        if let Some(existing) = self.mappings.get(mapping, &source_key) {
            info!("{noun} [{source_key}->{existing}] already mapped, skipping");
            self.summary.record(Verb::Found, mapping);
            return Ok(false);
        }
        info!("mapping {noun} [{source_key}->{id}]");
        self.mappings.set(mapping, source_key, Tuple::single(id))?;
        self.summary.record(Verb::Mapped, mapping);
        Ok(true)
    }

    /// Remove every source key pointing at `id`.
    pub fn unmap_entity(&mut self, mapping: MappingName, id: &FieldValue) -> Result<usize> {
        let removed = self
            .mappings
            .delete_value(mapping, &Tuple::single(id.clone()))?;
        if removed > 1 {
            info!(
                "unmapped {} with id {id}: {removed}x",
                singular(mapping.as_str())
            );
        }
        Ok(removed)
    }

    pub fn translate(&self, mapping: MappingName, source_key: &Tuple) -> Result<FieldValue> {
        self.mappings.translate(mapping, source_key)
    }

    pub fn was_translated(&self, mapping: MappingName, id: &FieldValue) -> bool {
        self.mappings
            .was_translated(mapping, &Tuple::single(id.clone()))
    }

    pub fn lookup_entity(
        &mut self,
        mapping: MappingName,
        id: &FieldValue,
        online: bool,
    ) -> Result<Option<Entity>> {
        self.cache
            .lookup(self.api.as_ref(), mapping.target(), id, online)
    }

    pub fn update_entity(
        &mut self,
        mapping: MappingName,
        id: &FieldValue,
        attrs: &Attributes,
    ) -> Result<Entity> {
        let target = mapping.target();
        info!("updating {} with id: {id}", singular(mapping.as_str()));
        let entity = self.api.update(target, id, attrs)?;
        self.cache.insert(target, id.clone(), entity.clone());
        Ok(entity)
    }

    /// True when `id` is the only known entity of the mapping's target type.
    pub fn is_last(&self, mapping: MappingName, id: &FieldValue) -> bool {
        self.cache.is_last(mapping.target(), id)
    }

    /// Destroy the entity imported for `source_key`. Unknown keys and remote
    /// failures are logged, never raised.
    pub fn delete_entity(&mut self, mapping: MappingName, source_key: &Tuple) -> Result<()> {
        let noun = singular(mapping.as_str());
        let Some(value) = self.mappings.get(mapping, source_key).cloned() else {
            error!("unknown {noun} to delete [{source_key}]");
            return Ok(());
        };
        let id = single(mapping, &value)?;
        info!("deleting imported {noun} [{source_key}->{id}]");
        self.destroy(mapping, &id)
    }

    /// Destroy an imported entity known only by its target id.
    pub fn delete_by_target_id(&mut self, mapping: MappingName, id: &FieldValue) -> Result<()> {
        let noun = singular(mapping.as_str());
        let Some(source_key) = self
            .mappings
            .original_key_for(mapping, &Tuple::single(id.clone()))
            .cloned()
        else {
            error!("unknown imported {noun} to delete [{id}]");
            return Ok(());
        };
        info!("deleting imported {noun} [{source_key}->{id}]");
        self.destroy(mapping, id)
    }

    fn destroy(&mut self, mapping: MappingName, id: &FieldValue) -> Result<()> {
        let target = mapping.target();
        match self.api.destroy(target, id) {
            Ok(()) => {
                self.cache.remove(target, id);
                self.unmap_entity(mapping, id)?;
                self.summary.record(Verb::Deleted, mapping);
            }
            Err(e) => {
                warn!(
                    "delete of {} [{id}] failed: {e}",
                    singular(mapping.as_str())
                );
                self.summary.record(Verb::Failed, mapping);
            }
        }
        Ok(())
    }

    pub fn save(&self) -> Result<Vec<PathBuf>> {
        self.mappings.save()
    }
}
