use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::error::{ImportError, Result};
use crate::model::{singular, EntityType};
use crate::store::codec::{FieldValue, Tuple};
use crate::store::delta::{DeltaError, DeltaMap};
use crate::store::schema::{MappingName, MappingSchema};
use crate::store::segment;

/// One declared mapping: its schema and the delta over its replayed segments.
#[derive(Debug)]
pub struct Mapping {
    schema: &'static MappingSchema,
    entries: DeltaMap<Tuple, Tuple>,
}

/// Persistent source-key -> target-id translation, one [`Mapping`] per
/// declared name, backed by segment files in `data_dir`.
#[derive(Debug)]
pub struct MappingStore {
    data_dir: PathBuf,
    maps: IndexMap<MappingName, Mapping>,
}

impl Mapping {
    fn load(data_dir: &Path, schema: &'static MappingSchema) -> Result<Self> {
        let mut base = IndexMap::new();
        for segment in segment::list(data_dir, schema.name.as_str())? {
            debug!(path = %segment.path.display(), "replaying segment");
            for row in segment::read(&segment.path, schema)? {
                match row.value {
                    Some(value) => {
                        base.insert(row.key, value);
                    }
                    None => {
                        base.shift_remove(&row.key);
                    }
                }
            }
        }
        Ok(Self {
            schema,
            entries: DeltaMap::new(base),
        })
    }

    pub fn name(&self) -> MappingName {
        self.schema.name
    }

    pub fn schema(&self) -> &'static MappingSchema {
        self.schema
    }

    pub fn get(&self, key: &Tuple) -> Option<&Tuple> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: Tuple, value: Tuple) -> Result<()> {
        if !key.conforms_to(self.schema.key) {
            return Err(self.mismatch(&key, self.schema.describe_key()));
        }
        if !value.conforms_to(self.schema.value) {
            return Err(self.mismatch(&value, self.schema.describe_value()));
        }
        self.entries.set(key, value).map_err(|e| self.contract(e))
    }

    pub fn delete(&mut self, key: &Tuple) -> Result<()> {
        self.entries.delete(key).map_err(|e| self.contract(e))
    }

    pub fn delete_value(&mut self, value: &Tuple) -> usize {
        self.entries.delete_value(value)
    }

    pub fn was_translated(&self, value: &Tuple) -> bool {
        self.entries.iter().any(|(_, v)| v == value)
    }

    /// First source key mapped to `value`. Several keys may share one target.
    pub fn original_key_for(&self, value: &Tuple) -> Option<&Tuple> {
        self.entries
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tuple, &Tuple)> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> HashMap<Tuple, Tuple> {
        self.entries.snapshot()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn changed(&self) -> bool {
        self.entries.changed()
    }

    /// Drop every key whose target is not in `live`. Returns removed keys.
    fn prune(&mut self, live: &HashSet<FieldValue>) -> usize {
        let stale: HashSet<Tuple> = self
            .entries
            .iter()
            .filter(|(_, v)| v.as_single().is_some_and(|id| !live.contains(id)))
            .map(|(_, v)| v.clone())
            .collect();
        if stale.is_empty() {
            return 0;
        }
        let ids: Vec<String> = stale.iter().map(ToString::to_string).collect();
        debug!(
            mapping = %self.schema.name,
            "removing stale targets from mapping: {}",
            ids.join(" ")
        );
        stale.iter().map(|v| self.entries.delete_value(v)).sum()
    }

    fn save(&self, data_dir: &Path) -> Result<Option<PathBuf>> {
        if !self.entries.changed() {
            return Ok(None);
        }
        let path = segment::write(
            data_dir,
            self.schema,
            self.entries.inserted().iter(),
            self.entries.tombstones().iter(),
        )?;
        Ok(Some(path))
    }

    fn mismatch(&self, tuple: &Tuple, expected: String) -> ImportError {
        ImportError::SchemaMismatch {
            mapping: self.schema.name.to_string(),
            tuple: format!("{:?}", tuple.fields()),
            expected,
        }
    }

    fn contract(&self, err: DeltaError<Tuple>) -> ImportError {
        let mapping = self.schema.name.to_string();
        match err {
            DeltaError::KeyConflict(key) => ImportError::KeyConflict {
                mapping,
                key: key.to_string(),
            },
            DeltaError::UnknownKey(key) => ImportError::UnknownKey {
                mapping,
                key: key.to_string(),
            },
        }
    }
}

impl MappingStore {
    /// Replay every segment of each named mapping found in `data_dir`.
    pub fn load(data_dir: &Path, names: &[MappingName]) -> Result<Self> {
        let mut maps = IndexMap::new();
        for &name in names {
            if maps.contains_key(&name) {
                continue;
            }
            let mapping = Mapping::load(data_dir, name.schema())?;
            debug!(mapping = %name, entries = mapping.len(), "loaded mapping");
            maps.insert(name, mapping);
        }
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            maps,
        })
    }

    /// Write one segment per changed mapping. Returns the new segment paths.
    pub fn save(&self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for mapping in self.maps.values() {
            if let Some(path) = mapping.save(&self.data_dir)? {
                debug!(path = %path.display(), "saved mapping segment");
                written.push(path);
            }
        }
        Ok(written)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn names(&self) -> impl Iterator<Item = MappingName> + '_ {
        self.maps.keys().copied()
    }

    pub fn is_loaded(&self, name: MappingName) -> bool {
        self.maps.contains_key(&name)
    }

    /// Entity types the loaded mappings point at, without duplicates.
    pub fn targets(&self) -> Vec<EntityType> {
        let mut targets: Vec<EntityType> = Vec::new();
        for name in self.maps.keys() {
            let target = name.target();
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }

    pub fn mapping(&self, name: MappingName) -> Result<&Mapping> {
        self.maps
            .get(&name)
            .ok_or_else(|| ImportError::UnknownMapping(name.to_string()))
    }

    pub fn mapping_mut(&mut self, name: MappingName) -> Result<&mut Mapping> {
        self.maps
            .get_mut(&name)
            .ok_or_else(|| ImportError::UnknownMapping(name.to_string()))
    }

    pub fn get(&self, name: MappingName, key: &Tuple) -> Option<&Tuple> {
        self.maps.get(&name).and_then(|m| m.get(key))
    }

    pub fn set(&mut self, name: MappingName, key: Tuple, value: Tuple) -> Result<()> {
        self.mapping_mut(name)?.set(key, value)
    }

    pub fn delete(&mut self, name: MappingName, key: &Tuple) -> Result<()> {
        self.mapping_mut(name)?.delete(key)
    }

    pub fn delete_value(&mut self, name: MappingName, value: &Tuple) -> Result<usize> {
        Ok(self.mapping_mut(name)?.delete_value(value))
    }

    pub fn was_translated(&self, name: MappingName, value: &Tuple) -> bool {
        self.maps
            .get(&name)
            .is_some_and(|m| m.was_translated(value))
    }

    pub fn original_key_for(&self, name: MappingName, value: &Tuple) -> Option<&Tuple> {
        self.maps.get(&name).and_then(|m| m.original_key_for(value))
    }

    /// Target id for `key`, or `MissingObject` when it was never imported.
    pub fn translate(&self, name: MappingName, key: &Tuple) -> Result<FieldValue> {
        self.get(name, key)
            .and_then(Tuple::as_single)
            .cloned()
            .ok_or_else(|| ImportError::MissingObject {
                entity: singular(name.as_str()),
                key: key.to_string(),
            })
    }

    /// Reconcile with the target system: every mapping whose target type is
    /// present in `live` loses the keys pointing at ids missing from it.
    /// Mappings with no entry in `live` are left untouched.
    pub fn prune(&mut self, live: &HashMap<EntityType, HashSet<FieldValue>>) -> usize {
        let mut removed = 0;
        for mapping in self.maps.values_mut() {
            if let Some(ids) = live.get(&mapping.schema.target) {
                removed += mapping.prune(ids);
            }
        }
        if removed > 0 {
            info!(removed, "pruned mappings of entities missing on the target");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn store(dir: &Path, names: &[MappingName]) -> MappingStore {
        MappingStore::load(dir, names).unwrap()
    }

    #[test]
    fn set_rejects_tuples_outside_schema() {
        let dir = tempdir().unwrap();
        let mut pm = store(dir.path(), &[MappingName::Products, MappingName::Hosts]);

        let err = pm
            .set(MappingName::Products, Tuple::single(1), Tuple::single(2))
            .unwrap_err();
        assert_eq!(err.code(), "schema_mismatch");

        let err = pm
            .set(MappingName::Hosts, Tuple::single(1), Tuple::single(2))
            .unwrap_err();
        assert_eq!(err.code(), "schema_mismatch");

        pm.set(MappingName::Hosts, Tuple::single(1), Tuple::single("host-2"))
            .unwrap();
    }

    #[test]
    fn undeclared_mapping_is_an_error() {
        let dir = tempdir().unwrap();
        let mut pm = store(dir.path(), &[MappingName::Organizations]);
        let err = pm
            .set(MappingName::Users, Tuple::single(1), Tuple::single(1))
            .unwrap_err();
        assert!(matches!(err, ImportError::UnknownMapping(_)));
        assert_eq!(pm.get(MappingName::Users, &Tuple::single(1)), None);
    }

    #[test]
    fn save_is_noop_without_changes() {
        let dir = tempdir().unwrap();
        let pm = store(dir.path(), &[MappingName::Organizations]);
        assert!(pm.save().unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn save_then_load_reproduces_snapshot() {
        let dir = tempdir().unwrap();
        let names = [MappingName::Organizations, MappingName::Products];

        let mut pm = store(dir.path(), &names);
        pm.set(MappingName::Organizations, Tuple::single(1), Tuple::single(101))
            .unwrap();
        pm.set(MappingName::Organizations, Tuple::single(2), Tuple::single(102))
            .unwrap();
        pm.set(MappingName::Products, Tuple::from((1, "EXAMPLE.COM")), Tuple::single(7))
            .unwrap();
        assert_eq!(pm.save().unwrap().len(), 2);

        let mut pm = store(dir.path(), &names);
        pm.delete(MappingName::Organizations, &Tuple::single(1)).unwrap();
        pm.set(MappingName::Organizations, Tuple::single(3), Tuple::single(103))
            .unwrap();
        let before = pm.mapping(MappingName::Organizations).unwrap().snapshot();
        assert_eq!(pm.save().unwrap().len(), 1);

        let pm = store(dir.path(), &names);
        assert_eq!(
            pm.mapping(MappingName::Organizations).unwrap().snapshot(),
            before
        );
        assert_eq!(pm.get(MappingName::Organizations, &Tuple::single(1)), None);
        assert_eq!(
            pm.get(MappingName::Products, &Tuple::from((1, "EXAMPLE.COM"))),
            Some(&Tuple::single(7))
        );
    }

    #[test]
    fn later_segment_wins_including_tombstones() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("organizations-2014-05-01T10:00:00Z.csv"),
            "sat5,sat6,delete\n1,101,\n2,102,\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("organizations-2014-05-02T10:00:00Z.csv"),
            "sat5,sat6,delete\n1,,-\n2,202,\n3,303,\n",
        )
        .unwrap();

        let pm = store(dir.path(), &[MappingName::Organizations]);
        let snapshot = pm.mapping(MappingName::Organizations).unwrap().snapshot();
        assert_eq!(
            snapshot,
            HashMap::from([
                (Tuple::single(2), Tuple::single(202)),
                (Tuple::single(3), Tuple::single(303)),
            ])
        );
        assert!(!pm.mapping(MappingName::Organizations).unwrap().changed());
    }

    #[test]
    fn corrupt_segment_fails_the_load() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("users-2014-05-01T10:00:00Z.csv"),
            "sat5,sat6,extra,delete\n",
        )
        .unwrap();
        let err = MappingStore::load(dir.path(), &[MappingName::Users]).unwrap_err();
        assert_eq!(err.code(), "mapping_corrupt");
    }

    #[test]
    fn reverse_lookup_and_translate() {
        let dir = tempdir().unwrap();
        let mut pm = store(dir.path(), &[MappingName::Organizations]);
        pm.set(MappingName::Organizations, Tuple::single(1), Tuple::single(100))
            .unwrap();
        pm.set(MappingName::Organizations, Tuple::single(2), Tuple::single(100))
            .unwrap();

        assert!(pm.was_translated(MappingName::Organizations, &Tuple::single(100)));
        assert!(!pm.was_translated(MappingName::Organizations, &Tuple::single(5)));
        assert_eq!(
            pm.original_key_for(MappingName::Organizations, &Tuple::single(100)),
            Some(&Tuple::single(1))
        );
        assert_eq!(
            pm.translate(MappingName::Organizations, &Tuple::single(2)).unwrap(),
            FieldValue::Int(100)
        );
        let err = pm
            .translate(MappingName::Organizations, &Tuple::single(9))
            .unwrap_err();
        assert_eq!(err.to_string(), "unable to import, first import organization with id 9");
    }

    #[test]
    fn original_key_is_the_first_one_loaded() {
        let dir = tempdir().unwrap();
        let mut rows = String::from("sat5,sat6,delete\n");
        for key in 1..=20 {
            rows.push_str(&format!("{key},100,\n"));
        }
        fs::write(dir.path().join("organizations-2014-05-01T10:00:00Z.csv"), rows).unwrap();
        fs::write(
            dir.path().join("organizations-2014-05-02T10:00:00Z.csv"),
            "sat5,sat6,delete\n3,,-\n3,100,\n",
        )
        .unwrap();

        for _ in 0..5 {
            let pm = store(dir.path(), &[MappingName::Organizations]);
            assert_eq!(
                pm.original_key_for(MappingName::Organizations, &Tuple::single(100)),
                Some(&Tuple::single(1))
            );
        }

        let mut pm = store(dir.path(), &[MappingName::Organizations]);
        pm.delete(MappingName::Organizations, &Tuple::single(1)).unwrap();
        assert_eq!(
            pm.original_key_for(MappingName::Organizations, &Tuple::single(100)),
            Some(&Tuple::single(2))
        );
    }

    #[test]
    fn prune_drops_keys_of_vanished_targets() {
        let dir = tempdir().unwrap();
        let mut pm = store(dir.path(), &[MappingName::Organizations, MappingName::Users]);
        pm.set(MappingName::Organizations, Tuple::single(1), Tuple::single(101))
            .unwrap();
        pm.set(MappingName::Organizations, Tuple::single(2), Tuple::single(102))
            .unwrap();
        pm.set(MappingName::Organizations, Tuple::single(3), Tuple::single(102))
            .unwrap();
        pm.set(MappingName::Users, Tuple::single(1), Tuple::single(5))
            .unwrap();

        let live = HashMap::from([(
            EntityType::Organizations,
            HashSet::from([FieldValue::Int(101)]),
        )]);
        assert_eq!(pm.prune(&live), 2);
        assert_eq!(pm.mapping(MappingName::Organizations).unwrap().len(), 1);
        assert_eq!(pm.mapping(MappingName::Users).unwrap().len(), 1);
    }
}
