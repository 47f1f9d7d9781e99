//! In-process stand-in for the target system.
//!
//! Keeps entities per resource, enforces uniqueness of `name` (`login` for
//! users), hands out sequential ids, tracks asynchronous jobs and counts
//! every call so callers can assert on remote traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::model::{Attributes, Entity, EntityType};
use crate::remote::{ApiError, ApiResult, JobId, JobState, RemoteApi};
use crate::store::codec::FieldValue;

#[derive(Debug, Clone)]
struct Job {
    state: JobState,
    resource: EntityType,
    action: String,
    target: String,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    next_job: u64,
    entities: HashMap<EntityType, IndexMap<String, Entity>>,
    jobs: IndexMap<JobId, Job>,
    calls: HashMap<&'static str, usize>,
    unique: HashMap<EntityType, Vec<String>>,
    status_failure: Option<String>,
    failures: HashMap<&'static str, VecDeque<ApiError>>,
}

#[derive(Debug)]
pub struct MemoryApi {
    state: Mutex<State>,
}

impl Default for MemoryApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryApi {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Fake whose first assigned id is `first_id`.
    pub fn starting_at(first_id: i64) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: first_id,
                next_job: 1,
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the fake from other threads.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attributes that must be unique per resource (default: `name`, or
    /// `login` for users).
    pub fn set_unique(&self, resource: EntityType, attributes: &[&str]) {
        self.lock().unique.insert(
            resource,
            attributes.iter().map(|a| a.to_string()).collect(),
        );
    }

    /// Insert an entity as if it pre-existed on the target.
    pub fn seed(&self, resource: EntityType, attrs: Value) -> Entity {
        let mut state = self.lock();
        let mut attrs = match attrs {
            Value::Object(map) => map,
            _ => Attributes::new(),
        };
        let id = match attrs.get("id").cloned() {
            Some(id) => id,
            None => {
                let id = json!(state.next_id);
                state.next_id += 1;
                attrs.insert("id".into(), id.clone());
                id
            }
        };
        let entity = Entity::new(attrs);
        state
            .entities
            .entry(resource)
            .or_default()
            .insert(key_of(&id), entity.clone());
        entity
    }

    /// Number of calls made to `operation` (`create`, `show`, `index`,
    /// `update`, `destroy`, `start_job`, `batch_status`).
    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn count(&self, resource: EntityType) -> usize {
        self.lock()
            .entities
            .get(&resource)
            .map_or(0, IndexMap::len)
    }

    pub fn entities(&self, resource: EntityType) -> Vec<Entity> {
        let state = self.lock();
        state
            .entities
            .get(&resource)
            .map(|m| m.values().map(|e| decorate(&state, resource, e)).collect())
            .unwrap_or_default()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.lock().jobs.keys().cloned().collect()
    }

    /// Stop a job. A finished `sync` marks its repository as synchronized.
    pub fn finish_job(&self, job_id: &str) {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return;
        };
        job.state = JobState::Stopped;
        let job = job.clone();
        if job.action != "sync" {
            return;
        }
        if let Some(entity) = state
            .entities
            .get_mut(&job.resource)
            .and_then(|m| m.get_mut(&job.target))
        {
            let mut attrs = entity.clone().into_attributes();
            attrs.insert("sync_state".into(), json!("finished"));
            *entity = Entity::new(attrs);
        }
    }

    /// Register a job id directly, for driving a reactor without entities.
    pub fn add_job(&self, job_id: &str, job_state: JobState) {
        self.lock().jobs.insert(
            job_id.to_string(),
            Job {
                state: job_state,
                resource: EntityType::Repositories,
                action: "external".into(),
                target: String::new(),
            },
        );
    }

    /// Make every following `batch_status` call fail.
    pub fn fail_status_queries(&self, message: &str) {
        self.lock().status_failure = Some(message.to_string());
    }

    /// Make the next call to `operation` fail with `err`. Failures queue up.
    pub fn fail_next(&self, operation: &'static str, err: ApiError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    /// Count a call and hand back any failure queued for it.
    fn record(state: &mut State, operation: &'static str) -> ApiResult<()> {
        *state.calls.entry(operation).or_insert(0) += 1;
        match state.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn key_of(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn unique_attributes(state: &State, resource: EntityType) -> Vec<String> {
    match state.unique.get(&resource) {
        Some(attrs) => attrs.clone(),
        None if resource == EntityType::Users => vec!["login".into()],
        None => vec!["name".into()],
    }
}

/// Derived attributes the real target computes on read.
fn decorate(state: &State, resource: EntityType, entity: &Entity) -> Entity {
    let mut attrs = entity.attributes().clone();
    match resource {
        EntityType::Products => {
            let id = entity.id().map(key_of);
            let count = state
                .entities
                .get(&EntityType::Repositories)
                .map_or(0, |repos| {
                    repos
                        .values()
                        .filter(|r| r.get("product_id").map(key_of) == id)
                        .count()
                });
            attrs.insert("repository_count".into(), json!(count));
        }
        EntityType::Repositories => {
            if let Some(product_id) = entity.get("product_id").cloned() {
                let org_id = state
                    .entities
                    .get(&EntityType::Products)
                    .and_then(|products| products.get(&key_of(&product_id)))
                    .and_then(|p| p.get("organization_id").cloned());
                if let Some(org_id) = org_id {
                    attrs.entry("organization_id").or_insert(org_id);
                }
                attrs.insert("product".into(), json!({ "id": product_id }));
            }
        }
        _ => {}
    }
    Entity::new(attrs)
}

fn matches_filter(entity: &Entity, filter: &Attributes) -> bool {
    filter.iter().all(|(key, wanted)| {
        key == "per_page" || entity.get(key).map(key_of) == Some(key_of(wanted))
    })
}

impl RemoteApi for MemoryApi {
    fn create(&self, resource: EntityType, attrs: &Attributes) -> ApiResult<Entity> {
        let mut state = self.lock();
        Self::record(&mut state, "create")?;

        for attribute in unique_attributes(&state, resource) {
            let Some(wanted) = attrs.get(&attribute) else {
                continue;
            };
            let taken = state
                .entities
                .get(&resource)
                .is_some_and(|m| m.values().any(|e| e.get(&attribute) == Some(wanted)));
            if taken {
                return Err(ApiError::Conflict {
                    attribute,
                    message: "has already been taken".into(),
                });
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        let mut stored = attrs.clone();
        stored.insert("id".into(), json!(id));
        let entity = Entity::new(stored);
        state
            .entities
            .entry(resource)
            .or_default()
            .insert(id.to_string(), entity.clone());
        Ok(decorate(&state, resource, &entity))
    }

    fn show(&self, resource: EntityType, id: &FieldValue) -> ApiResult<Entity> {
        let mut state = self.lock();
        Self::record(&mut state, "show")?;
        let entity = state
            .entities
            .get(&resource)
            .and_then(|m| m.get(&id.to_string()))
            .cloned()
            .ok_or_else(|| ApiError::NotFound {
                resource: resource.to_string(),
                id: id.to_string(),
            })?;
        Ok(decorate(&state, resource, &entity))
    }

    fn index(&self, resource: EntityType, filter: &Attributes) -> ApiResult<Vec<Entity>> {
        let mut state = self.lock();
        Self::record(&mut state, "index")?;
        let found = state
            .entities
            .get(&resource)
            .map(|m| {
                m.values()
                    .map(|e| decorate(&state, resource, e))
                    .filter(|e| matches_filter(e, filter))
                    .collect()
            })
            .unwrap_or_default();
        Ok(found)
    }

    fn update(
        &self,
        resource: EntityType,
        id: &FieldValue,
        attrs: &Attributes,
    ) -> ApiResult<Entity> {
        let mut state = self.lock();
        Self::record(&mut state, "update")?;
        let entity = state
            .entities
            .get_mut(&resource)
            .and_then(|m| m.get_mut(&id.to_string()))
            .ok_or_else(|| ApiError::NotFound {
                resource: resource.to_string(),
                id: id.to_string(),
            })?;
        let mut merged = entity.clone().into_attributes();
        for (key, value) in attrs {
            if key != "id" {
                merged.insert(key.clone(), value.clone());
            }
        }
        *entity = Entity::new(merged);
        let updated = entity.clone();
        Ok(decorate(&state, resource, &updated))
    }

    fn destroy(&self, resource: EntityType, id: &FieldValue) -> ApiResult<()> {
        let mut state = self.lock();
        Self::record(&mut state, "destroy")?;
        state
            .entities
            .get_mut(&resource)
            .and_then(|m| m.shift_remove(&id.to_string()))
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound {
                resource: resource.to_string(),
                id: id.to_string(),
            })
    }

    fn start_job(&self, resource: EntityType, action: &str, id: &FieldValue) -> ApiResult<JobId> {
        let mut state = self.lock();
        Self::record(&mut state, "start_job")?;
        let exists = state
            .entities
            .get(&resource)
            .is_some_and(|m| m.contains_key(&id.to_string()));
        if !exists {
            return Err(ApiError::NotFound {
                resource: resource.to_string(),
                id: id.to_string(),
            });
        }
        let job_id = format!("job-{}", state.next_job);
        state.next_job += 1;
        state.jobs.insert(
            job_id.clone(),
            Job {
                state: JobState::Running,
                resource,
                action: action.to_string(),
                target: id.to_string(),
            },
        );
        Ok(job_id)
    }

    fn batch_status(&self, job_ids: &[JobId]) -> ApiResult<HashMap<JobId, JobState>> {
        let mut state = self.lock();
        Self::record(&mut state, "batch_status")?;
        if let Some(message) = &state.status_failure {
            return Err(ApiError::Transport(message.clone()));
        }
        Ok(job_ids
            .iter()
            .filter_map(|id| state.jobs.get(id).map(|job| (id.clone(), job.state)))
            .collect())
    }
}
