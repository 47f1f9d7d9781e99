//! Blocking JSON client for the target system's REST API.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, trace};
use url::Url;

use crate::model::{Attributes, Entity, EntityType};
use crate::remote::{ApiError, ApiResult, JobId, JobState, RemoteApi};
use crate::store::codec::FieldValue;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const PER_PAGE: u64 = 999_999;

/// Validation messages that identify a uniqueness conflict.
const UNIQUENESS_MESSAGES: [&str; 3] = [
    "has already been taken",
    "already exists",
    "must be unique within one organization",
];

pub struct HttpApi {
    client: Client,
    base: Url,
    username: String,
    password: String,
}

impl std::fmt::Debug for HttpApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApi")
            .field("base", &self.base.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Collection path of each resource.
fn collection(resource: EntityType) -> &'static str {
    match resource {
        EntityType::Organizations => "katello/api/organizations",
        EntityType::Users => "api/users",
        EntityType::HostCollections => "katello/api/host_collections",
        EntityType::Products => "katello/api/products",
        EntityType::Repositories => "katello/api/repositories",
        EntityType::RepositorySets => "katello/api/repository_sets",
        EntityType::ContentViews => "katello/api/content_views",
        EntityType::ContentViewVersions => "katello/api/content_view_versions",
        EntityType::ActivationKeys => "katello/api/activation_keys",
        EntityType::Hosts => "api/hosts",
        EntityType::ConfigTemplates => "api/config_templates",
    }
}

/// Request body for a creation or update. Some resources expect their
/// attributes nested under the singular resource name.
fn body_for(resource: EntityType, attrs: &Attributes) -> Value {
    match resource {
        EntityType::Users => json!({ "user": attrs }),
        EntityType::ConfigTemplates => json!({ "config_template": attrs }),
        EntityType::Organizations => {
            let mut body = attrs.clone();
            if let Some(name) = attrs.get("name") {
                body.insert("organization".into(), json!({ "name": name }));
            }
            Value::Object(body)
        }
        _ => Value::Object(attrs.clone()),
    }
}

/// Turn a 422 body into a conflict on an attribute present in `attrs`.
///
/// Accepts `{"errors": {field: [msg, ..]}}`, optionally wrapped in `error`.
pub fn parse_conflict(body: &str, attrs: &Attributes) -> Option<ApiError> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let root = parsed.get("error").unwrap_or(&parsed);
    let errors = root.get("errors")?.as_object()?;
    errors.iter().find_map(|(field, messages)| {
        let first = messages.as_array()?.first()?.as_str()?;
        let unique = UNIQUENESS_MESSAGES.iter().any(|m| first.contains(m));
        (unique && attrs.contains_key(field)).then(|| ApiError::Conflict {
            attribute: field.clone(),
            message: first.to_string(),
        })
    })
}

fn entity_from(value: Value) -> ApiResult<Entity> {
    match value {
        Value::Object(map) => Ok(Entity::new(map)),
        other => Err(ApiError::Malformed(format!("expected an object, got {other}"))),
    }
}

impl HttpApi {
    pub fn new(server: &str, username: &str, password: &str) -> ApiResult<Self> {
        let mut base = Url::parse(server)
            .map_err(|e| ApiError::Transport(format!("invalid server url '{server}': {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn url(&self, path: &str) -> ApiResult<Url> {
        self.base
            .join(path)
            .map_err(|e| ApiError::Transport(format!("invalid path '{path}': {e}")))
    }

    fn request(&self, method: Method, path: &str) -> ApiResult<RequestBuilder> {
        let url = self.url(path)?;
        trace!(%method, %url, "api request");
        Ok(self
            .client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json"))
    }

    fn send(&self, builder: RequestBuilder, attrs: Option<&Attributes>) -> ApiResult<Value> {
        let response = builder
            .send()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        self.decode(response, attrs)
    }

    fn decode(&self, response: Response, attrs: Option<&Attributes>) -> ApiResult<Value> {
        let status = response.status();
        let url = response.url().to_string();
        let body = response
            .text()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body)
                .map_err(|e| ApiError::Malformed(format!("{url}: {e}")));
        }

        debug!(status = status.as_u16(), %url, "api request failed");
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            if let Some(conflict) = attrs.and_then(|a| parse_conflict(&body, a)) {
                return Err(conflict);
            }
        }
        Err(ApiError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    fn not_found(resource: EntityType, id: &FieldValue, err: ApiError) -> ApiError {
        match err {
            ApiError::Rejected { status: 404, .. } => ApiError::NotFound {
                resource: resource.to_string(),
                id: id.to_string(),
            },
            other => other,
        }
    }
}

impl RemoteApi for HttpApi {
    fn create(&self, resource: EntityType, attrs: &Attributes) -> ApiResult<Entity> {
        let builder = self
            .request(Method::POST, collection(resource))?
            .json(&body_for(resource, attrs));
        entity_from(self.send(builder, Some(attrs))?)
    }

    fn show(&self, resource: EntityType, id: &FieldValue) -> ApiResult<Entity> {
        let path = format!("{}/{id}", collection(resource));
        let builder = self.request(Method::GET, &path)?;
        let value = self
            .send(builder, None)
            .map_err(|e| Self::not_found(resource, id, e))?;
        entity_from(value)
    }

    fn index(&self, resource: EntityType, filter: &Attributes) -> ApiResult<Vec<Entity>> {
        let mut query: Vec<(String, String)> = vec![("per_page".into(), PER_PAGE.to_string())];
        for (key, value) in filter {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if key != "per_page" {
                query.push((key.clone(), rendered));
            }
        }
        let builder = self.request(Method::GET, collection(resource))?.query(&query);
        let value = self.send(builder, None)?;
        let results = value
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::Malformed(format!("{resource} listing has no results")))?;
        results.iter().cloned().map(entity_from).collect()
    }

    fn update(
        &self,
        resource: EntityType,
        id: &FieldValue,
        attrs: &Attributes,
    ) -> ApiResult<Entity> {
        let path = format!("{}/{id}", collection(resource));
        let builder = self
            .request(Method::PUT, &path)?
            .json(&body_for(resource, attrs));
        let value = self
            .send(builder, Some(attrs))
            .map_err(|e| Self::not_found(resource, id, e))?;
        entity_from(value)
    }

    fn destroy(&self, resource: EntityType, id: &FieldValue) -> ApiResult<()> {
        let path = format!("{}/{id}", collection(resource));
        let builder = self.request(Method::DELETE, &path)?;
        self.send(builder, None)
            .map_err(|e| Self::not_found(resource, id, e))?;
        Ok(())
    }

    fn start_job(&self, resource: EntityType, action: &str, id: &FieldValue) -> ApiResult<JobId> {
        let path = format!("{}/{id}/{action}", collection(resource));
        let builder = self.request(Method::POST, &path)?.json(&json!({}));
        let value = self
            .send(builder, None)
            .map_err(|e| Self::not_found(resource, id, e))?;
        match value.get("id") {
            Some(Value::String(task)) => Ok(task.clone()),
            Some(Value::Number(task)) => Ok(task.to_string()),
            _ => Err(ApiError::Malformed(format!(
                "{action} of {resource} {id} returned no task id"
            ))),
        }
    }

    fn batch_status(&self, job_ids: &[JobId]) -> ApiResult<HashMap<JobId, JobState>> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let searches: Vec<Value> = job_ids
            .iter()
            .map(|id| json!({ "type": "task", "task_id": id }))
            .collect();
        let builder = self
            .request(Method::POST, "foreman_tasks/api/tasks/bulk_search")?
            .json(&json!({ "searches": searches }));
        let value = self.send(builder, None)?;

        let mut states = HashMap::new();
        let groups = value
            .as_array()
            .ok_or_else(|| ApiError::Malformed("bulk search did not return a list".into()))?;
        for group in groups {
            let Some(results) = group.get("results").and_then(Value::as_array) else {
                continue;
            };
            for task in results {
                let (Some(id), Some(state)) = (
                    task.get("id").and_then(Value::as_str),
                    task.get("state").and_then(Value::as_str),
                ) else {
                    continue;
                };
                states.insert(id.to_string(), JobState::parse(state));
            }
        }
        Ok(states)
    }
}
