//! The target system's entity API as seen by the importer.

pub mod http;
pub mod memory;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Attributes, Entity, EntityType};
use crate::store::codec::FieldValue;

pub type JobId = String;

/// Errors surfaced by a [`RemoteApi`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// The target refused a creation because `attribute` must be unique.
    #[error("{attribute} {message}")]
    Conflict { attribute: String, message: String },

    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "api_conflict",
            Self::Rejected { .. } => "api_rejected",
            Self::NotFound { .. } => "api_not_found",
            Self::Transport(_) => "api_transport",
            Self::Malformed(_) => "api_malformed",
        }
    }
}

/// State of an asynchronous remote job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Planned,
    Running,
    Paused,
    Stopped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Unknown states are treated as still pending.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stopped" => Self::Stopped,
            "paused" => Self::Paused,
            "planned" | "planning" | "pending" => Self::Planned,
            _ => Self::Running,
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Remote entity operations. Implementations must be shareable with the
/// reactor's worker thread.
pub trait RemoteApi: Send + Sync {
    fn create(&self, resource: EntityType, attrs: &Attributes) -> ApiResult<Entity>;

    fn show(&self, resource: EntityType, id: &FieldValue) -> ApiResult<Entity>;

    fn index(&self, resource: EntityType, filter: &Attributes) -> ApiResult<Vec<Entity>>;

    fn update(&self, resource: EntityType, id: &FieldValue, attrs: &Attributes)
    -> ApiResult<Entity>;

    fn destroy(&self, resource: EntityType, id: &FieldValue) -> ApiResult<()>;

    /// Start an asynchronous action (for example `sync`) on one entity and
    /// return the id of the remote job tracking it.
    fn start_job(&self, resource: EntityType, action: &str, id: &FieldValue) -> ApiResult<JobId>;

    /// Current state of each job in one round trip. Ids unknown to the
    /// remote are simply absent from the result.
    fn batch_status(&self, job_ids: &[JobId]) -> ApiResult<HashMap<JobId, JobState>>;
}
