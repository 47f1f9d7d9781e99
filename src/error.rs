use thiserror::Error;

use crate::remote::ApiError;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("mapping {mapping}: key {key} is already mapped")]
    KeyConflict { mapping: String, key: String },

    #[error("mapping {mapping}: key {key} does not exist")]
    UnknownKey { mapping: String, key: String },

    #[error("mapping {mapping}: {tuple} does not match schema ({expected})")]
    SchemaMismatch {
        mapping: String,
        tuple: String,
        expected: String,
    },

    #[error("corrupt mapping segment '{path}': {reason}")]
    MappingCorrupt { path: String, reason: String },

    #[error("unable to import, first import {entity} with id {key}")]
    MissingObject { entity: String, key: String },

    #[error("creation of {mapping} not recovered by '{strategy}' strategy")]
    ImportRecovery { mapping: String, strategy: String },

    #[error("unknown entity '{0}' (run `entity-import entities` for the list)")]
    UnknownEntity(String),

    #[error("unknown mapping '{0}'")]
    UnknownMapping(String),

    #[error("invalid csv: {0}")]
    InvalidCsv(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("async task reactor failed: {0}")]
    Reactor(String),

    #[error("locked by another process: {0}")]
    Locked(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::KeyConflict { .. } => "key_conflict",
            Self::UnknownKey { .. } => "unknown_key",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::MappingCorrupt { .. } => "mapping_corrupt",
            Self::MissingObject { .. } => "missing_object",
            Self::ImportRecovery { .. } => "import_recovery",
            Self::UnknownEntity(_) => "unknown_entity",
            Self::UnknownMapping(_) => "unknown_mapping",
            Self::InvalidCsv(_) => "invalid_csv",
            Self::Config(_) => "config_error",
            Self::Reactor(_) => "reactor_error",
            Self::Locked(_) => "locked",
            Self::Api(e) => e.code(),
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Csv(_) => "csv_error",
        }
    }

    /// Errors that only affect the row being processed; the row loop logs
    /// them and moves on. Everything else aborts the run.
    ///
    /// `InvalidCsv` raised inside the loop comes from one malformed cell.
    /// Header problems are reported before the loop starts.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            Self::MissingObject { .. }
                | Self::ImportRecovery { .. }
                | Self::Api(_)
                | Self::InvalidCsv(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;
