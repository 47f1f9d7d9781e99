use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Remote resource kinds on the target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Organizations,
    Users,
    HostCollections,
    Products,
    Repositories,
    RepositorySets,
    ContentViews,
    ContentViewVersions,
    ActivationKeys,
    Hosts,
    ConfigTemplates,
}

/// Policy applied when the target rejects a creation on a uniqueness conflict.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum RecoverStrategy {
    #[default]
    Rename,
    Map,
    #[serde(rename = "none")]
    #[value(name = "none")]
    Fail,
}

/// Summary verbs reported at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Created,
    Mapped,
    Found,
    Deleted,
    Skipped,
    Failed,
}

pub type Attributes = Map<String, Value>;

/// Last known attribute map of a remote entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Attributes);

impl EntityType {
    pub const ALL: [EntityType; 11] = [
        Self::Organizations,
        Self::Users,
        Self::HostCollections,
        Self::Products,
        Self::Repositories,
        Self::RepositorySets,
        Self::ContentViews,
        Self::ContentViewVersions,
        Self::ActivationKeys,
        Self::Hosts,
        Self::ConfigTemplates,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Organizations => "organizations",
            Self::Users => "users",
            Self::HostCollections => "host_collections",
            Self::Products => "products",
            Self::Repositories => "repositories",
            Self::RepositorySets => "repository_sets",
            Self::ContentViews => "content_views",
            Self::ContentViewVersions => "content_view_versions",
            Self::ActivationKeys => "activation_keys",
            Self::Hosts => "hosts",
            Self::ConfigTemplates => "config_templates",
        }
    }

    /// Entity type whose ids scope listings of this one.
    pub fn prerequisite(self) -> Option<EntityType> {
        match self {
            Self::ActivationKeys
            | Self::ContentViews
            | Self::ContentViewVersions
            | Self::HostCollections
            | Self::Products
            | Self::Repositories
            | Self::Hosts => Some(Self::Organizations),
            Self::RepositorySets => Some(Self::Products),
            Self::Organizations | Self::Users | Self::ConfigTemplates => None,
        }
    }

    /// Name of the listing filter that scopes by this entity type.
    pub fn scope_param(self) -> String {
        format!("{}_id", singular(self.as_str()).replace(' ', "_"))
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Display for RecoverStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rename => write!(f, "rename"),
            Self::Map => write!(f, "map"),
            Self::Fail => write!(f, "none"),
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Mapped => write!(f, "mapped"),
            Self::Found => write!(f, "found"),
            Self::Deleted => write!(f, "deleted"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl Entity {
    pub fn new(attrs: Attributes) -> Self {
        Self(attrs)
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.0.get(attribute)
    }

    pub fn id(&self) -> Option<&Value> {
        self.0.get("id")
    }

    pub fn str_attr(&self, attribute: &str) -> Option<&str> {
        self.0.get(attribute).and_then(Value::as_str)
    }

    pub fn attributes(&self) -> &Attributes {
        &self.0
    }

    pub fn into_attributes(self) -> Attributes {
        self.0
    }

    /// Human label for log lines: first of name, label, login.
    pub fn label(&self) -> Option<&str> {
        ["name", "label", "login"]
            .iter()
            .find_map(|key| self.str_attr(key))
    }
}

impl From<Attributes> for Entity {
    fn from(attrs: Attributes) -> Self {
        Self(attrs)
    }
}

/// `content_views` -> `content view`, `repositories` -> `repository`.
pub fn singular(plural: &str) -> String {
    let spaced = plural.replace('_', " ");
    let trimmed = spaced.strip_suffix('s').unwrap_or(&spaced);
    match trimmed.strip_suffix("ie") {
        Some(stem) => format!("{stem}y"),
        None => trimmed.to_string(),
    }
}
