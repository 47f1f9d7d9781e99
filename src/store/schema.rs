use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ImportError;
use crate::model::EntityType;
use crate::store::codec::{describe, Field, FieldType};

/// Every mapping the importers may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingName {
    ActivationKeys,
    AkContentViews,
    ContentViews,
    HostCollections,
    Hosts,
    LocalRepositories,
    Organizations,
    Products,
    PuppetRepositories,
    RedhatContentViews,
    RedhatRepositories,
    Repositories,
    SystemContentViews,
    TemplateSnippets,
    Users,
}

/// Fixed shape of one mapping: typed key fields, typed value fields, and the
/// remote entity type its values identify.
#[derive(Debug)]
pub struct MappingSchema {
    pub name: MappingName,
    pub key: &'static [Field],
    pub value: &'static [Field],
    pub target: EntityType,
}

pub const DELETE_COLUMN: &str = "delete";

const SAT5: &[Field] = &[Field::int("sat5")];
const SAT6_INT: &[Field] = &[Field::int("sat6")];
const SAT6_STR: &[Field] = &[Field::string("sat6")];
const ORG_CHANNEL: &[Field] = &[Field::int("org_id"), Field::int("channel_id")];

static SCHEMAS: [MappingSchema; 15] = [
    MappingSchema {
        name: MappingName::ActivationKeys,
        key: &[Field::string("org_id")],
        value: SAT6_INT,
        target: EntityType::ActivationKeys,
    },
    MappingSchema {
        name: MappingName::AkContentViews,
        key: &[Field::string("ak_id")],
        value: SAT6_INT,
        target: EntityType::ContentViews,
    },
    MappingSchema {
        name: MappingName::ContentViews,
        key: SAT5,
        value: SAT6_INT,
        target: EntityType::ContentViews,
    },
    MappingSchema {
        name: MappingName::HostCollections,
        key: SAT5,
        value: SAT6_INT,
        target: EntityType::HostCollections,
    },
    MappingSchema {
        name: MappingName::Hosts,
        key: SAT5,
        value: SAT6_STR,
        target: EntityType::Hosts,
    },
    MappingSchema {
        name: MappingName::LocalRepositories,
        key: ORG_CHANNEL,
        value: SAT6_INT,
        target: EntityType::Repositories,
    },
    MappingSchema {
        name: MappingName::Organizations,
        key: SAT5,
        value: SAT6_INT,
        target: EntityType::Organizations,
    },
    MappingSchema {
        name: MappingName::Products,
        key: &[Field::int("org_id"), Field::string("label")],
        value: SAT6_INT,
        target: EntityType::Products,
    },
    MappingSchema {
        name: MappingName::PuppetRepositories,
        key: ORG_CHANNEL,
        value: SAT6_INT,
        target: EntityType::Repositories,
    },
    MappingSchema {
        name: MappingName::RedhatContentViews,
        key: ORG_CHANNEL,
        value: SAT6_INT,
        target: EntityType::ContentViews,
    },
    MappingSchema {
        name: MappingName::RedhatRepositories,
        key: ORG_CHANNEL,
        value: SAT6_INT,
        target: EntityType::Repositories,
    },
    MappingSchema {
        name: MappingName::Repositories,
        key: SAT5,
        value: SAT6_INT,
        target: EntityType::Repositories,
    },
    MappingSchema {
        name: MappingName::SystemContentViews,
        key: &[Field::string("ch_seq")],
        value: SAT6_INT,
        target: EntityType::ContentViews,
    },
    MappingSchema {
        name: MappingName::TemplateSnippets,
        key: &[Field::int("id")],
        value: SAT6_INT,
        target: EntityType::ConfigTemplates,
    },
    MappingSchema {
        name: MappingName::Users,
        key: SAT5,
        value: SAT6_INT,
        target: EntityType::Users,
    },
];

impl MappingName {
    pub const ALL: [MappingName; 15] = [
        Self::ActivationKeys,
        Self::AkContentViews,
        Self::ContentViews,
        Self::HostCollections,
        Self::Hosts,
        Self::LocalRepositories,
        Self::Organizations,
        Self::Products,
        Self::PuppetRepositories,
        Self::RedhatContentViews,
        Self::RedhatRepositories,
        Self::Repositories,
        Self::SystemContentViews,
        Self::TemplateSnippets,
        Self::Users,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActivationKeys => "activation_keys",
            Self::AkContentViews => "ak_content_views",
            Self::ContentViews => "content_views",
            Self::HostCollections => "host_collections",
            Self::Hosts => "hosts",
            Self::LocalRepositories => "local_repositories",
            Self::Organizations => "organizations",
            Self::Products => "products",
            Self::PuppetRepositories => "puppet_repositories",
            Self::RedhatContentViews => "redhat_content_views",
            Self::RedhatRepositories => "redhat_repositories",
            Self::Repositories => "repositories",
            Self::SystemContentViews => "system_content_views",
            Self::TemplateSnippets => "template_snippets",
            Self::Users => "users",
        }
    }

    pub fn schema(self) -> &'static MappingSchema {
        // SCHEMAS is declared in the same order as ALL.
        &SCHEMAS[self as usize]
    }

    pub fn target(self) -> EntityType {
        self.schema().target
    }
}

impl fmt::Display for MappingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MappingName {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == wanted)
            .ok_or_else(|| ImportError::UnknownMapping(s.to_string()))
    }
}

impl MappingSchema {
    /// Segment header: key names, value names, then the delete column.
    pub fn header(&self) -> Vec<&'static str> {
        self.key
            .iter()
            .chain(self.value)
            .map(|f| f.name)
            .chain(std::iter::once(DELETE_COLUMN))
            .collect()
    }

    /// Type of the target id when the value is a single field.
    pub fn target_id_type(&self) -> Option<FieldType> {
        match self.value {
            [only] => Some(only.ty),
            _ => None,
        }
    }

    pub fn describe_key(&self) -> String {
        describe(self.key)
    }

    pub fn describe_value(&self) -> String {
        describe(self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_table_is_indexed_by_name() {
        for name in MappingName::ALL {
            assert_eq!(name.schema().name, name, "{name}");
        }
    }

    #[test]
    fn header_lists_keys_values_and_delete_column() {
        assert_eq!(
            MappingName::Products.schema().header(),
            vec!["org_id", "label", "sat6", "delete"]
        );
        assert_eq!(
            MappingName::Organizations.schema().header(),
            vec!["sat5", "sat6", "delete"]
        );
    }

    #[test]
    fn parse_accepts_dashed_names() {
        assert_eq!(
            "host-collections".parse::<MappingName>().unwrap(),
            MappingName::HostCollections
        );
        assert!("widgets".parse::<MappingName>().is_err());
    }

    #[test]
    fn hosts_map_to_string_ids() {
        assert_eq!(
            MappingName::Hosts.schema().target_id_type(),
            Some(FieldType::Str)
        );
        assert_eq!(MappingName::TemplateSnippets.target(), EntityType::ConfigTemplates);
    }
}
