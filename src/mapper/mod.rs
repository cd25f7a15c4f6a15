//! Converts ALM wire records into flat canonical entities.
//!
//! One algorithm serves every resource type; per-type differences live in
//! the catalog descriptors and the display tables.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{descriptor, ResourceType};
use crate::error::{FetchError, FetchResult};

mod display;

pub use display::{display_columns, field_alias, field_configs, FieldConfig};

/// One wire record: named fields, each with zero or one value.
///
/// A field that is present without a value maps to `None`, which is not the
/// same as the field being absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    fields: Vec<(String, Option<String>)>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: Option<&str>) -> Self {
        self.set(name, value.map(str::to_string));
        self
    }

    pub fn set(&mut self, name: &str, value: Option<String>) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    /// Value of `name`; `None` if absent or null.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    /// Parses either the ALM `{"Fields": [{"Name", "values": [{"value"}]}]}`
    /// shape or a flat JSON object.
    pub fn from_json(value: &Value) -> FetchResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| FetchError::InvalidResponse("record is not a JSON object".into()))?;

        let mut record = RawRecord::new();

        if let Some(fields) = object.get("Fields").and_then(Value::as_array) {
            for field in fields {
                let Some(name) = field.get("Name").and_then(Value::as_str) else {
                    continue;
                };
                let value = field
                    .get("values")
                    .and_then(Value::as_array)
                    .and_then(|values| values.first())
                    .and_then(|v| v.get("value"))
                    .and_then(scalar_to_string);
                record.set(name, value);
            }
        } else {
            for (name, value) in object {
                record.set(name, scalar_to_string(value));
            }
        }

        Ok(record)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Logical collection an entity is stored in.
///
/// Attachments fan out into one kind per parent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Domains,
    Projects,
    TestplanFolders,
    TestplanTests,
    TestplanTestDesignSteps,
    TestplanFolderAttachments,
    TestplanTestAttachments,
    TestplanTestDesignStepAttachments,
    TestlabReleases,
    TestlabReleaseCycles,
    TestlabTestsets,
    TestlabTestruns,
    TestlabTestsetAttachments,
    Defects,
    DefectAttachments,
    Attachments,
}

impl StorageKind {
    pub fn for_entity(resource: ResourceType, parent_type: Option<&str>) -> Self {
        match resource {
            ResourceType::Domains => StorageKind::Domains,
            ResourceType::Projects => StorageKind::Projects,
            ResourceType::TestFolders => StorageKind::TestplanFolders,
            ResourceType::Tests => StorageKind::TestplanTests,
            ResourceType::DesignSteps => StorageKind::TestplanTestDesignSteps,
            ResourceType::Releases => StorageKind::TestlabReleases,
            ResourceType::ReleaseCycles => StorageKind::TestlabReleaseCycles,
            ResourceType::TestSets => StorageKind::TestlabTestsets,
            ResourceType::TestRuns => StorageKind::TestlabTestruns,
            ResourceType::Defects => StorageKind::Defects,
            ResourceType::Attachments => match parent_type {
                Some("test-folder") => StorageKind::TestplanFolderAttachments,
                Some("test") => StorageKind::TestplanTestAttachments,
                Some("design-step") => StorageKind::TestplanTestDesignStepAttachments,
                Some("test-set") => StorageKind::TestlabTestsetAttachments,
                Some("defect") => StorageKind::DefectAttachments,
                _ => StorageKind::Attachments,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Domains => "domains",
            StorageKind::Projects => "projects",
            StorageKind::TestplanFolders => "testplan_folders",
            StorageKind::TestplanTests => "testplan_tests",
            StorageKind::TestplanTestDesignSteps => "testplan_test_design_steps",
            StorageKind::TestplanFolderAttachments => "testplan_folder_attachments",
            StorageKind::TestplanTestAttachments => "testplan_test_attachments",
            StorageKind::TestplanTestDesignStepAttachments => {
                "testplan_test_design_step_attachments"
            }
            StorageKind::TestlabReleases => "testlab_releases",
            StorageKind::TestlabReleaseCycles => "testlab_release_cycles",
            StorageKind::TestlabTestsets => "testlab_testsets",
            StorageKind::TestlabTestruns => "testlab_testruns",
            StorageKind::TestlabTestsetAttachments => "testlab_testset_attachments",
            StorageKind::Defects => "defects",
            StorageKind::DefectAttachments => "defect_attachments",
            StorageKind::Attachments => "attachments",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayField {
    pub field: String,
    pub alias: String,
    pub sequence: u32,
    pub display: bool,
    pub value: Option<String>,
}

/// Normalized entity, identical in shape for every resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub owner: String,
    pub group: String,
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub parent_type: Option<String>,
    pub entity_type: String,
    pub storage_kind: StorageKind,
    /// Every wire field, keyed by wire name
    pub fields: BTreeMap<String, Option<String>>,
    pub display_fields: Vec<DisplayField>,
    pub synced_at: DateTime<Utc>,
}

impl CanonicalEntity {
    /// Value of an arbitrary wire field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_deref())
    }
}

/// Maps one wire record to a canonical entity.
///
/// `parent_id` wins over the record's own `parent-id`. The group starts
/// empty and is assigned by the store writer.
pub fn to_canonical(
    resource: ResourceType,
    raw: &RawRecord,
    owner: &str,
    parent_id: Option<&str>,
) -> CanonicalEntity {
    let desc = descriptor(resource);

    let id = raw.get(desc.identity.field_name()).unwrap_or_default().to_string();
    let name = raw.get("name").unwrap_or_default().to_string();
    let parent_id = parent_id
        .map(str::to_string)
        .or_else(|| raw.get("parent-id").map(str::to_string));

    // Captured before the generic copy so nothing in `fields` can replace it.
    let parent_type = match resource {
        ResourceType::Attachments => raw.get("parent-type").map(str::to_string),
        _ => None,
    };

    let storage_kind = StorageKind::for_entity(resource, parent_type.as_deref());

    let fields: BTreeMap<String, Option<String>> = raw
        .fields()
        .map(|(n, v)| (n.to_string(), v.map(str::to_string)))
        .collect();

    let display_fields = field_configs(storage_kind)
        .iter()
        .map(|config| {
            let value = match config.field {
                "user" => Some(owner.to_string()),
                "id" => Some(id.clone()),
                "name" => Some(name.clone()),
                "parent_id" => parent_id.clone(),
                "parent_type" => parent_type.clone(),
                other => raw.get(other).map(str::to_string),
            };
            DisplayField {
                field: config.field.to_string(),
                alias: config.alias.to_string(),
                sequence: config.sequence,
                display: config.display,
                value,
            }
        })
        .collect();

    CanonicalEntity {
        owner: owner.to_string(),
        group: String::new(),
        id,
        name,
        parent_id,
        parent_type,
        entity_type: resource.as_str().to_string(),
        storage_kind,
        fields,
        display_fields,
        synced_at: Utc::now(),
    }
}

/// User-facing projection: displayable fields only, keyed by alias, in
/// sequence order.
pub fn to_display(entity: &CanonicalEntity) -> Vec<(String, Option<String>)> {
    let mut shown: Vec<&DisplayField> =
        entity.display_fields.iter().filter(|d| d.display).collect();
    shown.sort_by_key(|d| d.sequence);
    shown
        .into_iter()
        .map(|d| (d.alias.clone(), d.value.clone()))
        .collect()
}
