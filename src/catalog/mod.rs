//! Static descriptor table for every ALM resource the engine can fetch.
//!
//! Adding a resource type is a data change here plus a [`ResourceType`]
//! variant; the paginator, mapper and store are generic over descriptors.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{FetchError, FetchResult};

/// Records per page for paginated resources. Not caller-configurable.
pub const PAGE_SIZE: usize = 100;

pub const AUTHENTICATE_PATH: &str = "/authentication-point/authenticate";
pub const SITE_SESSION_PATH: &str = "/rest/site-session";
pub const LOGOUT_PATH: &str = "/authentication-point/logout";

const PROJECT_SCOPE: &str = "/rest/domains/{domain}/projects/{project}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Domains,
    Projects,
    TestFolders,
    Tests,
    DesignSteps,
    Attachments,
    Releases,
    ReleaseCycles,
    TestSets,
    TestRuns,
    Defects,
}

impl ResourceType {
    pub const ALL: [ResourceType; 11] = [
        ResourceType::Domains,
        ResourceType::Projects,
        ResourceType::TestFolders,
        ResourceType::Tests,
        ResourceType::DesignSteps,
        ResourceType::Attachments,
        ResourceType::Releases,
        ResourceType::ReleaseCycles,
        ResourceType::TestSets,
        ResourceType::TestRuns,
        ResourceType::Defects,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Domains => "domains",
            ResourceType::Projects => "projects",
            ResourceType::TestFolders => "test-folders",
            ResourceType::Tests => "tests",
            ResourceType::DesignSteps => "design-steps",
            ResourceType::Attachments => "attachments",
            ResourceType::Releases => "releases",
            ResourceType::ReleaseCycles => "release-cycles",
            ResourceType::TestSets => "test-sets",
            ResourceType::TestRuns => "test-runs",
            ResourceType::Defects => "defects",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| FetchError::UnknownResourceType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// Wire field that supplies a canonical entity's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    Id,
    /// Domain and project listings only carry names.
    Name,
}

impl IdentityField {
    pub fn field_name(&self) -> &'static str {
        match self {
            IdentityField::Id => "id",
            IdentityField::Name => "name",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub resource: ResourceType,
    pub path_template: &'static str,
    pub supports_pagination: bool,
    pub page_size: Option<usize>,
    pub filter_template: Option<&'static str>,
    pub sort_field: Option<&'static str>,
    pub sort_direction: SortDirection,
    pub extract_fields: &'static [&'static str],
    pub identity: IdentityField,
    /// JSON key holding the record array in a listing response
    pub list_key: &'static str,
}

const fn paged(
    resource: ResourceType,
    path_template: &'static str,
    filter_template: Option<&'static str>,
    sort_field: &'static str,
    sort_direction: SortDirection,
    extract_fields: &'static [&'static str],
) -> EndpointDescriptor {
    EndpointDescriptor {
        resource,
        path_template,
        supports_pagination: true,
        page_size: Some(PAGE_SIZE),
        filter_template,
        sort_field: Some(sort_field),
        sort_direction,
        extract_fields,
        identity: IdentityField::Id,
        list_key: "entities",
    }
}

static DESCRIPTORS: [EndpointDescriptor; 11] = [
    EndpointDescriptor {
        resource: ResourceType::Domains,
        path_template: "/rest/domains",
        supports_pagination: false,
        page_size: None,
        filter_template: None,
        sort_field: Some("name"),
        sort_direction: SortDirection::Asc,
        extract_fields: &["id", "name"],
        identity: IdentityField::Name,
        list_key: "results",
    },
    EndpointDescriptor {
        resource: ResourceType::Projects,
        path_template: "/rest/domains/{domain}/projects",
        supports_pagination: false,
        page_size: None,
        filter_template: None,
        sort_field: Some("name"),
        sort_direction: SortDirection::Asc,
        extract_fields: &["id", "name", "description"],
        identity: IdentityField::Name,
        list_key: "results",
    },
    paged(
        ResourceType::TestFolders,
        "/rest/domains/{domain}/projects/{project}/test-folders",
        Some("parent-id[{parent_id}]"),
        "id",
        SortDirection::Asc,
        &["id", "name", "parent-id", "description"],
    ),
    paged(
        ResourceType::Tests,
        "/rest/domains/{domain}/projects/{project}/tests",
        Some("parent-id[{parent_id}]"),
        "id",
        SortDirection::Asc,
        &["id", "name", "parent-id", "status", "description", "owner", "creation-time"],
    ),
    paged(
        ResourceType::DesignSteps,
        "/rest/domains/{domain}/projects/{project}/design-steps",
        Some("parent-id[{parent_id}]"),
        "step-order",
        SortDirection::Asc,
        &["id", "name", "parent-id", "step-order", "description", "expected"],
    ),
    paged(
        ResourceType::Attachments,
        "/rest/domains/{domain}/projects/{project}/attachments",
        Some("parent-id[{parent_id}];parent-type[{parent_type}]"),
        "id",
        SortDirection::Asc,
        &["id", "name", "parent-id", "parent-type", "file-size", "description"],
    ),
    paged(
        ResourceType::Releases,
        "/rest/domains/{domain}/projects/{project}/releases",
        None,
        "id",
        SortDirection::Asc,
        &["id", "name", "start-date", "end-date", "description"],
    ),
    paged(
        ResourceType::ReleaseCycles,
        "/rest/domains/{domain}/projects/{project}/release-cycles",
        Some("parent-id[{parent_id}]"),
        "id",
        SortDirection::Asc,
        &["id", "name", "parent-id", "start-date", "end-date"],
    ),
    paged(
        ResourceType::TestSets,
        "/rest/domains/{domain}/projects/{project}/test-sets",
        Some("cycle-id[{cycle_id}]"),
        "id",
        SortDirection::Asc,
        &["id", "name", "cycle-id", "status", "open-date"],
    ),
    paged(
        ResourceType::TestRuns,
        "/rest/domains/{domain}/projects/{project}/runs",
        Some("testcycl-id[{testset_id}]"),
        "id",
        SortDirection::Asc,
        &[
            "id",
            "name",
            "testcycl-id",
            "cycle-id",
            "test-id",
            "status",
            "owner",
            "execution-date",
        ],
    ),
    paged(
        ResourceType::Defects,
        "/rest/domains/{domain}/projects/{project}/defects",
        None,
        "id",
        SortDirection::Desc,
        &[
            "id",
            "name",
            "status",
            "severity",
            "priority",
            "detected-by",
            "owner",
            "creation-time",
            "detected-in-rcyc",
            "project",
            "has-attachments",
            "description",
        ],
    ),
];

/// Returns the descriptor for `resource`.
pub fn descriptor(resource: ResourceType) -> &'static EndpointDescriptor {
    // DESCRIPTORS is declared in variant order.
    &DESCRIPTORS[resource as usize]
}

/// Looks up a descriptor by wire name.
pub fn describe(name: &str) -> FetchResult<&'static EndpointDescriptor> {
    Ok(descriptor(name.parse()?))
}

/// Substitutes `{name}` placeholders with the supplied values.
///
/// Returns the first placeholder that had no value.
fn substitute<'a>(
    template: &'a str,
    values: &HashMap<String, String>,
    encode: bool,
) -> Result<String, &'a str> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 1..start + len];
        let value = values.get(name).ok_or(name)?;

        out.push_str(&rest[..start]);
        if encode {
            out.push_str(&urlencoding::encode(value));
        } else {
            out.push_str(value);
        }
        rest = &rest[start + len + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Builds the collection URL for `resource`.
///
/// Path parameter values are percent-encoded. Fails with
/// `MissingPathParameter` when a placeholder has no value.
pub fn build_url(
    base: &str,
    resource: ResourceType,
    path_params: &HashMap<String, String>,
) -> FetchResult<String> {
    let desc = descriptor(resource);
    let path = substitute(desc.path_template, path_params, true).map_err(|param| {
        FetchError::MissingPathParameter {
            resource: resource.to_string(),
            param: param.to_string(),
        }
    })?;
    Ok(format!("{}{}", base.trim_end_matches('/'), path))
}

/// URL of a single entity, e.g. `.../tests/{id}`.
pub fn detail_url(
    base: &str,
    resource: ResourceType,
    path_params: &HashMap<String, String>,
    id: &str,
) -> FetchResult<String> {
    let collection = build_url(base, resource, path_params)?;
    Ok(format!("{}/{}", collection, urlencoding::encode(id)))
}

/// URL of a nested collection under one entity, e.g. `.../runs/{id}/run-steps`.
pub fn sub_resource_url(
    base: &str,
    resource: ResourceType,
    path_params: &HashMap<String, String>,
    id: &str,
    sub: &str,
) -> FetchResult<String> {
    Ok(format!("{}/{}", detail_url(base, resource, path_params, id)?, sub))
}

/// URL of an attachment's binary content.
pub fn attachment_download_url(
    base: &str,
    domain: &str,
    project: &str,
    attachment_id: &str,
) -> String {
    format!(
        "{}{}/attachments/{}",
        base.trim_end_matches('/'),
        PROJECT_SCOPE
            .replace("{domain}", &urlencoding::encode(domain))
            .replace("{project}", &urlencoding::encode(project)),
        urlencoding::encode(attachment_id)
    )
}

/// Characters with meaning in the ALM query language.
const FILTER_RESERVED: [char; 5] = ['[', ']', '{', '}', ';'];

fn placeholders(template: &str) -> impl Iterator<Item = &str> {
    template
        .split('{')
        .skip(1)
        .filter_map(|part| part.split_once('}').map(|(name, _)| name))
}

/// Builds the ordered query parameters for one listing call.
///
/// A filter template with any unresolved placeholder is dropped entirely
/// rather than sent half-filled. A filter value containing a query-language
/// delimiter is rejected with `InvalidFilterValue`.
pub fn build_query(
    resource: ResourceType,
    offset: usize,
    page_size: usize,
    filters: &HashMap<String, String>,
) -> FetchResult<Vec<(String, String)>> {
    let desc = descriptor(resource);
    let mut query = Vec::new();

    if desc.supports_pagination {
        query.push(("page-size".to_string(), page_size.to_string()));
        query.push(("start-index".to_string(), offset.to_string()));
    }

    if let Some(template) = desc.filter_template {
        for param in placeholders(template) {
            if let Some(value) = filters.get(param) {
                if value.contains(FILTER_RESERVED) {
                    return Err(FetchError::InvalidFilterValue {
                        param: param.to_string(),
                        value: value.clone(),
                    });
                }
            }
        }

        match substitute(template, filters, false) {
            Ok(filter) => query.push(("query".to_string(), format!("{{{}}}", filter))),
            Err(missing) => {
                tracing::debug!(resource = %resource, placeholder = missing, "Filter dropped");
            }
        }
    }

    if let Some(field) = desc.sort_field {
        query.push((
            "order-by".to_string(),
            format!("{{{}[{}]}}", field, desc.sort_direction.as_str()),
        ));
    }

    if !desc.extract_fields.is_empty() {
        query.push(("fields".to_string(), desc.extract_fields.join(",")));
    }

    Ok(query)
}
