//! Per-storage-kind display configuration: alias, column order, visibility.

use super::StorageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldConfig {
    pub field: &'static str,
    pub alias: &'static str,
    pub sequence: u32,
    pub display: bool,
}

const fn f(field: &'static str, alias: &'static str, sequence: u32, display: bool) -> FieldConfig {
    FieldConfig {
        field,
        alias,
        sequence,
        display,
    }
}

const DOMAINS: &[FieldConfig] = &[
    f("user", "Username", 1, false),
    f("id", "Domain ID", 2, true),
    f("name", "Domain Name", 3, true),
    f("parent_id", "Parent ID", 4, false),
];

const PROJECTS: &[FieldConfig] = &[
    f("user", "Username", 1, false),
    f("id", "Project ID", 2, true),
    f("name", "Project Name", 3, true),
    f("parent_id", "Domain", 4, true),
];

const TESTPLAN_FOLDERS: &[FieldConfig] = &[
    f("user", "Username", 1, false),
    f("id", "Folder ID", 2, true),
    f("name", "Folder Name", 3, true),
    f("parent_id", "Parent Folder ID", 4, false),
    f("description", "Description", 5, true),
];

const TESTPLAN_TESTS: &[FieldConfig] = &[
    f("user", "Username", 1, false),
    f("id", "Test ID", 2, true),
    f("name", "Test Name", 3, true),
    f("parent_id", "Parent Folder ID", 4, false),
    f("status", "Status", 5, true),
    f("owner", "Owner", 6, true),
    f("description", "Description", 7, true),
    f("creation-time", "Created On", 8, true),
];

const DESIGN_STEPS: &[FieldConfig] = &[
    f("user", "Username", 1, false),
    f("id", "Step ID", 2, true),
    f("name", "Step Name", 3, true),
    f("parent_id", "Test ID", 4, false),
    f("step-order", "Step Order", 5, true),
    f("description", "Description", 6, true),
    f("expected", "Expected Result", 7, true),
];

const RELEASES: &[FieldConfig] = &[
    f("user", "Username", 1, false),
    f("id", "Release ID", 2, true),
    f("name", "Release Name", 3, true),
    f("parent_id", "Project ID", 4, false),
    f("start-date", "Start Date", 5, true),
    f("end-date", "End Date", 6, true),
    f("description", "Description", 7, true),
];

const RELEASE_CYCLES: &[FieldConfig] = &[
    f("user", "Username", 1, false),
    f("id", "Cycle ID", 2, true),
    f("name", "Cycle Name", 3, true),
    f("parent_id", "Release ID", 4, false),
    f("start-date", "Start Date", 5, true),
    f("end-date", "End Date", 6, true),
];

const TEST_SETS: &[FieldConfig] = &[
    f("user", "Username", 1, false),
    f("id", "Test Set ID", 2, true),
    f("name", "Test Set Name", 3, true),
    f("parent_id", "Cycle ID", 4, false),
    f("status", "Status", 5, true),
    f("open-date", "Open Date", 6, true),
];

const TEST_RUNS: &[FieldConfig] = &[
    f("user", "Username", 1, false),
    f("id", "Test Run ID", 2, true),
    f("name", "Test Run Name", 3, true),
    f("parent_id", "Test Set ID", 4, false),
    f("test-id", "Test Case ID", 5, true),
    f("status", "Status", 6, true),
    f("owner", "Owner", 7, true),
    f("execution-date", "Execution Date", 8, true),
];

const DEFECTS: &[FieldConfig] = &[
    f("user", "Username", 1, false),
    f("id", "Defect ID", 2, true),
    f("name", "Defect Summary", 3, true),
    f("parent_id", "Project ID", 4, false),
    f("status", "Status", 5, true),
    f("severity", "Severity", 6, true),
    f("priority", "Priority", 7, true),
    f("owner", "Owner", 8, true),
    f("detected-by", "Detected By", 9, true),
    f("assigned-to", "Assigned To", 10, true),
    f("creation-time", "Created On", 11, true),
    f("last-modified", "Last Modified", 12, true),
    f("detected-in-rel", "Detected In Release", 13, true),
    f("detected-in-rcyc", "Detected In Cycle", 14, true),
    f("target-rel", "Target Release", 15, true),
    f("target-rcyc", "Target Cycle", 16, true),
    f("reproducible", "Reproducible", 17, true),
    f("has-attachments", "Has Attachments", 18, true),
    f("description", "Description", 19, true),
    f("steps-to-reproduce", "Steps to Reproduce", 20, true),
    f("expected-result", "Expected Result", 21, true),
    f("actual-result", "Actual Result", 22, true),
    f("resolution", "Resolution", 23, true),
];

// Attachment tables differ only in what the parent column is called.
macro_rules! attachment_fields {
    ($parent_alias:expr) => {
        &[
            f("user", "Username", 1, false),
            f("id", "Attachment ID", 2, true),
            f("name", "File Name", 3, true),
            f("parent_id", $parent_alias, 4, false),
            f("parent_type", "Parent Type", 5, false),
            f("file-size", "File Size", 6, true),
            f("description", "Description", 7, true),
        ]
    };
}

const FOLDER_ATTACHMENTS: &[FieldConfig] = attachment_fields!("Folder ID");
const TEST_ATTACHMENTS: &[FieldConfig] = attachment_fields!("Test ID");
const STEP_ATTACHMENTS: &[FieldConfig] = attachment_fields!("Step ID");
const TESTSET_ATTACHMENTS: &[FieldConfig] = attachment_fields!("Test Set ID");
const DEFECT_ATTACHMENTS: &[FieldConfig] = attachment_fields!("Defect ID");
const GENERIC_ATTACHMENTS: &[FieldConfig] = attachment_fields!("Parent ID");

/// Field configuration for a storage kind, in declaration order.
pub fn field_configs(kind: StorageKind) -> &'static [FieldConfig] {
    match kind {
        StorageKind::Domains => DOMAINS,
        StorageKind::Projects => PROJECTS,
        StorageKind::TestplanFolders => TESTPLAN_FOLDERS,
        StorageKind::TestplanTests => TESTPLAN_TESTS,
        StorageKind::TestplanTestDesignSteps => DESIGN_STEPS,
        StorageKind::TestplanFolderAttachments => FOLDER_ATTACHMENTS,
        StorageKind::TestplanTestAttachments => TEST_ATTACHMENTS,
        StorageKind::TestplanTestDesignStepAttachments => STEP_ATTACHMENTS,
        StorageKind::TestlabReleases => RELEASES,
        StorageKind::TestlabReleaseCycles => RELEASE_CYCLES,
        StorageKind::TestlabTestsets => TEST_SETS,
        StorageKind::TestlabTestruns => TEST_RUNS,
        StorageKind::TestlabTestsetAttachments => TESTSET_ATTACHMENTS,
        StorageKind::Defects => DEFECTS,
        StorageKind::DefectAttachments => DEFECT_ATTACHMENTS,
        StorageKind::Attachments => GENERIC_ATTACHMENTS,
    }
}

/// Displayable fields for a storage kind, ordered by sequence.
pub fn display_columns(kind: StorageKind) -> Vec<FieldConfig> {
    let mut columns: Vec<FieldConfig> = field_configs(kind)
        .iter()
        .filter(|c| c.display)
        .copied()
        .collect();
    columns.sort_by_key(|c| c.sequence);
    columns
}

/// Alias for `field`, falling back to the field name itself.
pub fn field_alias(kind: StorageKind, field: &str) -> String {
    field_configs(kind)
        .iter()
        .find(|c| c.field == field)
        .map(|c| c.alias.to_string())
        .unwrap_or_else(|| field.to_string())
}
