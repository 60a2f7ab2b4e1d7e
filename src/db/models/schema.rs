use serde::{Deserialize, Serialize};

use super::Severity;

crate::sql_text_enum! {
    pub enum SchemaChangeType {
        TableAdded => "table_added",
        TableRemoved => "table_removed",
        ColumnAdded => "column_added",
        ColumnRemoved => "column_removed",
        ColumnModified => "column_modified",
    }
}

/// A captured schema version. `table_definitions` is the canonical JSON the
/// hash was computed over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    pub id: String,
    pub version_number: i64,
    pub version_label: String,
    pub hash: String,
    pub table_definitions: String,
    pub captured_at: String,
}

/// A single structural difference between two schema versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaChange {
    pub change_type: SchemaChangeType,
    pub table_name: String,
    pub column_name: Option<String>,
    pub severity: Severity,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaChangeRecord {
    pub id: String,
    pub version_id: String,
    #[serde(flatten)]
    pub change: SchemaChange,
    pub created_at: String,
}
