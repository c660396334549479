use serde::{Deserialize, Serialize};

use crate::domain::Document;

/// One committed write, as delivered by the store's live change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: i64,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    /// Snapshot of the document as written. Tombstones carry `_deleted: true`.
    pub doc: Option<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResponse {
    pub ok: bool,
    pub id: String,
    pub rev: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub control_panel: bool,
    pub surface: String,
}
