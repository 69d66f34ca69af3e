//! Sheet actions carried in the `data` field of edit messages.
//!
//! ```text
//! { "univerId": "...",
//!   "actionData": { "actionName": "SetRangeDataAction",
//!                   "sheetId": "sheet-01",
//!                   "cellValue": { "0": { "0": { "v": 42 } } } } }
//! ```
//!
//! Only two actions touch server state: cell writes are merged into the
//! workbook, selection changes are kept per client for presence. Everything
//! else is relayed without interpretation.

use serde::{Deserialize, Serialize};

use crate::workbook::CellMatrix;
use crate::SchemaError;

pub const SET_RANGE_DATA_ACTION: &str = "SetRangeDataAction";
pub const SET_SELECTION_VALUE_ACTION: &str = "SetSelectionValueAction";

/// Outer action envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionMessage {
    #[serde(rename = "univerId")]
    pub workbook_id: String,
    pub action_data: SheetActionData,
}

impl ActionMessage {
    pub fn parse(payload: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(payload).map_err(SchemaError::InvalidAction)
    }

    pub fn kind(&self) -> ActionKind {
        ActionKind::from_name(&self.action_data.action_name)
    }
}

/// Union of the action payloads the server reads.
///
/// Fields that a given action does not use stay at their defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SheetActionData {
    pub action_name: String,
    pub operation: i64,
    pub sheet_id: String,
    #[serde(skip_serializing_if = "CellMatrix::is_empty")]
    pub cell_value: CellMatrix,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub selections: Vec<SelectionModelValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    SetRangeData,
    SetSelectionValue,
    Other(String),
}

impl ActionKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            SET_RANGE_DATA_ACTION => ActionKind::SetRangeData,
            SET_SELECTION_VALUE_ACTION => ActionKind::SetSelectionValue,
            other => ActionKind::Other(other.to_string()),
        }
    }
}

/// Pixel and cell bounds of a selection rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Selection {
    pub start_x: f64,
    pub start_y: f64,
    pub end_x: f64,
    pub end_y: f64,
    pub start_row: i32,
    pub start_column: i32,
    pub end_row: i32,
    pub end_column: i32,
}

/// The active cell inside a selection.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CellInfo {
    pub start_x: f64,
    pub start_y: f64,
    pub end_x: f64,
    pub end_y: f64,
    pub row: i32,
    pub column: i32,
    pub is_merged: bool,
    pub is_merged_main_cell: bool,
    pub merge_info: Selection,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionModelValue {
    pub selection: Selection,
    pub cell: CellInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_range_write() {
        let payload = json!({
            "univerId": "wb-1",
            "actionData": {
                "actionName": "SetRangeDataAction",
                "sheetId": "S1",
                "cellValue": {"0": {"0": {"v": 42}}, "4": {"2": {"v": "x"}}}
            }
        })
        .to_string();

        let msg = ActionMessage::parse(&payload).unwrap();
        assert_eq!(msg.kind(), ActionKind::SetRangeData);
        assert_eq!(msg.workbook_id, "wb-1");
        assert_eq!(msg.action_data.sheet_id, "S1");
        assert_eq!(msg.action_data.cell_value["4"]["2"], json!({"v": "x"}));
    }

    #[test]
    fn test_parse_selection() {
        let payload = json!({
            "actionData": {
                "actionName": "SetSelectionValueAction",
                "sheetId": "S1",
                "selections": [{
                    "selection": {"startRow": 1, "startColumn": 2, "endRow": 3, "endColumn": 4},
                    "cell": {"row": 1, "column": 2}
                }]
            }
        })
        .to_string();

        let msg = ActionMessage::parse(&payload).unwrap();
        assert_eq!(msg.kind(), ActionKind::SetSelectionValue);
        let sel = &msg.action_data.selections[0];
        assert_eq!(sel.selection.end_column, 4);
        assert_eq!(sel.cell.column, 2);
        assert!(msg.action_data.cell_value.is_empty());
    }

    #[test]
    fn test_unknown_action_name() {
        let msg = ActionMessage::parse(r#"{"actionData":{"actionName":"InsertRowAction"}}"#).unwrap();
        assert_eq!(msg.kind(), ActionKind::Other("InsertRowAction".into()));
    }

    #[test]
    fn test_malformed_payload() {
        assert!(ActionMessage::parse("not json").is_err());
        assert!(ActionMessage::parse(r#"{"actionData": 5}"#).is_err());
    }
}
