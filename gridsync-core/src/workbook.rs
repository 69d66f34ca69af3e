//! Workbook configuration: the durable representation of a document.
//!
//! Field names follow the JSON the spreadsheet front-end produces
//! (`camelCase`). All structs are `#[serde(default)]` and carry a flattened
//! `extra` map so unknown keys round-trip untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::SchemaError;

/// Sparse cell grid: row key → column key → cell value.
///
/// Keys are decimal row/column indices as strings (JSON object keys).
/// Cell values are opaque to the server.
pub type CellMatrix = BTreeMap<String, BTreeMap<String, Value>>;

/// 0/1 flag used by the front-end instead of JSON booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BooleanNumber {
    #[default]
    False,
    True,
}

impl BooleanNumber {
    pub fn is_false(&self) -> bool {
        *self == BooleanNumber::False
    }
}

impl TryFrom<u8> for BooleanNumber {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BooleanNumber::False),
            1 => Ok(BooleanNumber::True),
            other => Err(format!("expected 0 or 1, got {other}")),
        }
    }
}

impl From<BooleanNumber> for u8 {
    fn from(value: BooleanNumber) -> Self {
        match value {
            BooleanNumber::False => 0,
            BooleanNumber::True => 1,
        }
    }
}

/// Workbook locale. Locales the server has no name for are kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LocaleType {
    #[default]
    En,
    Zh,
    Other(String),
}

impl From<String> for LocaleType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "en" => LocaleType::En,
            "zh" => LocaleType::Zh,
            _ => LocaleType::Other(value),
        }
    }
}

impl From<LocaleType> for String {
    fn from(value: LocaleType) -> Self {
        match value {
            LocaleType::En => "en".to_string(),
            LocaleType::Zh => "zh".to_string(),
            LocaleType::Other(s) => s,
        }
    }
}

/// Sheet layout kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SheetType {
    #[default]
    Grid,
    Kanban,
    Gantt,
}

impl TryFrom<u8> for SheetType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SheetType::Grid),
            1 => Ok(SheetType::Kanban),
            2 => Ok(SheetType::Gantt),
            other => Err(format!("unknown sheet type {other}")),
        }
    }
}

impl From<SheetType> for u8 {
    fn from(value: SheetType) -> Self {
        match value {
            SheetType::Grid => 0,
            SheetType::Kanban => 1,
            SheetType::Gantt => 2,
        }
    }
}

/// What a stored document was created as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Sheet,
    Doc,
    Slide,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Sheet => "sheet",
            DocumentKind::Doc => "doc",
            DocumentKind::Slide => "slide",
        }
    }
}

impl FromStr for DocumentKind {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sheet" => Ok(DocumentKind::Sheet),
            "doc" => Ok(DocumentKind::Doc),
            "slide" => Ok(DocumentKind::Slide),
            other => Err(SchemaError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RangeData {
    pub start_row: i32,
    pub start_column: i32,
    pub end_row: i32,
    pub end_column: i32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GridRange {
    pub sheet_id: String,
    pub range_data: RangeData,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamedRange {
    pub named_range_id: String,
    pub name: String,
    pub range: GridRange,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RowTitle {
    pub width: i32,
    #[serde(skip_serializing_if = "BooleanNumber::is_false")]
    pub hidden: BooleanNumber,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnTitle {
    pub height: i32,
    #[serde(skip_serializing_if = "BooleanNumber::is_false")]
    pub hidden: BooleanNumber,
}

/// One sheet of a workbook.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorksheetConfig {
    #[serde(rename = "type")]
    pub sheet_type: SheetType,
    pub id: String,
    pub name: String,
    pub tab_color: String,
    pub hidden: BooleanNumber,
    pub freeze_row: i32,
    pub freeze_column: i32,
    pub row_count: i32,
    pub column_count: i32,
    pub zoom_ratio: f64,
    pub scroll_top: f64,
    pub scroll_left: f64,
    pub default_column_width: i32,
    pub default_row_height: i32,
    pub merge_data: Vec<RangeData>,
    pub hide_row: Vec<i32>,
    pub hide_column: Vec<i32>,
    pub status: BooleanNumber,
    pub cell_data: CellMatrix,
    pub row_data: Value,
    pub column_data: Value,
    pub show_gridlines: BooleanNumber,
    pub row_title: RowTitle,
    pub column_title: ColumnTitle,
    pub selections: Vec<Value>,
    pub right_to_left: BooleanNumber,
    pub plugin_meta: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorksheetConfig {
    /// An empty grid sheet with the front-end's default geometry.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            row_count: 1000,
            column_count: 20,
            zoom_ratio: 1.0,
            default_column_width: 88,
            default_row_height: 24,
            show_gridlines: BooleanNumber::True,
            row_title: RowTitle { width: 46, hidden: BooleanNumber::False },
            column_title: ColumnTitle { height: 20, hidden: BooleanNumber::False },
            ..Self::default()
        }
    }
}

/// Top-level document configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkbookConfig {
    pub created_time: String,
    pub last_modified_by: String,
    pub id: String,
    pub locale: LocaleType,
    pub name: String,
    pub theme: String,
    pub skin: String,
    pub modified_time: String,
    pub time_zone: String,
    pub creator: String,
    pub app_version: String,
    pub socket_url: String,
    pub socket_enable: BooleanNumber,
    pub extensions: Vec<Value>,
    pub styles: Map<String, Value>,
    pub sheets: BTreeMap<String, WorksheetConfig>,
    pub sheet_order: Vec<String>,
    pub plugin_meta: Map<String, Value>,
    pub named_ranges: Vec<NamedRange>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkbookConfig {
    /// A fresh configuration for a newly created document.
    ///
    /// Sheets get one empty grid sheet; other kinds start without sheets.
    pub fn blank(id: impl Into<String>, kind: DocumentKind) -> Self {
        let id = id.into();
        let mut config = Self {
            name: id.clone(),
            id,
            ..Self::default()
        };
        if kind == DocumentKind::Sheet {
            config.insert_sheet(WorksheetConfig::new("sheet-01"));
        }
        config
    }

    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(json).map_err(SchemaError::InvalidConfig)
    }

    pub fn to_json(&self) -> Result<String, SchemaError> {
        serde_json::to_string(self).map_err(SchemaError::Encode)
    }

    /// Add or replace a sheet, appending it to `sheet_order` if new.
    pub fn insert_sheet(&mut self, sheet: WorksheetConfig) {
        if !self.sheet_order.iter().any(|id| *id == sheet.id) {
            self.sheet_order.push(sheet.id.clone());
        }
        self.sheets.insert(sheet.id.clone(), sheet);
    }

    /// Upsert `cells` into the grid of `sheet_id`, key by key.
    ///
    /// Cells that `cells` does not address keep their current value. An
    /// unknown sheet id gets a new empty sheet first. Returns the number of
    /// cells written.
    pub fn merge_cells(&mut self, sheet_id: &str, cells: &CellMatrix) -> usize {
        if !self.sheets.contains_key(sheet_id) {
            log::debug!("Creating sheet {sheet_id} for incoming cell data");
            self.insert_sheet(WorksheetConfig::new(sheet_id));
        }
        let Some(sheet) = self.sheets.get_mut(sheet_id) else {
            return 0;
        };

        let mut written = 0;
        for (row, columns) in cells {
            let target = sheet.cell_data.entry(row.clone()).or_default();
            for (column, value) in columns {
                target.insert(column.clone(), value.clone());
                written += 1;
            }
        }
        written
    }

    /// Read a single cell value.
    pub fn cell(&self, sheet_id: &str, row: u32, column: u32) -> Option<&Value> {
        self.sheets
            .get(sheet_id)?
            .cell_data
            .get(&row.to_string())?
            .get(&column.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn matrix(entries: &[(u32, u32, Value)]) -> CellMatrix {
        let mut m = CellMatrix::new();
        for (r, c, v) in entries {
            m.entry(r.to_string()).or_default().insert(c.to_string(), v.clone());
        }
        m
    }

    #[test]
    fn test_merge_writes_cell() {
        let mut config = WorkbookConfig::blank("doc", DocumentKind::Sheet);
        let written = config.merge_cells("sheet-01", &matrix(&[(0, 0, json!({"v": 42}))]));
        assert_eq!(written, 1);
        assert_eq!(config.cell("sheet-01", 0, 0), Some(&json!({"v": 42})));
    }

    #[test]
    fn test_merge_preserves_untouched_cells() {
        let mut config = WorkbookConfig::blank("doc", DocumentKind::Sheet);
        config.merge_cells(
            "sheet-01",
            &matrix(&[(0, 0, json!({"v": 1})), (0, 1, json!({"v": 2})), (3, 3, json!({"v": 3}))]),
        );
        config.merge_cells("sheet-01", &matrix(&[(0, 1, json!({"v": "b"}))]));

        assert_eq!(config.cell("sheet-01", 0, 0), Some(&json!({"v": 1})));
        assert_eq!(config.cell("sheet-01", 0, 1), Some(&json!({"v": "b"})));
        assert_eq!(config.cell("sheet-01", 3, 3), Some(&json!({"v": 3})));
    }

    #[test]
    fn test_merge_creates_missing_sheet() {
        let mut config = WorkbookConfig::default();
        config.merge_cells("S1", &matrix(&[(2, 5, json!(7))]));
        assert_eq!(config.sheet_order, vec!["S1".to_string()]);
        assert_eq!(config.cell("S1", 2, 5), Some(&json!(7)));
        assert_eq!(config.cell("S1", 0, 0), None);
    }

    #[test]
    fn test_unknown_keys_survive_roundtrip() {
        let raw = json!({
            "id": "wb",
            "locale": "frFR",
            "socketEnable": 1,
            "customThing": {"a": [1, 2]},
            "sheets": {
                "s": {"id": "s", "type": 2, "cellData": {"1": {"1": {"v": "x"}}}, "vendorField": true}
            }
        });
        let config = WorkbookConfig::from_json(&raw.to_string()).unwrap();
        assert_eq!(config.locale, LocaleType::Other("frFR".into()));
        assert_eq!(config.socket_enable, BooleanNumber::True);
        assert_eq!(config.sheets["s"].sheet_type, SheetType::Gantt);

        let back: Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(back["customThing"], json!({"a": [1, 2]}));
        assert_eq!(back["locale"], json!("frFR"));
        assert_eq!(back["sheets"]["s"]["vendorField"], json!(true));
        assert_eq!(back["sheets"]["s"]["cellData"]["1"]["1"]["v"], json!("x"));
    }

    #[test]
    fn test_non_json_config_is_rejected() {
        assert!(matches!(
            WorkbookConfig::from_json("default"),
            Err(SchemaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_blank_kinds() {
        let sheet = WorkbookConfig::blank("a", DocumentKind::Sheet);
        assert_eq!(sheet.sheets.len(), 1);
        assert_eq!(sheet.sheets["sheet-01"].row_count, 1000);

        let doc = WorkbookConfig::blank("b", DocumentKind::Doc);
        assert!(doc.sheets.is_empty());
    }

    #[test]
    fn test_document_kind_parse() {
        assert_eq!("slide".parse::<DocumentKind>().unwrap(), DocumentKind::Slide);
        assert!("spreadsheet".parse::<DocumentKind>().is_err());
        assert_eq!(DocumentKind::Sheet.to_string(), "sheet");
    }

    #[test]
    fn test_row_title_hidden_omitted_when_false() {
        let title = RowTitle { width: 46, hidden: BooleanNumber::False };
        assert_eq!(serde_json::to_value(&title).unwrap(), json!({"width": 46}));
    }
}
