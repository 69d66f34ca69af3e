//! # gridsync-core — workbook document model
//!
//! Serde shapes for the spreadsheet configuration that clients render and
//! the hub persists, plus the sheet actions clients send while editing.
//!
//! ## Modules
//!
//! - [`workbook`] — `WorkbookConfig` / `WorksheetConfig` and the cell grid
//! - [`action`] — action envelopes carried inside `data` messages
//!
//! Every struct defaults missing fields and keeps unknown keys, so a stored
//! config survives a load → edit → flush cycle without losing data the
//! server does not understand.

pub mod action;
pub mod workbook;

pub use action::{
    ActionKind, ActionMessage, CellInfo, Selection, SelectionModelValue, SheetActionData,
    SET_RANGE_DATA_ACTION, SET_SELECTION_VALUE_ACTION,
};
pub use workbook::{
    BooleanNumber, CellMatrix, ColumnTitle, DocumentKind, GridRange, LocaleType, NamedRange,
    RangeData, RowTitle, SheetType, WorkbookConfig, WorksheetConfig,
};

/// Errors raised while decoding document JSON.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Invalid workbook config: {0}")]
    InvalidConfig(#[source] serde_json::Error),

    #[error("Invalid action payload: {0}")]
    InvalidAction(#[source] serde_json::Error),

    #[error("Failed to encode workbook config: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Unknown document kind: {0}")]
    UnknownKind(String),
}
