//! Event-driven reading of `.xls` and `.xlsx` workbooks.
//!
//! [`SheetReader`] sniffs the container, picks a backend, decrypts a password-protected
//! `.xls` workbook or OOXML package when given the password, then streams every populated cell to an
//! [`EventHandler`] with [`CellValue`] accessors for typed coercion.

mod decrypt;
mod dispatch;
mod error;
mod format;
mod handler;
mod lifecycle;
mod reader;
mod value;

pub use error::{BackendError, Error, OpenError};
pub use format::{detect_format, BackendKind, DocumentInfo, Source};
pub use handler::{EventHandler, HandlerError, HandlerResult};
pub use lifecycle::{CancelHandle, ReaderState};
pub use reader::{OpenOptions, ReadOutcome, SheetReader};
pub use value::{
    CellErrorCode, CellType, CellValue, DateSystem, RawValue, ValueError, EPOCH_OFFSET_DAYS,
};
