//! Declarative mapping of worksheet rows onto typed records.
//!
//! A [`RecordClass`] describes which fields bind to which columns (or to the sheet and
//! row a record came from). It is validated once into [`CompiledBindings`], and a
//! [`RowMapper`] replays that table for every row a
//! [`SheetReader`](formula_reader::SheetReader) dispatches.
//!
//! ```no_run
//! use formula_rowbind::{ContextKind, Extractor, Record, RecordClass, ValueKind};
//!
//! #[derive(Debug, Default)]
//! struct Person {
//!     name: String,
//!     age: i64,
//!     row: u32,
//! }
//!
//! impl Record for Person {
//!     fn record_class() -> RecordClass {
//!         RecordClass::builder::<Person>("Person")
//!             .title_row(0)
//!             .default_constructor()
//!             .column("name", 0, ValueKind::Text, |p| &mut p.name)
//!             .column("age", 1, ValueKind::WholeNumber, |p| &mut p.age)
//!             .context("row", ContextKind::RowNumber, |p| &mut p.row)
//!             .build()
//!     }
//! }
//!
//! let people = Extractor::new().extract::<Person>("people.xlsx")?;
//! for (sheet, person) in people.iter() {
//!     println!("{sheet}: {person:?}");
//! }
//! # Ok::<(), formula_rowbind::ExtractError>(())
//! ```

mod compile;
mod error;
mod extract;
mod factory;
mod mapper;
mod meta;

pub use compile::{compile, compile_record, CompiledBindings, ResolvedRange, MAX_COLUMNS};
pub use error::{
    BindingError, BoxError, ConstructError, ConversionError, ExtractError, MappingError,
    MappingErrorKind,
};
pub use extract::Extractor;
pub use factory::{factory_for, ObjectFactory, Strategy};
pub use mapper::{Extraction, RowMapper, SheetExtraction};
pub use meta::{
    ContextKind, FieldValue, FromFieldValue, RangeSpec, Record, RecordClass, RecordClassBuilder,
    ValueKind,
};
