use formula_reader::ValueError;

use crate::meta::ValueKind;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A coerced value that does not fit the field it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot store a {from} value in a field of type `{target}`")]
pub struct ConversionError {
    pub from: &'static str,
    pub target: &'static str,
}

/// Invalid record metadata, reported when the record class is compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("record class `{class}` declares no field bindings")]
    NoBindings { class: String },
    #[error("field `{field}` is declared more than once")]
    DuplicateField { field: String },
    #[error("column {column} is claimed by fields {fields:?}; mark every claimant as shared to allow this")]
    DuplicateColumn { column: u32, fields: Vec<String> },
    #[error("field `{field}` binds column {column}, past the last worksheet column")]
    ColumnOutOfRange { field: String, column: u32 },
    #[error("field `{field}` binds column {column}, beyond the class end column {end_column}")]
    ColumnBeyondEnd {
        field: String,
        column: u32,
        end_column: u32,
    },
    #[error("{what} range is inverted: start {start} > end {end}")]
    InvertedRange {
        what: &'static str,
        start: u64,
        end: u64,
    },
    #[error("title row {title_row} lies past the end row {end_row}")]
    TitleRowOutOfRange { title_row: u32, end_row: u32 },
    #[error("field `{field}` of type `{target}` cannot hold {kind} values")]
    IncompatibleKind {
        field: String,
        kind: ValueKind,
        target: &'static str,
    },
}

/// Failure to build an instance of a record type.
#[derive(Debug, thiserror::Error)]
pub enum ConstructError {
    #[error("type `{type_name}` has no accessible no-argument constructor")]
    NoConstructor { type_name: &'static str },
    #[error("type `{type_name}` is abstract and cannot be instantiated")]
    Abstract { type_name: &'static str },
    #[error("constructor of `{type_name}` failed: {source}")]
    ConstructorFailed {
        type_name: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("factory for `{type_name}` produced a value of another type (expected `{expected}`)")]
    WrongType {
        type_name: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MappingErrorKind {
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Construct(#[from] ConstructError),
}

/// A row that could not be mapped. Aborts the whole extraction.
#[derive(Debug, thiserror::Error)]
#[error("sheet `{sheet}` row {row}{}{}: {kind}", display_column(.column), display_field(.field))]
pub struct MappingError {
    pub sheet: String,
    pub sheet_index: usize,
    pub row: u32,
    pub column: Option<u32>,
    pub field: Option<String>,
    #[source]
    pub kind: MappingErrorKind,
}

fn display_column(column: &Option<u32>) -> String {
    column.map(|c| format!(" column {c}")).unwrap_or_default()
}

fn display_field(field: &Option<String>) -> String {
    field
        .as_deref()
        .map(|f| format!(" (field `{f}`)"))
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    Read(#[from] formula_reader::Error),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Construct(#[from] ConstructError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

impl From<formula_reader::OpenError> for ExtractError {
    fn from(err: formula_reader::OpenError) -> Self {
        ExtractError::Read(err.into())
    }
}
