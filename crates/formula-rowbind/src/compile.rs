//! Validates a [`RecordClass`] into a column-indexed binding table.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use log::debug;

use crate::error::BindingError;
use crate::meta::{Binding, ContextKind, FieldSpec, Record, RecordClass, ValueKind};

/// Worksheet column limit (`XFD`).
pub const MAX_COLUMNS: u32 = 16_384;

/// Validated class-level range with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start_sheet: usize,
    pub end_sheet: Option<usize>,
    pub start_row: u32,
    pub end_row: Option<u32>,
    pub end_column: Option<u32>,
    pub title_row: Option<u32>,
}

impl ResolvedRange {
    pub fn contains_sheet(&self, sheet: usize) -> bool {
        sheet >= self.start_sheet && self.end_sheet.map_or(true, |end| sheet <= end)
    }

    pub fn contains_row(&self, row: u32) -> bool {
        row >= self.start_row
            && self.end_row.map_or(true, |end| row <= end)
            && self.title_row != Some(row)
    }

    pub fn contains_column(&self, column: u32) -> bool {
        self.end_column.map_or(true, |end| column <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColumnSlot {
    pub(crate) field: usize,
    pub(crate) kind: ValueKind,
}

/// Binding table for one record class, built once and replayed per row.
#[derive(Debug)]
pub struct CompiledBindings {
    pub(crate) class: Arc<RecordClass>,
    range: ResolvedRange,
    /// Indexed by column; most columns have zero or one slot.
    columns: Vec<Vec<ColumnSlot>>,
    context: Vec<(usize, ContextKind)>,
}

impl CompiledBindings {
    pub fn class(&self) -> &RecordClass {
        &self.class
    }

    pub fn range(&self) -> &ResolvedRange {
        &self.range
    }

    pub(crate) fn field(&self, index: usize) -> &FieldSpec {
        &self.class.fields[index]
    }

    pub(crate) fn slots(&self, column: u32) -> &[ColumnSlot] {
        self.columns
            .get(column as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn context_fields(&self) -> &[(usize, ContextKind)] {
        &self.context
    }

    /// Bound columns in ascending order.
    pub fn bound_columns(&self) -> impl Iterator<Item = u32> + '_ {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, slots)| !slots.is_empty())
            .map(|(column, _)| column as u32)
    }
}

/// Validate `class` and build its binding table.
pub fn compile(class: RecordClass) -> Result<Arc<CompiledBindings>, BindingError> {
    let range = resolve_range(&class)?;

    if class.fields.is_empty() {
        return Err(BindingError::NoBindings {
            class: class.name.clone(),
        });
    }

    let mut names = HashSet::new();
    let mut claims: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    let mut context = Vec::new();

    for (index, field) in class.fields.iter().enumerate() {
        if !names.insert(field.name.as_str()) {
            return Err(BindingError::DuplicateField {
                field: field.name.clone(),
            });
        }

        let kind = match field.binding {
            Binding::Column { index: column, kind, .. } => {
                if column >= MAX_COLUMNS {
                    return Err(BindingError::ColumnOutOfRange {
                        field: field.name.clone(),
                        column,
                    });
                }
                if let Some(end_column) = range.end_column {
                    if column > end_column {
                        return Err(BindingError::ColumnBeyondEnd {
                            field: field.name.clone(),
                            column,
                            end_column,
                        });
                    }
                }
                claims.entry(column).or_default().push(index);
                kind
            }
            Binding::Context(kind) => {
                context.push((index, kind));
                kind.value_kind()
            }
        };

        if !(field.accepts)(kind) {
            return Err(BindingError::IncompatibleKind {
                field: field.name.clone(),
                kind,
                target: field.target,
            });
        }
    }

    let width = claims.keys().next_back().map_or(0, |last| *last as usize + 1);
    let mut columns = vec![Vec::new(); width];
    for (column, claimants) in claims {
        let all_shared = claimants.iter().all(|&i| {
            matches!(class.fields[i].binding, Binding::Column { shared: true, .. })
        });
        if claimants.len() > 1 && !all_shared {
            return Err(BindingError::DuplicateColumn {
                column,
                fields: claimants
                    .iter()
                    .map(|&i| class.fields[i].name.clone())
                    .collect(),
            });
        }
        columns[column as usize] = claimants
            .into_iter()
            .filter_map(|field| match class.fields[field].binding {
                Binding::Column { kind, .. } => Some(ColumnSlot { field, kind }),
                Binding::Context(_) => None,
            })
            .collect();
    }

    debug!(
        "compiled record class `{}`: {} field(s), {} context field(s)",
        class.name,
        class.fields.len(),
        context.len()
    );

    Ok(Arc::new(CompiledBindings {
        class: Arc::new(class),
        range,
        columns,
        context,
    }))
}

fn resolve_range(class: &RecordClass) -> Result<ResolvedRange, BindingError> {
    let declared = class.range;

    if let (Some(start), Some(end)) = (declared.start_sheet, declared.end_sheet) {
        if start > end {
            return Err(BindingError::InvertedRange {
                what: "sheet",
                start: start as u64,
                end: end as u64,
            });
        }
    }
    if let (Some(start), Some(end)) = (declared.start_row, declared.end_row) {
        if start > end {
            return Err(BindingError::InvertedRange {
                what: "row",
                start: u64::from(start),
                end: u64::from(end),
            });
        }
    }
    if let (Some(title_row), Some(end_row)) = (declared.title_row, declared.end_row) {
        if title_row > end_row {
            return Err(BindingError::TitleRowOutOfRange { title_row, end_row });
        }
    }
    if let Some(end_column) = declared.end_column {
        if end_column >= MAX_COLUMNS {
            return Err(BindingError::ColumnOutOfRange {
                field: String::from("<end column>"),
                column: end_column,
            });
        }
    }

    let start_row = match (declared.start_row, declared.title_row) {
        (Some(start), _) => start,
        (None, Some(title)) => title.saturating_add(1),
        (None, None) => 0,
    };

    Ok(ResolvedRange {
        start_sheet: declared.start_sheet.unwrap_or(0),
        end_sheet: declared.end_sheet,
        start_row,
        end_row: declared.end_row,
        end_column: declared.end_column,
        title_row: declared.title_row,
    })
}

type Compiled = Result<Arc<CompiledBindings>, BindingError>;

fn compiled_cache() -> &'static Mutex<HashMap<TypeId, Compiled>> {
    static CACHE: OnceLock<Mutex<HashMap<TypeId, Compiled>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Compile `T`'s own metadata, once per process.
///
/// Invalid metadata is cached too: `record_class` runs once and every later call returns a
/// clone of the same error.
pub fn compile_record<T: Record>() -> Result<Arc<CompiledBindings>, BindingError> {
    let key = TypeId::of::<T>();
    if let Some(hit) = lock(compiled_cache()).get(&key) {
        return hit.clone();
    }

    let compiled = compile(T::record_class());
    let mut cache = lock(compiled_cache());
    cache.entry(key).or_insert(compiled).clone()
}

/// A poisoned cache still holds fully-built entries.
pub(crate) fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
