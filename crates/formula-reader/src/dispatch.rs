//! Turns backend cells into handler events.
//!
//! Event order per read:
//! `start_document (start_sheet (start_row cell+ end_row)* end_sheet)* end_document`.
//! Rows without populated cells produce no events. A cancellation checkpoint runs before
//! every `start_sheet`, `start_row`, `cell`, `end_row`, `end_sheet` and `end_document`;
//! once one observes a cancel request, `cancelled` fires and nothing else is emitted.

use calamine::{Reader, XlsxError};
use log::{debug, warn};

use crate::error::{BackendError, Error};
use crate::handler::EventHandler;
use crate::lifecycle::Lifecycle;
use crate::reader::{Backend, ReadOutcome};
use crate::value::{CellValue, DateSystem, RawValue};

enum Flow {
    Continue,
    Cancelled,
}

struct Dispatcher<'h, 'l, H: ?Sized> {
    handler: &'h mut H,
    lifecycle: &'l Lifecycle,
    date_system: DateSystem,
}

impl<H: EventHandler + ?Sized> Dispatcher<'_, '_, H> {
    fn checkpoint(&mut self) -> bool {
        if self.lifecycle.cancel_requested() {
            self.handler.cancelled();
            return true;
        }
        false
    }

    fn sheet<'c, I>(&mut self, sheet: usize, name: &str, cells: I) -> Result<Flow, Error>
    where
        I: Iterator<Item = Result<(u32, u32, RawValue<'c>), BackendError>>,
    {
        let mut open_row: Option<u32> = None;

        for cell in cells {
            let (row, col, raw) = cell.map_err(|source| Error::Backend {
                sheet: name.to_owned(),
                source,
            })?;
            if matches!(raw, RawValue::Blank) {
                continue;
            }

            if open_row != Some(row) {
                if self.checkpoint() {
                    return Ok(Flow::Cancelled);
                }
                if let Some(previous) = open_row.take() {
                    self.handler
                        .end_row(sheet, previous)
                        .map_err(Error::Handler)?;
                    if self.checkpoint() {
                        return Ok(Flow::Cancelled);
                    }
                }
                self.handler.start_row(sheet, row).map_err(Error::Handler)?;
                open_row = Some(row);
            }

            if self.checkpoint() {
                return Ok(Flow::Cancelled);
            }
            let value = CellValue::new(raw, self.date_system);
            self.handler
                .cell(sheet, row, col, &value)
                .map_err(Error::Handler)?;
        }

        if let Some(last) = open_row {
            if self.checkpoint() {
                return Ok(Flow::Cancelled);
            }
            self.handler.end_row(sheet, last).map_err(Error::Handler)?;
        }
        Ok(Flow::Continue)
    }
}

pub(crate) fn dispatch<H>(
    backend: &mut Backend,
    sheet_names: &[String],
    date_system: DateSystem,
    lifecycle: &Lifecycle,
    handler: &mut H,
) -> Result<ReadOutcome, Error>
where
    H: EventHandler + ?Sized,
{
    let mut dispatcher = Dispatcher {
        handler,
        lifecycle,
        date_system,
    };

    if dispatcher.checkpoint() {
        return Ok(ReadOutcome::Cancelled);
    }
    dispatcher.handler.start_document().map_err(Error::Handler)?;

    for (index, name) in sheet_names.iter().enumerate() {
        if dispatcher.checkpoint() {
            return Ok(ReadOutcome::Cancelled);
        }
        dispatcher
            .handler
            .start_sheet(index, name)
            .map_err(Error::Handler)?;

        let flow = match backend {
            Backend::ModernXml(xlsx) => match xlsx.worksheet_cells_reader(name) {
                Ok(mut cells) => {
                    let iter = std::iter::from_fn(|| match cells.next_cell() {
                        Ok(Some(cell)) => {
                            let (row, col) = cell.get_position();
                            Some(Ok((row, col, RawValue::from(cell.get_value().clone()))))
                        }
                        Ok(None) => None,
                        Err(err) => Some(Err(BackendError::from(err))),
                    });
                    dispatcher.sheet(index, name, iter)?
                }
                Err(XlsxError::NotAWorksheet(_)) => {
                    warn!("sheet `{name}` is not a worksheet; it has no cells to read");
                    Flow::Continue
                }
                Err(err) => {
                    return Err(Error::Backend {
                        sheet: name.clone(),
                        source: err.into(),
                    })
                }
            },
            Backend::LegacyBinary(xls) => {
                let range = xls.worksheet_range(name).map_err(|err| Error::Backend {
                    sheet: name.clone(),
                    source: err.into(),
                })?;
                let (row0, col0) = range.start().unwrap_or((0, 0));
                let iter = range.used_cells().map(|(row, col, value)| {
                    Ok::<_, BackendError>((
                        row0 + row as u32,
                        col0 + col as u32,
                        RawValue::from(value),
                    ))
                });
                dispatcher.sheet(index, name, iter)?
            }
        };

        if let Flow::Cancelled = flow {
            debug!("read cancelled in sheet `{name}`");
            return Ok(ReadOutcome::Cancelled);
        }
        if dispatcher.checkpoint() {
            return Ok(ReadOutcome::Cancelled);
        }
        dispatcher.handler.end_sheet(index).map_err(Error::Handler)?;
    }

    if dispatcher.checkpoint() {
        return Ok(ReadOutcome::Cancelled);
    }
    dispatcher.handler.end_document().map_err(Error::Handler)?;
    Ok(ReadOutcome::Completed)
}
