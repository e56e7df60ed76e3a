use crate::value::CellValue;

/// Error type a handler returns to abort a read.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type HandlerResult = Result<(), HandlerError>;

/// Callbacks invoked by [`SheetReader::read`](crate::SheetReader::read), in document order.
///
/// Every method defaults to a no-op. Returning an error from any data callback stops the
/// read immediately; the error is surfaced as [`Error::Handler`](crate::Error::Handler).
///
/// Sheet indices are zero-based positions in workbook order. Row and column indices are
/// zero-based absolute worksheet coordinates.
pub trait EventHandler {
    fn start_document(&mut self) -> HandlerResult {
        Ok(())
    }

    fn end_document(&mut self) -> HandlerResult {
        Ok(())
    }

    fn start_sheet(&mut self, _sheet: usize, _name: &str) -> HandlerResult {
        Ok(())
    }

    fn end_sheet(&mut self, _sheet: usize) -> HandlerResult {
        Ok(())
    }

    fn start_row(&mut self, _sheet: usize, _row: u32) -> HandlerResult {
        Ok(())
    }

    fn end_row(&mut self, _sheet: usize, _row: u32) -> HandlerResult {
        Ok(())
    }

    /// One populated cell. `value` is only valid for the duration of the call.
    fn cell(&mut self, _sheet: usize, _row: u32, _col: u32, _value: &CellValue<'_>) -> HandlerResult {
        Ok(())
    }

    /// Fired exactly once when a read stops at a cancellation checkpoint.
    fn cancelled(&mut self) {}
}

impl<H: EventHandler + ?Sized> EventHandler for &mut H {
    fn start_document(&mut self) -> HandlerResult {
        (**self).start_document()
    }

    fn end_document(&mut self) -> HandlerResult {
        (**self).end_document()
    }

    fn start_sheet(&mut self, sheet: usize, name: &str) -> HandlerResult {
        (**self).start_sheet(sheet, name)
    }

    fn end_sheet(&mut self, sheet: usize) -> HandlerResult {
        (**self).end_sheet(sheet)
    }

    fn start_row(&mut self, sheet: usize, row: u32) -> HandlerResult {
        (**self).start_row(sheet, row)
    }

    fn end_row(&mut self, sheet: usize, row: u32) -> HandlerResult {
        (**self).end_row(sheet, row)
    }

    fn cell(&mut self, sheet: usize, row: u32, col: u32, value: &CellValue<'_>) -> HandlerResult {
        (**self).cell(sheet, row, col, value)
    }

    fn cancelled(&mut self) {
        (**self).cancelled()
    }
}
