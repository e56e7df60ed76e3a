use std::borrow::Cow;

use chrono::{NaiveDate, TimeDelta};
use formula_reader::{
    CancelHandle, CellValue, DateSystem, Error, EventHandler, HandlerResult, RawValue,
    ReadOutcome, ReaderState, SheetReader, EPOCH_OFFSET_DAYS,
};
use pretty_assertions::assert_eq;

mod common;
use common::{build_people_xls, build_people_xlsx, build_xls, Event, Recorder, XlsCell};

fn text(s: &'static str) -> RawValue<'static> {
    RawValue::Text(Cow::Borrowed(s))
}

fn people_events() -> Vec<Event> {
    let mut events = vec![Event::StartDocument, Event::StartSheet(0, "People".into())];
    let rows: [(u32, [RawValue<'static>; 4]); 3] = [
        (0, [text("Name"), text("Age"), text("Joined"), text("Active")]),
        (
            1,
            [
                text("Ada"),
                RawValue::Float(36.0),
                RawValue::DateSerial(45292.0),
                RawValue::Bool(true),
            ],
        ),
        (
            3,
            [
                text("Grace"),
                RawValue::Float(85.0),
                RawValue::DateSerial(45293.5),
                RawValue::Bool(false),
            ],
        ),
    ];
    for (row, values) in rows {
        events.push(Event::StartRow(0, row));
        for (col, value) in values.into_iter().enumerate() {
            events.push(Event::Cell(0, row, col as u32, value));
        }
        events.push(Event::EndRow(0, row));
    }
    events.extend([
        Event::EndSheet(0),
        Event::StartSheet(1, "Totals".into()),
        Event::StartRow(1, 0),
        Event::Cell(1, 0, 0, text("Total")),
        Event::Cell(1, 0, 1, RawValue::Float(121.0)),
        Event::EndRow(1, 0),
        Event::EndSheet(1),
        Event::EndDocument,
    ]);
    events
}

fn read_all(bytes: Vec<u8>) -> (SheetReader, Recorder, ReadOutcome) {
    let mut reader = SheetReader::open(bytes).expect("open");
    let mut recorder = Recorder::default();
    let outcome = reader.read(&mut recorder).expect("read");
    (reader, recorder, outcome)
}

#[test]
fn xlsx_events_arrive_in_document_order() {
    let (reader, recorder, outcome) = read_all(build_people_xlsx());
    assert_eq!(outcome, ReadOutcome::Completed);
    assert_eq!(reader.state(), ReaderState::Closed);
    assert_eq!(recorder.events, people_events());
}

#[test]
fn xls_and_xlsx_produce_the_same_events() {
    let (_, recorder, outcome) = read_all(build_people_xls());
    assert_eq!(outcome, ReadOutcome::Completed);
    assert_eq!(recorder.events, people_events());
}

#[test]
fn legacy_cells_keep_absolute_coordinates() {
    let bytes = build_xls(&[(
        "Offset",
        &[
            (4, 2, XlsCell::Number(1.5)),
            (6, 3, XlsCell::Error(0x07)),
        ],
    )]);
    let (_, recorder, _) = read_all(bytes);
    let cells = recorder.cells();
    assert_eq!(cells.len(), 2);
    assert_eq!(cells[0], (0, 4, 2, RawValue::Float(1.5)));
    assert_eq!((cells[1].1, cells[1].2), (6, 3));
    assert_eq!(cells[1].3.cell_type().to_string(), "error");
}

#[test]
fn empty_sheet_still_gets_sheet_events() {
    let bytes = build_xls(&[("Empty", &[]), ("One", &[(0, 0, XlsCell::Bool(true))])]);
    let (_, recorder, _) = read_all(bytes);
    assert_eq!(
        recorder.events,
        vec![
            Event::StartDocument,
            Event::StartSheet(0, "Empty".into()),
            Event::EndSheet(0),
            Event::StartSheet(1, "One".into()),
            Event::StartRow(1, 0),
            Event::Cell(1, 0, 0, RawValue::Bool(true)),
            Event::EndRow(1, 0),
            Event::EndSheet(1),
            Event::EndDocument,
        ]
    );
}

#[test]
fn second_read_is_rejected() {
    let (mut reader, _, _) = read_all(build_people_xlsx());
    let err = reader.read(&mut Recorder::default()).unwrap_err();
    assert!(
        matches!(
            err,
            Error::Lifecycle {
                operation: "read",
                state: ReaderState::Closed
            }
        ),
        "{err:?}"
    );
}

#[derive(Debug, Clone, Copy)]
enum CancelPoint {
    RowStart(u32),
    /// After the handler has seen the cell at (row, col).
    Cell(u32, u32),
}

/// Requests cancellation from inside a callback.
struct CancelAt {
    handle: CancelHandle,
    point: CancelPoint,
    inner: Recorder,
}

impl CancelAt {
    fn new(reader: &SheetReader, point: CancelPoint) -> Self {
        Self {
            handle: reader.cancel_handle(),
            point,
            inner: Recorder::default(),
        }
    }
}

impl EventHandler for CancelAt {
    fn start_document(&mut self) -> HandlerResult {
        self.inner.start_document()
    }

    fn start_sheet(&mut self, sheet: usize, name: &str) -> HandlerResult {
        self.inner.start_sheet(sheet, name)
    }

    fn start_row(&mut self, sheet: usize, row: u32) -> HandlerResult {
        self.inner.start_row(sheet, row)?;
        if matches!(self.point, CancelPoint::RowStart(r) if r == row) {
            self.handle.cancel().map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn end_row(&mut self, sheet: usize, row: u32) -> HandlerResult {
        self.inner.end_row(sheet, row)
    }

    fn end_sheet(&mut self, sheet: usize) -> HandlerResult {
        self.inner.end_sheet(sheet)
    }

    fn end_document(&mut self) -> HandlerResult {
        self.inner.end_document()
    }

    fn cell(&mut self, sheet: usize, row: u32, col: u32, value: &CellValue<'_>) -> HandlerResult {
        self.inner.cell(sheet, row, col, value)?;
        if matches!(self.point, CancelPoint::Cell(r, c) if (r, c) == (row, col)) {
            self.handle.cancel().map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn cancelled(&mut self) {
        self.inner.cancelled()
    }
}

#[test]
fn cancel_from_a_handler_stops_at_the_next_checkpoint() {
    for bytes in [build_people_xlsx(), build_people_xls()] {
        let mut reader = SheetReader::open(bytes).expect("open");
        let mut handler = CancelAt::new(&reader, CancelPoint::RowStart(1));

        let outcome = reader.read(&mut handler).expect("read");
        assert_eq!(outcome, ReadOutcome::Cancelled);
        assert_eq!(reader.state(), ReaderState::Cancelled);
        assert_eq!(handler.handle.state(), ReaderState::Cancelled);

        let events = &handler.inner.events;
        assert_eq!(handler.inner.count(&Event::Cancelled), 1);
        assert_eq!(
            &events[events.len() - 2..],
            &[Event::StartRow(0, 1), Event::Cancelled]
        );
        assert!(!events.contains(&Event::EndDocument));
        assert!(!events.contains(&Event::EndRow(0, 1)));

        // Once cancelled, the reader cannot be read again, but can still be closed.
        assert!(reader.read(&mut Recorder::default()).is_err());
        reader.close();
        assert_eq!(reader.state(), ReaderState::Closed);
    }
}

#[test]
fn cancel_mid_row_drops_the_rest_of_the_row() {
    for bytes in [build_people_xlsx(), build_people_xls()] {
        let mut reader = SheetReader::open(bytes).expect("open");
        let kind = reader.backend_kind();
        let mut handler = CancelAt::new(&reader, CancelPoint::Cell(1, 1));

        let outcome = reader.read(&mut handler).expect("read");
        assert_eq!(outcome, ReadOutcome::Cancelled, "{kind:?}");
        assert_eq!(reader.state(), ReaderState::Cancelled);

        let events = &handler.inner.events;
        assert_eq!(handler.inner.count(&Event::Cancelled), 1, "{kind:?}");
        assert_eq!(
            &events[events.len() - 3..],
            &[
                Event::Cell(0, 1, 0, text("Ada")),
                Event::Cell(0, 1, 1, RawValue::Float(36.0)),
                Event::Cancelled,
            ],
            "{kind:?}"
        );
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, Event::Cell(0, 1, col, _) if *col >= 2)),
            "{kind:?}: cell after the cancel point was dispatched"
        );
        assert!(!events.contains(&Event::EndRow(0, 1)));
        assert!(!events.contains(&Event::EndSheet(0)));
        assert!(!events.contains(&Event::EndDocument));
    }
}

#[test]
fn cancel_outside_a_read_is_rejected() {
    let reader = SheetReader::open(build_people_xlsx()).expect("open");
    let err = reader.cancel().unwrap_err();
    assert!(
        matches!(
            err,
            Error::Lifecycle {
                state: ReaderState::Open,
                ..
            }
        ),
        "{err:?}"
    );
}

#[test]
fn close_is_idempotent_and_final() {
    let mut reader = SheetReader::open(build_people_xls()).expect("open");
    let handle = reader.cancel_handle();
    reader.close();
    reader.close();
    assert_eq!(reader.state(), ReaderState::Closed);
    assert_eq!(handle.state(), ReaderState::Closed);

    assert!(reader.read(&mut Recorder::default()).is_err());
    assert!(reader.set_date_system(DateSystem::Excel1904).is_err());
}

#[test]
fn dropping_the_reader_closes_it() {
    let reader = SheetReader::open(build_people_xlsx()).expect("open");
    let handle = reader.cancel_handle();
    drop(reader);
    assert_eq!(handle.state(), ReaderState::Closed);
}

#[derive(Default)]
struct JoinedDates(Vec<chrono::NaiveDateTime>);

impl EventHandler for JoinedDates {
    fn cell(&mut self, sheet: usize, row: u32, col: u32, value: &CellValue<'_>) -> HandlerResult {
        if sheet == 0 && row > 0 && col == 2 {
            self.0.push(value.as_datetime()?);
        }
        Ok(())
    }
}

#[test]
fn date_system_shifts_serials_by_the_epoch_offset() {
    for bytes in [build_people_xlsx(), build_people_xls()] {
        let mut reader = SheetReader::open(bytes.clone()).expect("open");
        assert_eq!(reader.date_system(), DateSystem::Excel1900);
        let mut dates_1900 = JoinedDates::default();
        reader.read(&mut dates_1900).expect("read 1900");

        let mut reader = SheetReader::open(bytes).expect("open");
        reader.set_1904_windowing(true).expect("set before read");
        let mut dates_1904 = JoinedDates::default();
        reader.read(&mut dates_1904).expect("read 1904");

        let ada = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let grace = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(dates_1900.0, vec![ada, grace]);

        let shift = TimeDelta::try_days(EPOCH_OFFSET_DAYS).unwrap();
        assert_eq!(dates_1904.0, vec![ada + shift, grace + shift]);

        let err = reader.set_date_system(DateSystem::Excel1900).unwrap_err();
        assert!(matches!(err, Error::Lifecycle { .. }), "{err:?}");
    }
}

struct FailOnCell;

#[derive(Debug)]
struct Boom;

impl std::fmt::Display for Boom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("boom")
    }
}

impl std::error::Error for Boom {}

impl EventHandler for FailOnCell {
    fn cell(&mut self, _: usize, _: u32, _: u32, _: &CellValue<'_>) -> HandlerResult {
        Err(Box::new(Boom))
    }
}

#[test]
fn handler_error_aborts_and_closes() {
    let mut reader = SheetReader::open(build_people_xlsx()).expect("open");
    let err = reader.read(&mut FailOnCell).unwrap_err();
    assert_eq!(err.to_string(), "event handler aborted the read: boom");
    let inner = err.into_handler_error().expect("handler error");
    assert!(inner.downcast_ref::<Boom>().is_some());
    assert_eq!(reader.state(), ReaderState::Closed);
}
