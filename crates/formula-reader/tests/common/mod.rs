#![allow(dead_code)]

//! Workbook fixtures built in memory, plus a handler that records every event.

use std::io::{Cursor, Write};

use formula_offcrypto::cryptoapi::{rc4_key_for_block, Rc4Cipher};
use formula_offcrypto::{iterated_hash, HashAlgorithm};
use formula_reader::{CellValue, EventHandler, HandlerResult, RawValue};
use ms_offcrypto_writer::Ecma376AgileWriter;
use rand::{rngs::StdRng, SeedableRng as _};

// Just enough BIFF8 for calamine to read sheets of numbers, dates, shared strings and
// booleans/errors.

const RECORD_BOF: u16 = 0x0809;
const RECORD_EOF: u16 = 0x000A;
const RECORD_CODEPAGE: u16 = 0x0042;
const RECORD_DATEMODE: u16 = 0x0022;
const RECORD_WINDOW1: u16 = 0x003D;
const RECORD_FILEPASS: u16 = 0x002F;
const RECORD_FONT: u16 = 0x0031;
const RECORD_XF: u16 = 0x00E0;
const RECORD_BOUNDSHEET: u16 = 0x0085;
const RECORD_SST: u16 = 0x00FC;
const RECORD_WINDOW2: u16 = 0x023E;
const RECORD_DIMENSIONS: u16 = 0x0200;
const RECORD_NUMBER: u16 = 0x0203;
const RECORD_LABELSST: u16 = 0x00FD;
const RECORD_BOOLERR: u16 = 0x0205;

const BOF_VERSION_BIFF8: u16 = 0x0600;
const BOF_DT_WORKBOOK_GLOBALS: u16 = 0x0005;
const BOF_DT_WORKSHEET: u16 = 0x0010;

const XF_FLAG_LOCKED: u16 = 0x0001;
const XF_FLAG_STYLE: u16 = 0x0004;
const COLOR_AUTOMATIC: u16 = 0x7FFF;

/// Built-in number format 14 (`m/d/yyyy`).
const FMT_SHORT_DATE: u16 = 14;
const XF_GENERAL_CELL: u16 = 16;
const XF_DATE_CELL: u16 = 17;

pub const PASSWORD: &str = "correct horse battery staple";

#[derive(Debug, Clone, Copy)]
pub enum XlsCell<'a> {
    Number(f64),
    /// Date serial written with a date number format.
    Date(f64),
    Text(&'a str),
    Bool(bool),
    /// BIFF error code, e.g. `0x07` for `#DIV/0!`.
    Error(u8),
}

pub type XlsSheet<'a> = (&'a str, &'a [(u16, u16, XlsCell<'a>)]);

/// Build a BIFF8 `.xls` with one worksheet per entry of `sheets`.
pub fn build_xls(sheets: &[XlsSheet<'_>]) -> Vec<u8> {
    wrap_workbook_stream(&build_workbook_stream(sheets, None))
}

const CALG_RC4: u32 = 0x6801;
const CALG_SHA1: u32 = 0x8004;
const RC4_KEY_BITS: u32 = 128;
const RC4_REKEY_INTERVAL: usize = 1024;
const FILEPASS_SALT: [u8; 16] = [0x5A; 16];

/// Build a BIFF8 `.xls` whose workbook stream is RC4 CryptoAPI encrypted under `password`.
pub fn build_encrypted_xls(sheets: &[XlsSheet<'_>], password: &str) -> Vec<u8> {
    let password_utf16le: Vec<u8> = password
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    let h = iterated_hash(&password_utf16le, &FILEPASS_SALT, HashAlgorithm::Sha1, 0);
    let block_keystream = |block: usize| -> Vec<u8> {
        let key = rc4_key_for_block(&h, block as u32, RC4_KEY_BITS, HashAlgorithm::Sha1)
            .expect("block key");
        let mut keystream = vec![0u8; RC4_REKEY_INTERVAL];
        Rc4Cipher::new(&key).expect("rc4").apply_keystream(&mut keystream);
        keystream
    };

    // The verifier and its hash are sealed with one continuous block-0 keystream.
    let verifier = [0x11u8; 16];
    let mut sealed = verifier.to_vec();
    sealed.extend_from_slice(&HashAlgorithm::Sha1.digest(&verifier));
    for (byte, k) in sealed.iter_mut().zip(block_keystream(0)) {
        *byte ^= k;
    }

    let mut header = Vec::new();
    for field in [0x04u32, 0, CALG_RC4, CALG_SHA1, RC4_KEY_BITS, 1, 0, 0] {
        header.extend_from_slice(&field.to_le_bytes());
    }
    let mut filepass = Vec::new();
    filepass.extend_from_slice(&1u16.to_le_bytes()); // wEncryptionType: RC4
    filepass.extend_from_slice(&4u16.to_le_bytes());
    filepass.extend_from_slice(&2u16.to_le_bytes());
    filepass.extend_from_slice(&0x04u32.to_le_bytes()); // fCryptoAPI
    filepass.extend_from_slice(&(header.len() as u32).to_le_bytes());
    filepass.extend_from_slice(&header);
    filepass.extend_from_slice(&16u32.to_le_bytes());
    filepass.extend_from_slice(&FILEPASS_SALT);
    filepass.extend_from_slice(&sealed[..16]);
    filepass.extend_from_slice(&20u32.to_le_bytes());
    filepass.extend_from_slice(&sealed[16..]);

    let mut stream = build_workbook_stream(sheets, Some(&filepass));

    // Every payload after FILEPASS is encrypted except BOF records and BoundSheet8.lbPlyPos.
    let mut encrypted = Vec::new();
    let mut offset = 0usize;
    let mut after_filepass = false;
    while offset + 4 <= stream.len() {
        let id = u16::from_le_bytes([stream[offset], stream[offset + 1]]);
        let len = u16::from_le_bytes([stream[offset + 2], stream[offset + 3]]) as usize;
        let mut start = offset + 4;
        let end = start + len;
        if after_filepass && id != RECORD_BOF {
            if id == RECORD_BOUNDSHEET {
                start += 4;
            }
            encrypted.push(start..end);
        }
        after_filepass |= id == RECORD_FILEPASS;
        offset = end;
    }
    let mut keystreams = std::collections::HashMap::new();
    for range in encrypted {
        for pos in range {
            let block = pos / RC4_REKEY_INTERVAL;
            let keystream = keystreams
                .entry(block)
                .or_insert_with(|| block_keystream(block));
            stream[pos] ^= keystream[pos % RC4_REKEY_INTERVAL];
        }
    }
    wrap_workbook_stream(&stream)
}

/// Build a BIFF8 `.xls` whose globals carry a `FILEPASS` record.
pub fn build_filepass_xls() -> Vec<u8> {
    let mut globals = Vec::<u8>::new();
    push_record(&mut globals, RECORD_BOF, &bof(BOF_DT_WORKBOOK_GLOBALS));
    // The payload depends on the encryption scheme; any bytes do for detection.
    push_record(&mut globals, RECORD_FILEPASS, &[0x01, 0x00, 0x01, 0x00]);
    push_record(&mut globals, RECORD_EOF, &[]);
    wrap_workbook_stream(&globals)
}

/// An OLE compound file with no workbook stream at all.
pub fn build_ole_without_workbook() -> Vec<u8> {
    let cursor = Cursor::new(Vec::new());
    let mut ole = cfb::CompoundFile::create(cursor).expect("create cfb");
    {
        let mut stream = ole.create_stream("Contents").expect("Contents stream");
        stream.write_all(b"not a workbook").expect("write stream");
    }
    ole.into_inner().into_inner()
}

fn wrap_workbook_stream(workbook_stream: &[u8]) -> Vec<u8> {
    let cursor = Cursor::new(Vec::new());
    let mut ole = cfb::CompoundFile::create(cursor).expect("create cfb");
    {
        let mut stream = ole.create_stream("Workbook").expect("Workbook stream");
        stream
            .write_all(workbook_stream)
            .expect("write Workbook stream");
    }
    ole.into_inner().into_inner()
}

fn build_workbook_stream(sheets: &[XlsSheet<'_>], filepass: Option<&[u8]>) -> Vec<u8> {
    let mut strings: Vec<&str> = Vec::new();
    for (_, cells) in sheets {
        for (_, _, cell) in cells.iter() {
            if let XlsCell::Text(text) = cell {
                if !strings.contains(text) {
                    strings.push(*text);
                }
            }
        }
    }

    let mut globals = Vec::<u8>::new();
    push_record(&mut globals, RECORD_BOF, &bof(BOF_DT_WORKBOOK_GLOBALS));
    if let Some(filepass) = filepass {
        push_record(&mut globals, RECORD_FILEPASS, filepass);
    }
    push_record(&mut globals, RECORD_CODEPAGE, &1252u16.to_le_bytes());
    push_record(&mut globals, RECORD_DATEMODE, &0u16.to_le_bytes());
    push_record(&mut globals, RECORD_WINDOW1, &window1());
    push_record(&mut globals, RECORD_FONT, &font("Arial"));

    // Readers expect 16 style XFs before cell XFs.
    for _ in 0..16 {
        push_record(&mut globals, RECORD_XF, &xf_record(0, 0, true));
    }
    push_record(&mut globals, RECORD_XF, &xf_record(0, 0, false));
    push_record(&mut globals, RECORD_XF, &xf_record(0, FMT_SHORT_DATE, false));

    let mut offset_positions = Vec::with_capacity(sheets.len());
    for (name, _) in sheets {
        let mut boundsheet = Vec::<u8>::new();
        boundsheet.extend_from_slice(&0u32.to_le_bytes()); // lbPlyPos, patched below
        boundsheet.extend_from_slice(&0u16.to_le_bytes()); // visible worksheet
        write_short_unicode_string(&mut boundsheet, name);
        offset_positions.push(globals.len() + 4);
        push_record(&mut globals, RECORD_BOUNDSHEET, &boundsheet);
    }

    push_record(&mut globals, RECORD_SST, &sst(&strings));
    push_record(&mut globals, RECORD_EOF, &[]);

    for ((_, cells), offset_pos) in sheets.iter().zip(offset_positions) {
        let sheet_offset = globals.len() as u32;
        globals[offset_pos..offset_pos + 4].copy_from_slice(&sheet_offset.to_le_bytes());
        let sheet = build_sheet_stream(cells, &strings);
        globals.extend_from_slice(&sheet);
    }
    globals
}

fn build_sheet_stream(cells: &[(u16, u16, XlsCell<'_>)], strings: &[&str]) -> Vec<u8> {
    let mut sheet = Vec::<u8>::new();
    push_record(&mut sheet, RECORD_BOF, &bof(BOF_DT_WORKSHEET));
    push_record(&mut sheet, RECORD_DIMENSIONS, &dimensions(cells));
    push_record(&mut sheet, RECORD_WINDOW2, &window2());

    for &(row, col, cell) in cells {
        match cell {
            XlsCell::Number(v) => {
                push_record(&mut sheet, RECORD_NUMBER, &number_cell(row, col, XF_GENERAL_CELL, v))
            }
            XlsCell::Date(v) => {
                push_record(&mut sheet, RECORD_NUMBER, &number_cell(row, col, XF_DATE_CELL, v))
            }
            XlsCell::Text(text) => {
                let isst = strings
                    .iter()
                    .position(|s| *s == text)
                    .expect("string interned") as u32;
                push_record(&mut sheet, RECORD_LABELSST, &labelsst_cell(row, col, isst));
            }
            XlsCell::Bool(v) => {
                push_record(&mut sheet, RECORD_BOOLERR, &boolerr_cell(row, col, u8::from(v), false))
            }
            XlsCell::Error(code) => {
                push_record(&mut sheet, RECORD_BOOLERR, &boolerr_cell(row, col, code, true))
            }
        }
    }

    push_record(&mut sheet, RECORD_EOF, &[]);
    sheet
}

fn push_record(out: &mut Vec<u8>, id: u16, data: &[u8]) {
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
}

fn bof(dt: u16) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..2].copy_from_slice(&BOF_VERSION_BIFF8.to_le_bytes());
    out[2..4].copy_from_slice(&dt.to_le_bytes());
    out[4..6].copy_from_slice(&0x0DBBu16.to_le_bytes()); // build
    out[6..8].copy_from_slice(&0x07CCu16.to_le_bytes()); // year (1996)
    out
}

fn window1() -> [u8; 18] {
    let mut out = [0u8; 18];
    out[14..16].copy_from_slice(&1u16.to_le_bytes()); // cTabSel
    out[16..18].copy_from_slice(&600u16.to_le_bytes()); // wTabRatio
    out
}

fn window2() -> [u8; 18] {
    let mut out = [0u8; 18];
    out[0..2].copy_from_slice(&0x02B6u16.to_le_bytes());
    out
}

fn font(name: &str) -> Vec<u8> {
    let mut out = Vec::<u8>::new();
    out.extend_from_slice(&200u16.to_le_bytes()); // height: 10pt
    out.extend_from_slice(&0u16.to_le_bytes()); // option flags
    out.extend_from_slice(&COLOR_AUTOMATIC.to_le_bytes());
    out.extend_from_slice(&400u16.to_le_bytes()); // weight
    out.extend_from_slice(&0u16.to_le_bytes()); // escapement
    out.extend_from_slice(&[0, 0, 0, 0]); // underline, family, charset, reserved
    write_short_unicode_string(&mut out, name);
    out
}

fn xf_record(font_idx: u16, fmt_idx: u16, is_style_xf: bool) -> [u8; 20] {
    let mut out = [0u8; 20];
    out[0..2].copy_from_slice(&font_idx.to_le_bytes());
    out[2..4].copy_from_slice(&fmt_idx.to_le_bytes());
    let flags: u16 = XF_FLAG_LOCKED | if is_style_xf { XF_FLAG_STYLE } else { 0 };
    out[4..6].copy_from_slice(&flags.to_le_bytes());
    out[6] = 0x20; // General + Bottom
    out[9] = 0x3F; // apply all attributes
    out
}

fn sst(strings: &[&str]) -> Vec<u8> {
    let mut out = Vec::<u8>::new();
    let count = strings.len() as u32;
    out.extend_from_slice(&count.to_le_bytes()); // cstTotal
    out.extend_from_slice(&count.to_le_bytes()); // cstUnique
    for s in strings {
        write_unicode_string(&mut out, s);
    }
    out
}

fn dimensions(cells: &[(u16, u16, XlsCell<'_>)]) -> [u8; 14] {
    let mut out = [0u8; 14];
    if cells.is_empty() {
        return out;
    }
    let first_row = cells.iter().map(|c| c.0).min().unwrap_or(0) as u32;
    let last_row = cells.iter().map(|c| c.0).max().unwrap_or(0) as u32;
    let first_col = cells.iter().map(|c| c.1).min().unwrap_or(0);
    let last_col = cells.iter().map(|c| c.1).max().unwrap_or(0);
    out[0..4].copy_from_slice(&first_row.to_le_bytes());
    out[4..8].copy_from_slice(&(last_row + 1).to_le_bytes());
    out[8..10].copy_from_slice(&first_col.to_le_bytes());
    out[10..12].copy_from_slice(&(last_col + 1).to_le_bytes());
    out
}

fn number_cell(row: u16, col: u16, xf: u16, v: f64) -> [u8; 14] {
    let mut out = [0u8; 14];
    out[0..2].copy_from_slice(&row.to_le_bytes());
    out[2..4].copy_from_slice(&col.to_le_bytes());
    out[4..6].copy_from_slice(&xf.to_le_bytes());
    out[6..14].copy_from_slice(&v.to_le_bytes());
    out
}

fn labelsst_cell(row: u16, col: u16, isst: u32) -> [u8; 10] {
    let mut out = [0u8; 10];
    out[0..2].copy_from_slice(&row.to_le_bytes());
    out[2..4].copy_from_slice(&col.to_le_bytes());
    out[4..6].copy_from_slice(&XF_GENERAL_CELL.to_le_bytes());
    out[6..10].copy_from_slice(&isst.to_le_bytes());
    out
}

fn boolerr_cell(row: u16, col: u16, value: u8, is_error: bool) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&row.to_le_bytes());
    out[2..4].copy_from_slice(&col.to_le_bytes());
    out[4..6].copy_from_slice(&XF_GENERAL_CELL.to_le_bytes());
    out[6] = value;
    out[7] = u8::from(is_error);
    out
}

fn write_short_unicode_string(out: &mut Vec<u8>, s: &str) {
    // ShortXLUnicodeString: [cch: u8][flags: u8][chars]
    let bytes = s.as_bytes();
    let len: u8 = bytes.len().try_into().expect("string too long for u8 length");
    out.push(len);
    out.push(0); // compressed (8-bit)
    out.extend_from_slice(bytes);
}

fn write_unicode_string(out: &mut Vec<u8>, s: &str) {
    // XLUnicodeString: [cch: u16][flags: u8][chars]
    let bytes = s.as_bytes();
    let len: u16 = bytes.len().try_into().expect("string too long for u16 length");
    out.extend_from_slice(&len.to_le_bytes());
    out.push(0); // compressed (8-bit)
    out.extend_from_slice(bytes);
}

/// Two worksheets: a header plus two data rows, and a short second sheet.
pub fn build_people_xlsx() -> Vec<u8> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let date = rust_xlsxwriter::Format::new().set_num_format("yyyy-mm-dd");

    let people = workbook.add_worksheet();
    people.set_name("People").unwrap();
    people.write_string(0, 0, "Name").unwrap();
    people.write_string(0, 1, "Age").unwrap();
    people.write_string(0, 2, "Joined").unwrap();
    people.write_string(0, 3, "Active").unwrap();
    people.write_string(1, 0, "Ada").unwrap();
    people.write_number(1, 1, 36.0).unwrap();
    people.write_number_with_format(1, 2, 45292.0, &date).unwrap(); // 2024-01-01
    people.write_boolean(1, 3, true).unwrap();
    // Row 2 is left empty.
    people.write_string(3, 0, "Grace").unwrap();
    people.write_number(3, 1, 85.0).unwrap();
    people.write_number_with_format(3, 2, 45293.5, &date).unwrap(); // 2024-01-02 12:00
    people.write_boolean(3, 3, false).unwrap();

    let totals = workbook.add_worksheet();
    totals.set_name("Totals").unwrap();
    totals.write_string(0, 0, "Total").unwrap();
    totals.write_number(0, 1, 121.0).unwrap();

    workbook.save_to_buffer().unwrap()
}

/// Mirror of [`build_people_xlsx`] in BIFF8.
pub fn build_people_xls() -> Vec<u8> {
    build_xls(PEOPLE)
}

/// [`build_people_xls`], encrypted under `password`.
pub fn build_encrypted_people_xls(password: &str) -> Vec<u8> {
    build_encrypted_xls(PEOPLE, password)
}

const PEOPLE: &[XlsSheet<'static>] = &[
    (
        "People",
        &[
            (0, 0, XlsCell::Text("Name")),
            (0, 1, XlsCell::Text("Age")),
            (0, 2, XlsCell::Text("Joined")),
            (0, 3, XlsCell::Text("Active")),
            (1, 0, XlsCell::Text("Ada")),
            (1, 1, XlsCell::Number(36.0)),
            (1, 2, XlsCell::Date(45292.0)),
            (1, 3, XlsCell::Bool(true)),
            (3, 0, XlsCell::Text("Grace")),
            (3, 1, XlsCell::Number(85.0)),
            (3, 2, XlsCell::Date(45293.5)),
            (3, 3, XlsCell::Bool(false)),
        ],
    ),
    (
        "Totals",
        &[(0, 0, XlsCell::Text("Total")), (0, 1, XlsCell::Number(121.0))],
    ),
];

/// Wrap `plain` (an OOXML zip) in an Agile-encrypted OLE container.
pub fn encrypt_agile(plain: &[u8], password: &str) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let mut rng = StdRng::from_seed([7u8; 32]);
    let mut agile =
        Ecma376AgileWriter::create(&mut rng, password, &mut cursor).expect("create agile");
    agile.write_all(plain).expect("write plaintext");
    agile.finalize().expect("finalize agile writer");
    cursor.into_inner()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StartDocument,
    EndDocument,
    StartSheet(usize, String),
    EndSheet(usize),
    StartRow(usize, u32),
    EndRow(usize, u32),
    Cell(usize, u32, u32, RawValue<'static>),
    Cancelled,
}

/// Records every callback in order.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Event>,
}

impl Recorder {
    pub fn cells(&self) -> Vec<(usize, u32, u32, RawValue<'static>)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Cell(sheet, row, col, raw) => Some((*sheet, *row, *col, raw.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.events.iter().filter(|e| *e == wanted).count()
    }
}

impl EventHandler for Recorder {
    fn start_document(&mut self) -> HandlerResult {
        self.events.push(Event::StartDocument);
        Ok(())
    }

    fn end_document(&mut self) -> HandlerResult {
        self.events.push(Event::EndDocument);
        Ok(())
    }

    fn start_sheet(&mut self, sheet: usize, name: &str) -> HandlerResult {
        self.events.push(Event::StartSheet(sheet, name.to_string()));
        Ok(())
    }

    fn end_sheet(&mut self, sheet: usize) -> HandlerResult {
        self.events.push(Event::EndSheet(sheet));
        Ok(())
    }

    fn start_row(&mut self, sheet: usize, row: u32) -> HandlerResult {
        self.events.push(Event::StartRow(sheet, row));
        Ok(())
    }

    fn end_row(&mut self, sheet: usize, row: u32) -> HandlerResult {
        self.events.push(Event::EndRow(sheet, row));
        Ok(())
    }

    fn cell(&mut self, sheet: usize, row: u32, col: u32, value: &CellValue<'_>) -> HandlerResult {
        self.events
            .push(Event::Cell(sheet, row, col, value.raw().clone().into_owned()));
        Ok(())
    }

    fn cancelled(&mut self) {
        self.events.push(Event::Cancelled);
    }
}
