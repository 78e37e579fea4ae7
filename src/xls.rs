// SPDX-License-Identifier: MIT

//! Legacy `.xls` pipeline.
//!
//! The `/Workbook` stream of the compound file is a sequence of BIFF
//! records. The stream is organised as consecutive sub-streams, each
//! delimited by BOF..EOF: the globals sub-stream first (sheet list,
//! codepage, the shared image store), then one sub-stream per sheet
//! (holding that sheet's drawing records).

use std::borrow::Cow;
use std::collections::BTreeMap;

use log::{debug, warn};

use crate::cfb::{Cfb, XlsEncoding};
use crate::errors::Error;
use crate::escher;
use crate::utils::read_u16;
use crate::{ImagePosition, RawImage};

const BOF: u16 = 0x0809;
const CONTINUE: u16 = 0x003C;
const CODEPAGE: u16 = 0x0042;
const BOUNDSHEET: u16 = 0x0085;
const MSO_DRAWING_GROUP: u16 = 0x00EB;
const MSO_DRAWING: u16 = 0x00EC;

/// An enum for Xls specific errors
#[derive(Debug)]
pub enum XlsError {
    /// Neither a `Workbook` nor a `Book` stream exists in the compound file
    WorkbookNotFound,
    /// Workbook is password protected
    Password,
}

impl std::fmt::Display for XlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XlsError::WorkbookNotFound => {
                write!(f, "Cannot find a Workbook stream in the compound file")
            }
            XlsError::Password => write!(f, "Workbook is password protected"),
        }
    }
}

impl std::error::Error for XlsError {}

/// Extracts all images of a legacy workbook together with their anchors,
/// ordered by image store index.
pub(crate) fn extract(data: &[u8], filter: Option<&str>) -> Result<Vec<RawImage>, Error> {
    let stream = workbook_stream(data)?;
    let wb = parse_workbook_stream(&stream);

    if let Some(name) = filter {
        if !wb.sheets.iter().any(|s| s == name) {
            return Err(Error::SheetNotFound(name.to_string()));
        }
    }

    let store = escher::read_blip_store(&wb.drawing_group);

    // anchors grouped by image store index
    let mut anchors: BTreeMap<u32, Vec<ImagePosition>> = BTreeMap::new();
    for (sheet_idx, drawing) in &wb.sheet_drawings {
        let Some(sheet) = wb.sheets.get(*sheet_idx) else {
            warn!("drawing records for unknown sheet sub-stream {sheet_idx}");
            continue;
        };
        if filter.is_some_and(|f| f != sheet) {
            continue;
        }
        let mut found = Vec::new();
        escher::collect_picture_anchors(drawing, &mut found);
        for (pib, rect) in found {
            if pib == 0 || pib > store.count {
                warn!("anchor on '{sheet}' references image {pib} outside the store");
                continue;
            }
            anchors.entry(pib).or_default().push(ImagePosition::new(
                sheet.clone(),
                u32::from(rect.from_row),
                u32::from(rect.from_col),
                u32::from(rect.to_row),
                u32::from(rect.to_col),
            ));
        }
    }

    // images without a surviving anchor are not reported for this format
    let mut images = Vec::new();
    for entry in store.entries {
        let Some(positions) = anchors.remove(&entry.index) else {
            continue;
        };
        images.push(RawImage {
            mime: entry.mime,
            bytes: entry.bytes,
            positions,
        });
    }
    Ok(images)
}

/// Lists the workbook's sheet names, in workbook order.
pub(crate) fn sheet_names(data: &[u8]) -> Result<Vec<String>, Error> {
    let stream = workbook_stream(data)?;
    Ok(parse_workbook_stream(&stream).sheets)
}

fn workbook_stream(data: &[u8]) -> Result<Vec<u8>, Error> {
    let cfb = Cfb::new(data)?;
    cfb.get_stream("Workbook")
        .or_else(|_| cfb.get_stream("Book"))
        .map_err(|_| {
            if cfb.has_directory("EncryptedPackage") {
                Error::Xls(XlsError::Password)
            } else {
                Error::Xls(XlsError::WorkbookNotFound)
            }
        })
}

/// The drawing-relevant records of a workbook stream.
struct WorkbookDrawings {
    /// Sheet names in BoundSheet order; sub-stream `i + 1` belongs to
    /// sheet `i`.
    sheets: Vec<String>,
    /// Concatenated MsoDrawingGroup payloads from the globals sub-stream
    drawing_group: Vec<u8>,
    /// Concatenated MsoDrawing payloads, keyed by sheet index
    sheet_drawings: BTreeMap<usize, Vec<u8>>,
}

fn parse_workbook_stream(stream: &[u8]) -> WorkbookDrawings {
    let mut encoding = XlsEncoding::utf16();
    let mut wb = WorkbookDrawings {
        sheets: Vec::new(),
        drawing_group: Vec::new(),
        sheet_drawings: BTreeMap::new(),
    };

    let mut substream = -1isize;
    for record in (RecordIter { stream }) {
        match record.typ {
            BOF => substream += 1,
            CODEPAGE if substream == 0 && record.data.len() >= 2 => {
                let cp = read_u16(&record.data);
                match XlsEncoding::from_codepage(cp) {
                    Ok(e) => encoding = e,
                    Err(e) => warn!("{e}"),
                }
            }
            BOUNDSHEET if substream == 0 => match parse_sheet_name(&record.data, &encoding) {
                Some(name) => wb.sheets.push(name),
                None => warn!("short BoundSheet record"),
            },
            MSO_DRAWING_GROUP if substream == 0 => {
                wb.drawing_group.extend_from_slice(&record.data);
            }
            MSO_DRAWING if substream >= 1 => {
                wb.sheet_drawings
                    .entry(substream as usize - 1)
                    .or_default()
                    .extend_from_slice(&record.data);
            }
            _ => (),
        }
    }
    debug!(
        "workbook stream: {} sheet(s), {} drawing-group byte(s)",
        wb.sheets.len(),
        wb.drawing_group.len()
    );
    wb
}

/// BoundSheet8: a 4-byte stream position and 2 flag bytes, then the
/// sheet name as a short string (1-byte length, 1-byte flags).
fn parse_sheet_name(r: &[u8], encoding: &XlsEncoding) -> Option<String> {
    if r.len() < 8 {
        return None;
    }
    let len = r[6] as usize;
    let mut encoding = encoding.clone();
    if encoding.high_byte.is_some() {
        encoding.high_byte = Some(r[7] & 0x1 != 0);
    }
    let mut name = String::new();
    encoding.decode_to(&r[8..], len, &mut name);
    Some(name)
}

struct Record<'a> {
    typ: u16,
    data: Cow<'a, [u8]>,
}

/// Iterates `(type, length, data)` BIFF records, splicing the payload
/// of Continue records onto the preceding record so that downstream
/// consumers never see the split.
struct RecordIter<'a> {
    stream: &'a [u8],
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (t, mut data) = loop {
            if self.stream.len() < 4 {
                return None;
            }
            let t = read_u16(self.stream);
            let len = read_u16(&self.stream[2..]) as usize;
            if self.stream.len() < len + 4 {
                warn!("record 0x{t:04X} overruns the stream, ending parse");
                self.stream = &[];
                return None;
            }
            let (rec, next) = self.stream.split_at(len + 4);
            self.stream = next;
            if t != CONTINUE {
                break (t, rec);
            }
            // a Continue with no predecessor carries nothing to splice onto
            debug!("ignoring leading Continue record");
        };

        // append the data of any following Continue records
        let cow = if self.stream.len() >= 4 && read_u16(self.stream) == CONTINUE {
            let mut c = data[4..].to_vec();
            while self.stream.len() >= 4 && read_u16(self.stream) == CONTINUE {
                let len = read_u16(&self.stream[2..]) as usize;
                if self.stream.len() < len + 4 {
                    warn!("Continue record overruns the stream, ending parse");
                    self.stream = &[];
                    break;
                }
                let sp = self.stream.split_at(len + 4);
                data = sp.0;
                self.stream = sp.1;
                c.extend_from_slice(&data[4..]);
            }
            Cow::Owned(c)
        } else {
            Cow::Borrowed(&data[4..])
        };

        Some(Record { typ: t, data: cow })
    }
}
