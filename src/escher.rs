// SPDX-License-Identifier: MIT

//! Office-Art (Escher) record walking and image payload decoding.
//!
//! Drawing data inside a BIFF workbook is a tree of variable-length
//! records; a record whose version nibble is 0x0F is a container and
//! its payload holds further records. [`ArtRecordIter`] walks one
//! container level and leaves recursion to the caller, which keeps the
//! image-store and anchor code local and testable.

use std::io::Read;

use log::{debug, warn};

use crate::utils::{read_i32, read_u16, read_u32};
use crate::ImageMime;

const DGG_CONTAINER: u16 = 0xF000;
const BSTORE_CONTAINER: u16 = 0xF001;
const SP_CONTAINER: u16 = 0xF004;
const BSE: u16 = 0xF007;
const SP: u16 = 0xF00A;
const OPT: u16 = 0xF00B;
const CLIENT_ANCHOR: u16 = 0xF010;
const OPT2: u16 = 0xF122;

/// The pib property: a 1-based index into the workbook's image store.
const PROP_PIB: u16 = 0x0104;

/// One Office-Art record at a single container level.
pub(crate) struct ArtRecord<'a> {
    pub version: u8,
    pub instance: u16,
    pub typ: u16,
    pub data: &'a [u8],
}

impl ArtRecord<'_> {
    pub fn is_container(&self) -> bool {
        self.version == 0x0F
    }
}

/// Iterator over the records of one container level.
///
/// A record whose declared length exceeds the remaining bytes ends the
/// iteration; records already yielded stand.
pub(crate) struct ArtRecordIter<'a> {
    rest: &'a [u8],
}

impl<'a> ArtRecordIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ArtRecordIter { rest: data }
    }
}

impl<'a> Iterator for ArtRecordIter<'a> {
    type Item = ArtRecord<'a>;

    fn next(&mut self) -> Option<ArtRecord<'a>> {
        if self.rest.len() < 8 {
            return None;
        }
        let ver_inst = read_u16(self.rest);
        let typ = read_u16(&self.rest[2..]);
        let len = read_i32(&self.rest[4..]);
        if len < 0 || self.rest.len() - 8 < len as usize {
            warn!("record 0x{typ:04X} overruns its container, ending level");
            self.rest = &[];
            return None;
        }
        let (data, rest) = self.rest[8..].split_at(len as usize);
        self.rest = rest;
        Some(ArtRecord {
            version: (ver_inst & 0x000F) as u8,
            instance: ver_inst >> 4,
            typ,
            data,
        })
    }
}

fn find_container(data: &[u8], typ: u16) -> Option<&[u8]> {
    ArtRecordIter::new(data)
        .find(|r| r.typ == typ && r.is_container())
        .map(|r| r.data)
}

/// The workbook's global image store.
pub(crate) struct BlipStore {
    /// Count of BSE records seen, including unparseable ones; anchors
    /// referencing an index above this are invalid.
    pub count: u32,
    pub entries: Vec<BseEntry>,
}

/// One decoded entry of the image store.
pub(crate) struct BseEntry {
    /// 1-based position within the store
    pub index: u32,
    pub mime: ImageMime,
    pub bytes: Vec<u8>,
}

/// Walks DggContainer -> BStoreContainer and decodes every BSE record.
pub(crate) fn read_blip_store(drawing_group: &[u8]) -> BlipStore {
    let mut store = BlipStore {
        count: 0,
        entries: Vec::new(),
    };
    let Some(dgg) = find_container(drawing_group, DGG_CONTAINER) else {
        return store;
    };
    let Some(bstore) = find_container(dgg, BSTORE_CONTAINER) else {
        return store;
    };
    for rec in ArtRecordIter::new(bstore) {
        if rec.typ != BSE {
            continue;
        }
        store.count += 1;
        match read_bse(rec.data) {
            Some((mime, bytes)) => store.entries.push(BseEntry {
                index: store.count,
                mime,
                bytes,
            }),
            None => warn!("skipping image store entry {}: short payload", store.count),
        }
    }
    store
}

/// Decodes the BLIP embedded in a BSE payload.
///
/// The fixed 36-byte BSE header is followed by an optional name of
/// `cbName` bytes, then the BLIP record itself.
fn read_bse(data: &[u8]) -> Option<(ImageMime, Vec<u8>)> {
    if data.len() < 36 {
        return None;
    }
    let cb_name = data[33] as usize;
    let blip = data.get(36 + cb_name..)?;
    decode_blip(&ArtRecordIter::new(blip).next()?)
}

/// Strips the per-type BLIP prelude and returns the image bytes.
///
/// Every BLIP starts with a 16-byte UID; a second UID follows for the
/// record instances that flag one. Metafiles then carry a 34-byte
/// metafile header and a possibly zlib-compressed body; bitmaps carry
/// a single tag byte before the raw data.
pub(crate) fn decode_blip(rec: &ArtRecord<'_>) -> Option<(ImageMime, Vec<u8>)> {
    let (mime, prelude) = match rec.typ {
        0xF01A | 0xF01B | 0xF01C => {
            let mime = match rec.typ {
                0xF01A => ImageMime::Emf,
                0xF01B => ImageMime::Wmf,
                _ => ImageMime::Pict,
            };
            let double = matches!(rec.instance, 0x3D5 | 0x217 | 0x543);
            let skip = 16 + if double { 16 } else { 0 } + 34;
            let body = rec.data.get(skip..)?;
            return Some((mime, inflate_or_raw(body)));
        }
        0xF01D | 0xF02A => (
            ImageMime::Jpeg,
            17 + if matches!(rec.instance, 0x46B | 0x6E3) { 16 } else { 0 },
        ),
        0xF01E => (ImageMime::Png, 17 + if rec.instance == 0x6E1 { 16 } else { 0 }),
        0xF01F => (ImageMime::Bmp, 17 + if rec.instance == 0x7A9 { 16 } else { 0 }),
        0xF029 => (ImageMime::Tiff, 17 + if rec.instance == 0x6E5 { 16 } else { 0 }),
        _ => (ImageMime::Unknown, 17),
    };
    let body = rec.data.get(prelude..)?;
    Some((mime, body.to_vec()))
}

/// Metafile bodies may be deflated; keep the raw bytes when they are not.
fn inflate_or_raw(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    match flate2::read::ZlibDecoder::new(body).read_to_end(&mut out) {
        Ok(_) => out,
        Err(_) => body.to_vec(),
    }
}

/// A shape's cell rectangle, corners inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AnchorRect {
    pub from_col: u16,
    pub from_row: u16,
    pub to_col: u16,
    pub to_row: u16,
}

/// What an OPT property table says about a shape.
pub(crate) enum ShapeKind {
    /// A picture, holding the 1-based image store index
    Picture(u32),
    Other,
}

/// Scans an OPT/FOPT property table; `instance` is the entry count.
pub(crate) fn parse_shape_properties(instance: u16, data: &[u8]) -> ShapeKind {
    let mut rest = data;
    for _ in 0..instance {
        if rest.len() < 6 {
            break;
        }
        // the two high bits flag blip ids and complex values
        let prop = read_u16(rest) & 0x3FFF;
        let value = read_i32(&rest[2..]);
        if prop == PROP_PIB && value > 0 {
            return ShapeKind::Picture(value as u32);
        }
        rest = &rest[6..];
    }
    ShapeKind::Other
}

/// Parses a ClientAnchor payload: a 2-byte flag field, then four
/// `(index, intra-cell offset)` pairs of 16-bit values.
pub(crate) fn parse_client_anchor(data: &[u8]) -> Option<AnchorRect> {
    if data.len() < 18 {
        return None;
    }
    Some(AnchorRect {
        from_col: read_u16(&data[2..]),
        from_row: read_u16(&data[6..]),
        to_col: read_u16(&data[10..]),
        to_row: read_u16(&data[14..]),
    })
}

/// Recursively walks a sheet's drawing data and collects, for every
/// picture shape, its image store index and cell rectangle.
pub(crate) fn collect_picture_anchors(drawing: &[u8], out: &mut Vec<(u32, AnchorRect)>) {
    for rec in ArtRecordIter::new(drawing) {
        if rec.typ == SP_CONTAINER && rec.is_container() {
            if let Some(anchor) = read_picture_shape(rec.data) {
                out.push(anchor);
            }
        } else if rec.is_container() {
            collect_picture_anchors(rec.data, out);
        }
    }
}

/// An SpContainer yields an anchor iff it has both a ClientAnchor and
/// a positive image index; anything else is not a picture.
fn read_picture_shape(shape: &[u8]) -> Option<(u32, AnchorRect)> {
    let mut anchor = None;
    let mut pib = None;
    for rec in ArtRecordIter::new(shape) {
        match rec.typ {
            SP if rec.data.len() >= 4 => debug!("shape id {}", read_u32(rec.data)),
            CLIENT_ANCHOR => anchor = parse_client_anchor(rec.data),
            OPT | OPT2 => {
                if let ShapeKind::Picture(index) = parse_shape_properties(rec.instance, rec.data) {
                    pib = Some(index);
                }
            }
            _ => (),
        }
    }
    Some((pib?, anchor?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: u8, instance: u16, typ: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(&((instance << 4) | version as u16).to_le_bytes());
        out.extend_from_slice(&typ.to_le_bytes());
        out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn png_blip(png: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8; 16]; // UID
        payload.push(0xFF); // tag
        payload.extend_from_slice(png);
        record(0, 0x6E0, 0xF01E, &payload)
    }

    fn bse(blip: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8; 36];
        payload[0] = 0x06; // btWin32 = PNG
        payload[1] = 0x06;
        payload.extend_from_slice(blip);
        record(2, 6, BSE, &payload)
    }

    #[test]
    fn test_level_iteration() {
        let mut data = record(2, 0, SP, &[1, 2, 3, 4]);
        data.extend(record(3, 1, OPT, &[5, 6, 7, 8, 9, 10]));
        let records: Vec<_> = ArtRecordIter::new(&data).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].typ, SP);
        assert_eq!(records[0].version, 2);
        assert!(!records[0].is_container());
        assert_eq!(records[1].typ, OPT);
        assert_eq!(records[1].instance, 1);
    }

    #[test]
    fn test_overrunning_record_ends_level() {
        let mut data = record(0, 0, CLIENT_ANCHOR, &[0; 18]);
        // second record declares more bytes than remain
        data.extend_from_slice(&[0x00, 0x00, 0x0A, 0xF0, 0xFF, 0x00, 0x00, 0x00]);
        let records: Vec<_> = ArtRecordIter::new(&data).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].typ, CLIENT_ANCHOR);
    }

    #[test]
    fn test_container_flag() {
        let inner = record(2, 0, SP, &[0; 4]);
        let container = record(0x0F, 0, SP_CONTAINER, &inner);
        let rec = ArtRecordIter::new(&container).next().unwrap();
        assert!(rec.is_container());
        assert_eq!(ArtRecordIter::new(rec.data).next().unwrap().typ, SP);
    }

    #[test]
    fn test_client_anchor() {
        let mut payload = Vec::new();
        for v in [2u16, 1, 0, 3, 0, 5, 0, 4, 0] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let rect = parse_client_anchor(&payload).unwrap();
        assert_eq!(
            rect,
            AnchorRect {
                from_col: 1,
                from_row: 3,
                to_col: 5,
                to_row: 4
            }
        );
        assert!(parse_client_anchor(&payload[..17]).is_none());
    }

    #[test]
    fn test_shape_properties() {
        // pib carries the fBid flag in its high bits
        let mut table = Vec::new();
        table.extend_from_slice(&0x017Fu16.to_le_bytes());
        table.extend_from_slice(&1i32.to_le_bytes());
        table.extend_from_slice(&0x4104u16.to_le_bytes());
        table.extend_from_slice(&3i32.to_le_bytes());
        match parse_shape_properties(2, &table) {
            ShapeKind::Picture(index) => assert_eq!(index, 3),
            ShapeKind::Other => panic!("expected a picture"),
        }
        assert!(matches!(
            parse_shape_properties(1, &table),
            ShapeKind::Other
        ));
    }

    #[test]
    fn test_decode_png_blip() {
        let png = b"\x89PNG\r\n\x1a\nxxxx";
        let data = png_blip(png);
        let rec = ArtRecordIter::new(&data).next().unwrap();
        let (mime, bytes) = decode_blip(&rec).unwrap();
        assert_eq!(mime, ImageMime::Png);
        assert_eq!(bytes, png);
    }

    #[test]
    fn test_decode_blip_double_uid() {
        let jpeg = b"\xFF\xD8\xFFrest";
        let mut payload = vec![0u8; 32]; // two UIDs
        payload.push(0xFF);
        payload.extend_from_slice(jpeg);
        let data = record(0, 0x46B, 0xF01D, &payload);
        let rec = ArtRecordIter::new(&data).next().unwrap();
        let (mime, bytes) = decode_blip(&rec).unwrap();
        assert_eq!(mime, ImageMime::Jpeg);
        assert_eq!(bytes, jpeg);
    }

    #[test]
    fn test_decode_blip_underflow() {
        let data = record(0, 0x6E0, 0xF01E, &[0u8; 10]);
        let rec = ArtRecordIter::new(&data).next().unwrap();
        assert!(decode_blip(&rec).is_none());
    }

    #[test]
    fn test_unknown_blip_type() {
        let mut payload = vec![0u8; 17];
        payload.extend_from_slice(b"mystery");
        let data = record(0, 0, 0xF0FF, &payload);
        let rec = ArtRecordIter::new(&data).next().unwrap();
        let (mime, bytes) = decode_blip(&rec).unwrap();
        assert_eq!(mime, ImageMime::Unknown);
        assert_eq!(bytes, b"mystery");
    }

    #[test]
    fn test_blip_store_walk() {
        let png = b"\x89PNGdata";
        let bstore = record(0x0F, 1, BSTORE_CONTAINER, &bse(&png_blip(png)));
        let dgg = record(0x0F, 0, DGG_CONTAINER, &bstore);
        let store = read_blip_store(&dgg);
        assert_eq!(store.count, 1);
        assert_eq!(store.entries.len(), 1);
        assert_eq!(store.entries[0].index, 1);
        assert_eq!(store.entries[0].mime, ImageMime::Png);
        assert_eq!(store.entries[0].bytes, png);
    }

    #[test]
    fn test_malformed_bse_counts_but_is_skipped() {
        let good = bse(&png_blip(b"img"));
        let mut children = record(2, 6, BSE, &[0u8; 10]); // too short
        children.extend(good);
        let bstore = record(0x0F, 2, BSTORE_CONTAINER, &children);
        let dgg = record(0x0F, 0, DGG_CONTAINER, &bstore);
        let store = read_blip_store(&dgg);
        assert_eq!(store.count, 2);
        assert_eq!(store.entries.len(), 1);
        assert_eq!(store.entries[0].index, 2);
    }

    #[test]
    fn test_collect_picture_anchors() {
        let sp = record(2, 2, SP, &[7, 0, 0, 0, 0, 0, 0, 0]);
        let mut opt = Vec::new();
        opt.extend_from_slice(&0x4104u16.to_le_bytes());
        opt.extend_from_slice(&1i32.to_le_bytes());
        let opt = record(3, 1, OPT, &opt);
        let mut anchor = Vec::new();
        for v in [0u16, 0, 0, 0, 0, 3, 0, 4, 0] {
            anchor.extend_from_slice(&v.to_le_bytes());
        }
        let anchor = record(0, 0, CLIENT_ANCHOR, &anchor);

        let mut shape = sp.clone();
        shape.extend(opt);
        shape.extend(anchor);
        let sp_container = record(0x0F, 0, SP_CONTAINER, &shape);

        // a second shape without an OPT table must contribute nothing
        let mut bare = sp;
        let mut a2 = Vec::new();
        for v in [0u16, 1, 0, 1, 0, 2, 0, 2, 0] {
            a2.extend_from_slice(&v.to_le_bytes());
        }
        bare.extend(record(0, 0, CLIENT_ANCHOR, &a2));
        let bare_container = record(0x0F, 0, SP_CONTAINER, &bare);

        let mut spgr = sp_container;
        spgr.extend(bare_container);
        let spgr = record(0x0F, 0, 0xF003, &spgr);
        let dg = record(0x0F, 0, 0xF002, &spgr);

        let mut found = Vec::new();
        collect_picture_anchors(&dg, &mut found);
        assert_eq!(found.len(), 1);
        let (pib, rect) = found[0];
        assert_eq!(pib, 1);
        assert_eq!(
            rect,
            AnchorRect {
                from_col: 0,
                from_row: 0,
                to_col: 3,
                to_row: 4
            }
        );
    }
}
